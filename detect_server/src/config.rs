//! Command line configuration.
//!
use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};

use crate::nn::YoloParams;

/// One day.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// How rendered still-image results are named.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum ResultNaming {
    /// Every request writes its result to a freshly generated name and keeps the upload.
    #[default]
    Unique,
    /// Every request overwrites the same result file and deletes the upload right away.
    /// Meant for single-user deployments, concurrent requests race on the result.
    Fixed,
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Object detection on images, videos and webcam streams")]
pub struct Args {
    /// Address to serve HTTP on
    #[clap(long, default_value = "127.0.0.1:5000")]
    pub address: String,

    /// Directory for uploaded and rendered files
    #[clap(long, default_value = "static")]
    pub storage_dir: PathBuf,

    /// ONNX model file (YOLOv8 export)
    #[clap(long, default_value = "yolov8n.onnx")]
    pub model: PathBuf,

    /// URL to download the model from when the model file does not exist
    #[clap(long)]
    pub model_url: Option<String>,

    /// File with one class name per line, COCO classes if not given
    #[clap(long)]
    pub labels: Option<PathBuf>,

    /// TrueType font for box labels, boxes are drawn without labels if not given
    #[clap(long)]
    pub font: Option<PathBuf>,

    /// Side length of the square model input
    #[clap(long, default_value_t = 640)]
    pub input_size: u32,

    /// Minimum confidence of a detection
    #[clap(long, default_value_t = 0.25)]
    pub min_confidence: f32,

    /// Maximum overlap of two detections of the same class
    #[clap(long, default_value_t = 0.45)]
    pub max_iou: f32,

    /// Quality of encoded JPEG frames and results
    #[clap(long, default_value_t = 80)]
    pub jpeg_quality: u8,

    /// Naming of still-image results
    #[clap(long, value_enum, default_value_t = ResultNaming::Unique)]
    pub result_naming: ResultNaming,

    /// Seconds between two sweeps of the storage directory
    #[clap(
        long,
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sweep_interval_secs: u64,

    /// Start the storage sweeper at boot instead of on the first `/delete` request
    #[clap(long)]
    pub sweep_on_start: bool,

    /// Camera device for the live feed
    #[clap(long, default_value = "/dev/video0")]
    pub camera: String,

    /// Maximum size of an upload in bytes
    #[clap(long, default_value_t = 200 * 1024 * 1024)]
    pub max_upload_bytes: usize,
}

impl Args {
    pub fn yolo_params(&self) -> YoloParams {
        YoloParams {
            width: self.input_size,
            height: self.input_size,
            min_confidence: self.min_confidence,
            max_iou: self.max_iou,
        }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            jpeg_quality: self.jpeg_quality,
            result_naming: self.result_naming,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            camera: self.camera.clone(),
            max_upload_bytes: self.max_upload_bytes,
        }
    }
}

/// Runtime settings of the request handlers.
#[derive(Clone, Debug)]
pub struct Settings {
    pub jpeg_quality: u8,
    pub result_naming: ResultNaming,
    pub sweep_interval: Duration,
    pub camera: String,
    pub max_upload_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            result_naming: ResultNaming::Unique,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            camera: "/dev/video0".into(),
            max_upload_bytes: 200 * 1024 * 1024,
        }
    }
}
