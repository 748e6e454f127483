//! Object detection models.
//!
//! The server only depends on the [`Detector`] trait. [`YoloModel`] runs a YOLOv8-style ONNX
//! export through tract: one output of shape `[1, 4 + classes, anchors]` with boxes given as
//! `(cx, cy, w, h)` in input pixels followed by one score per class.
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Class names of the COCO dataset, used when no label file is given.
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// A detected object.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`, normalized to `0..=1`.
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: usize,
    pub label: String,
}

/// Anything that finds objects in an image.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>>;
}

/// Tunables of the YOLO pre- and postprocessing.
#[derive(Clone, Debug)]
pub struct YoloParams {
    pub width: u32,
    pub height: u32,
    pub min_confidence: f32,
    pub max_iou: f32,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 640,
            min_confidence: 0.25,
            max_iou: 0.45,
        }
    }
}

pub struct YoloModel {
    model: NnModel,
    params: YoloParams,
    labels: Vec<String>,
}

impl YoloModel {
    pub fn new(model_path: &Path, labels: Vec<String>, params: YoloParams) -> Result<Self> {
        let model = get_yolo_model(model_path, &params)
            .with_context(|| format!("failed to load model {}", model_path.display()))?;
        log::info!(
            "Loaded model {} ({}x{}, {} classes)",
            model_path.display(),
            params.width,
            params.height,
            labels.len()
        );
        Ok(Self {
            model,
            params,
            labels,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            self.params.width,
            self.params.height,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.params.height as usize, self.params.width as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }
}

impl Detector for YoloModel {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let valid_input = tvec!(self.preproc(image).into());
        let raw_nn_out = self.model.run(valid_input)?;
        let output = raw_nn_out.first().context("model produced no output")?;

        postproc(output, &self.params, &self.labels)
    }
}

/// Read class names from a file with one name per line, falling back to COCO.
pub fn load_labels(path: Option<&Path>) -> Result<Vec<String>> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read labels {}", path.display()))?;
            let labels: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_owned)
                .collect();
            if labels.is_empty() {
                bail!("label file {} is empty", path.display());
            }
            Ok(labels)
        }
        None => Ok(COCO_CLASSES.iter().map(|&label| label.to_owned()).collect()),
    }
}

fn get_yolo_model(model_path: &Path, params: &YoloParams) -> Result<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, 3, params.height as usize, params.width as usize),
    );
    let model = tract_onnx::onnx()
        .model_for_path(model_path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

/// Turn the raw `[1, 4 + classes, anchors]` output into detections.
fn postproc(output: &Tensor, params: &YoloParams, labels: &[String]) -> Result<Vec<Detection>> {
    let output = output
        .to_array_view::<f32>()?
        .slice_move(tract_ndarray::s![0, .., ..])
        .into_dimensionality::<tract_ndarray::Ix2>()?;

    let num_classes = match output.shape()[0].checked_sub(4) {
        Some(n) if n > 0 => n,
        _ => bail!("unexpected output shape {:?}", output.shape()),
    };
    log::debug!(
        "Decoding {} anchors with {} classes",
        output.shape()[1],
        num_classes
    );

    let (width, height) = (params.width as f32, params.height as f32);

    let mut candidates: Vec<Detection> = output
        .axis_iter(tract_ndarray::Axis(1))
        .filter_map(|anchor| {
            let (class_id, confidence) = anchor
                .iter()
                .skip(4)
                .cloned()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            if confidence <= params.min_confidence {
                return None;
            }

            let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
            let bbox = [
                (cx - w / 2.0) / width,
                (cy - h / 2.0) / height,
                (cx + w / 2.0) / width,
                (cy + h / 2.0) / height,
            ]
            .map(|v| v.clamp(0.0, 1.0));

            let label = labels
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class {class_id}"));

            Some(Detection {
                bbox,
                confidence,
                class_id,
                label,
            })
        })
        .collect();

    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    Ok(non_maximum_suppression(candidates, params.max_iou))
}

/// Run non-maximum-suppression on candidate detections.
///
/// Start with the most confident detection and iterate over all others in the order of sinking
/// confidence. Grow the selection by adding only those candidates which do not overlap an
/// already chosen detection of the same class by more than `max_iou`. Expects the candidates
/// sorted by ascending confidence.
fn non_maximum_suppression(mut sorted_candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    let mut selected: Vec<Detection> = vec![];
    'candidates: while let Some(candidate) = sorted_candidates.pop() {
        for chosen in selected.iter() {
            if chosen.class_id == candidate.class_id && iou(&candidate.bbox, &chosen.bbox) > max_iou
            {
                continue 'candidates;
            }
        }

        selected.push(candidate)
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the top left corner of the overlap box lies below and to the
    // right of its bottom right corner and the area is zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as four-element array defining two points:
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
/// If the bounding box is ill-defined by having the bottom-right point above/to the left of the
/// top-left point, the area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
