//! V4L2 camera input.
//!
use rscam::{Camera, Config};

use super::{FrameSource, SourceError};

const FORMAT: &[u8] = b"MJPG";

/// Initialized, streaming camera. Stops streaming when dropped.
pub struct CameraSource {
    cam: Camera,
}

impl CameraSource {
    /// Open `device_name` with its highest MJPG resolution and frame rate.
    pub fn new(device_name: &str) -> Result<Self, SourceError> {
        let mut cam = Camera::new(device_name)
            .map_err(|err| SourceError::Camera(format!("{device_name}: {err}")))?;

        let resolution = get_max_resolution(&cam)?;
        let interval = get_max_frame_rate(&cam, resolution)?;

        cam.start(&Config {
            interval,
            resolution,
            format: FORMAT,
            ..Default::default()
        })
        .map_err(|err| SourceError::Camera(format!("{device_name}: {err}")))?;

        log::info!(
            "Using camera {} at {}x{}, interval {}/{}",
            device_name,
            resolution.0,
            resolution.1,
            interval.0,
            interval.1
        );

        Ok(Self { cam })
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Option<image::RgbImage>, SourceError> {
        match self.cam.capture() {
            Ok(frame) => {
                let image =
                    image::load_from_memory_with_format(&frame[..], image::ImageFormat::Jpeg)?;
                Ok(Some(image.to_rgb8()))
            }
            Err(err) => {
                log::error!("Error capturing frame: {err}");
                Ok(None)
            }
        }
    }
}

/// Get the maximum supported resolution.
fn get_max_resolution(cam: &Camera) -> Result<(u32, u32), SourceError> {
    let resolution_info = cam
        .resolutions(FORMAT)
        .map_err(|err| SourceError::Camera(err.to_string()))?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .into_iter()
            // Get the highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| SourceError::Camera("no resolution found".into()))
}

/// Get the maximum supported frame rate for the given resolution.
fn get_max_frame_rate(cam: &Camera, resolution: (u32, u32)) -> Result<(u32, u32), SourceError> {
    let interval_info = cam
        .intervals(FORMAT, resolution)
        .map_err(|err| SourceError::Camera(err.to_string()))?;
    log::debug!("Found frame intervals: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) seconds per frame, the shortest one wins
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .into_iter()
            .min_by(|a, b| (a.0 as f64 / a.1 as f64).total_cmp(&(b.0 as f64 / b.1 as f64))),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| SourceError::Camera("no frame rate found".into()))
}
