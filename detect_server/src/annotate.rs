//! Rendering of detections onto frames.
use std::{io::Cursor, path::Path};

use anyhow::{Context, Result};
use image::{codecs::jpeg::JpegEncoder, ColorType, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::nn::Detection;

const PALETTE: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [52, 69, 147],
];

const LABEL_SCALE: Scale = Scale { x: 16.0, y: 16.0 };

/// An image together with the objects detected on it.
pub struct DetectionResult {
    pub image: RgbImage,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    /// Render the annotated raster. The result has the dimensions of the source image.
    pub fn plot(self, annotator: &Annotator) -> RgbImage {
        annotator.draw(self.image, &self.detections)
    }
}

/// Draws bounding boxes with class labels and confidences.
pub struct Annotator {
    font: Option<Font<'static>>,
}

impl Annotator {
    /// Annotator drawing boxes only.
    pub fn new() -> Self {
        Self { font: None }
    }

    /// Annotator which also writes labels, using the TrueType font at `path`.
    pub fn with_font(path: &Path) -> Result<Self> {
        let font_data = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = Font::try_from_vec(font_data)
            .with_context(|| format!("invalid font {}", path.display()))?;
        Ok(Self { font: Some(font) })
    }

    pub fn draw(&self, mut frame: RgbImage, detections: &[Detection]) -> RgbImage {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return frame;
        }
        let (w, h) = (width as f32, height as f32);

        for detection in detections {
            let color = Rgb(PALETTE[detection.class_id % PALETTE.len()]);
            let bbox = detection.bbox;

            // Coordinate frame basis is on the top left corner
            let x_tl = (bbox[0] * w).clamp(0.0, w - 1.0) as i32;
            let y_tl = (bbox[1] * h).clamp(0.0, h - 1.0) as i32;
            let x_br = (bbox[2] * w).clamp(0.0, w - 1.0) as i32;
            let y_br = (bbox[3] * h).clamp(0.0, h - 1.0) as i32;
            let rect_width = (x_br - x_tl).max(1) as u32;
            let rect_height = (y_br - y_tl).max(1) as u32;

            draw_hollow_rect_mut(
                &mut frame,
                Rect::at(x_tl, y_tl).of_size(rect_width, rect_height),
                color,
            );
            if rect_width > 2 && rect_height > 2 {
                draw_hollow_rect_mut(
                    &mut frame,
                    Rect::at(x_tl + 1, y_tl + 1).of_size(rect_width - 2, rect_height - 2),
                    color,
                );
            }

            if let Some(font) = &self.font {
                let text = format!("{} {:.2}", detection.label, detection.confidence);
                let (text_width, text_height) = text_size(LABEL_SCALE, font, &text);
                let label_y = (y_tl - text_height - 2).max(0);
                draw_filled_rect_mut(
                    &mut frame,
                    Rect::at(x_tl, label_y)
                        .of_size(text_width.max(1) as u32 + 4, text_height.max(1) as u32 + 2),
                    color,
                );
                draw_text_mut(
                    &mut frame,
                    Rgb([255, 255, 255]),
                    x_tl + 2,
                    label_y + 1,
                    LABEL_SCALE,
                    font,
                    &text,
                );
            }
        }

        frame
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}

/// Compress a frame to JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let (width, height) = frame.dimensions();

    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(frame.as_raw(), width, height, ColorType::Rgb8)
        .context("failed to encode jpeg")?;

    Ok(buf.into_inner())
}
