//! Sources of frames for the streamed endpoints.
//!
//! Uploaded videos are decoded in-process for animated GIFs, motion-JPEG files (concatenated
//! JPEGs) and still images. Other containers need the `ffmpeg` feature, the live feed needs the
//! `camera` feature.
use std::{fmt, io::Cursor};

use image::{codecs::gif::GifDecoder, AnimationDecoder, DynamicImage, Frames, RgbImage};
use thiserror::Error;

use crate::storage::{AssetId, Storage, StorageError};

#[cfg(feature = "camera")]
mod camera;
#[cfg(feature = "ffmpeg")]
mod video;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported video format {0:?}")]
    Unsupported(Option<String>),
    #[error("failed to open video: {0}")]
    Open(String),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("camera unavailable: {0}")]
    Camera(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Where the frames of a stream come from.
#[derive(Clone, Debug)]
pub enum VideoInput {
    /// An uploaded file, deleted once its stream ends.
    Asset(AssetId),
    /// A camera device such as `/dev/video0`.
    Camera(String),
}

impl fmt::Display for VideoInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoInput::Asset(id) => write!(f, "video {id}"),
            VideoInput::Camera(device) => write!(f, "camera {device}"),
        }
    }
}

/// Sequential frame reader. Dropping the source releases the underlying handle.
pub trait FrameSource {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError>;
}

/// Open the source for `input`.
pub fn open(input: &VideoInput, storage: &dyn Storage) -> Result<Box<dyn FrameSource>, SourceError> {
    match input {
        VideoInput::Asset(id) => open_asset(id, storage),
        VideoInput::Camera(device) => open_camera(device),
    }
}

fn open_asset(id: &AssetId, storage: &dyn Storage) -> Result<Box<dyn FrameSource>, SourceError> {
    let ext = id.extension();
    log::debug!("Opening {} as {:?}", id, ext);

    match ext.as_deref() {
        Some("gif") => Ok(Box::new(GifSource::new(storage.get(id)?)?)),
        Some("mjpg" | "mjpeg") => Ok(Box::new(MjpegSource::new(storage.get(id)?)?)),
        Some("jpg" | "jpeg" | "png" | "bmp" | "webp") => {
            Ok(Box::new(StillSource::new(&storage.get(id)?)?))
        }
        #[cfg(feature = "ffmpeg")]
        _ => {
            let path = storage
                .local_path(id)
                .ok_or_else(|| SourceError::Open(format!("{id} has no local path")))?;
            if !path.exists() {
                return Err(StorageError::NotFound(id.clone()).into());
            }
            Ok(Box::new(video::FfmpegSource::new(&path)?))
        }
        #[cfg(not(feature = "ffmpeg"))]
        _ => {
            // Report a missing asset before an unsupported one
            storage.get(id)?;
            Err(SourceError::Unsupported(ext))
        }
    }
}

#[cfg(feature = "camera")]
fn open_camera(device: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(Box::new(camera::CameraSource::new(device)?))
}

#[cfg(not(feature = "camera"))]
fn open_camera(device: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::Camera(format!(
        "cannot open {device}, built without camera support"
    )))
}

/// Frames of an animated GIF.
pub struct GifSource {
    frames: Frames<'static>,
}

impl GifSource {
    pub fn new(data: Vec<u8>) -> Result<Self, SourceError> {
        let decoder = GifDecoder::new(Cursor::new(data))?;
        Ok(Self {
            frames: decoder.into_frames(),
        })
    }
}

impl FrameSource for GifSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        match self.frames.next() {
            Some(Ok(frame)) => Ok(Some(DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8())),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }
}

/// Frames of a motion-JPEG file, i.e. JPEG images written back to back.
pub struct MjpegSource {
    data: Vec<u8>,
    position: usize,
}

const SOI: [u8; 2] = [0xff, 0xd8];
const EOI: [u8; 2] = [0xff, 0xd9];

impl MjpegSource {
    pub fn new(data: Vec<u8>) -> Result<Self, SourceError> {
        if find_marker(&data, SOI, 0).is_none() {
            return Err(SourceError::Open("no JPEG frame found".into()));
        }
        Ok(Self { data, position: 0 })
    }
}

impl FrameSource for MjpegSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        let start = match find_marker(&self.data, SOI, self.position) {
            Some(start) => start,
            None => return Ok(None),
        };
        let end = match jpeg_end(&self.data, start) {
            Some(end) => end,
            None => {
                log::warn!("Truncated frame at offset {start}");
                self.position = self.data.len();
                return Ok(None);
            }
        };
        self.position = end;

        let frame = image::load_from_memory_with_format(
            &self.data[start..end],
            image::ImageFormat::Jpeg,
        )?;
        Ok(Some(frame.to_rgb8()))
    }
}

/// Offset just past the EOI marker of the JPEG starting at `start`.
///
/// Walks the marker segments by their length fields, so a thumbnail embedded in an APPn segment
/// does not end the frame early. Entropy-coded data after SOS is scanned for the next marker.
fn jpeg_end(data: &[u8], start: usize) -> Option<usize> {
    let mut pos = start + SOI.len();

    loop {
        if *data.get(pos)? != 0xff {
            return None;
        }
        // Any number of fill bytes may precede a marker
        while *data.get(pos + 1)? == 0xff {
            pos += 1;
        }

        match data[pos + 1] {
            0xd9 => return Some(pos + EOI.len()),
            // Standalone markers without a length
            0x01 | 0xd0..=0xd7 => pos += 2,
            marker => {
                let len = u16::from_be_bytes([*data.get(pos + 2)?, *data.get(pos + 3)?]) as usize;
                pos += 2 + len;
                if marker == 0xda {
                    pos = scan_entropy_coded(data, pos)?;
                }
            }
        }
    }
}

/// Offset of the first marker after entropy-coded data starting at `from`.
fn scan_entropy_coded(data: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    loop {
        match (*data.get(pos)?, *data.get(pos + 1)?) {
            // Stuffed zero byte or restart marker, both belong to the scan
            (0xff, 0x00 | 0xd0..=0xd7) => pos += 2,
            (0xff, _) => return Some(pos),
            _ => pos += 1,
        }
    }
}

fn find_marker(data: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|window| window == marker)
        .map(|offset| from + offset)
}

/// A still image played as a video of a single frame.
pub struct StillSource {
    frame: Option<RgbImage>,
}

impl StillSource {
    pub fn new(data: &[u8]) -> Result<Self, SourceError> {
        let frame = image::load_from_memory(data)?.to_rgb8();
        Ok(Self { frame: Some(frame) })
    }
}

impl FrameSource for StillSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        Ok(self.frame.take())
    }
}
