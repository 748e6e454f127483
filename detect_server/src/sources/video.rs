//! Video file input through ffmpeg.
use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::{input, Pixel};
use ffmpeg_next::media::Type;
use ffmpeg_next::software::scaling::{context::Context as ScalingContext, flag::Flags};
use ffmpeg_next::util::frame::video::Video;
use image::RgbImage;

use super::{FrameSource, SourceError};

/// Decoded frames of a video file.
pub struct FfmpegSource {
    input_context: ffmpeg::format::context::Input,
    video_stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: ScalingContext,
    width: u32,
    height: u32,
    eof_sent: bool,
}

fn open_err(err: ffmpeg::Error) -> SourceError {
    SourceError::Open(err.to_string())
}

impl FfmpegSource {
    pub fn new(path: &Path) -> Result<Self, SourceError> {
        ffmpeg::init().map_err(open_err)?;

        let input_context = input(&path).map_err(open_err)?;
        let video_stream = input_context
            .streams()
            .best(Type::Video)
            .ok_or_else(|| SourceError::Open("no video stream".into()))?;

        let video_stream_index = video_stream.index();
        let decoder = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
            .and_then(|context| context.decoder().video())
            .map_err(open_err)?;

        let (width, height) = (decoder.width(), decoder.height());
        let scaler = ScalingContext::get(
            decoder.format(),
            width,
            height,
            Pixel::RGB24,
            width,
            height,
            Flags::BILINEAR,
        )
        .map_err(open_err)?;

        log::info!(
            "Opened {} ({}x{}, stream {})",
            path.display(),
            width,
            height,
            video_stream_index
        );

        Ok(Self {
            input_context,
            video_stream_index,
            decoder,
            scaler,
            width,
            height,
            eof_sent: false,
        })
    }

    fn decode_next_frame(&mut self) -> Result<Option<Video>, ffmpeg::Error> {
        let mut decoded = Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return Ok(Some(decoded));
            }
            if self.eof_sent {
                return Ok(None);
            }

            let index = self.video_stream_index;
            let packet = self
                .input_context
                .packets()
                .find(|(stream, _)| stream.index() == index);
            match packet {
                Some((_, packet)) => self.decoder.send_packet(&packet)?,
                None => {
                    self.decoder.send_eof()?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn to_rgb(&mut self, decoded: &Video) -> Result<RgbImage, SourceError> {
        let mut rgb_frame = Video::empty();
        self.scaler.run(decoded, &mut rgb_frame).map_err(open_err)?;

        let data = rgb_frame.data(0);
        let stride = rgb_frame.stride(0);
        let row_len = self.width as usize * 3;

        // Rows may be padded beyond the image width
        let mut image_data = Vec::with_capacity(row_len * self.height as usize);
        for y in 0..self.height as usize {
            let row_start = y * stride;
            image_data.extend_from_slice(&data[row_start..row_start + row_len]);
        }

        RgbImage::from_raw(self.width, self.height, image_data)
            .ok_or_else(|| SourceError::Open("frame buffer too small".into()))
    }
}

impl FrameSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        match self.decode_next_frame().map_err(open_err)? {
            Some(decoded) => self.to_rgb(&decoded).map(Some),
            None => Ok(None),
        }
    }
}
