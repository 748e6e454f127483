//! Streams of annotated frames.
//!
//! A stream is produced by a worker on the blocking thread pool: it opens the [`FrameSource`],
//! then repeatedly pulls a frame, runs the detector, plots and encodes the result and hands the
//! finished multipart part to the HTTP body through a bounded channel. The worker stops when the
//! source is exhausted or fails, when the detector fails, or when the body is dropped because
//! the client went away. In every case the source is dropped and a video uploaded through
//! `/vidpred` is deleted. Other stored assets can be streamed but are left in place.
use std::{io, sync::Arc};

use bytes::Bytes;
use common::mjpeg::as_jpeg_stream_item;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    annotate::{encode_jpeg, DetectionResult},
    error::AppError,
    meter::METER,
    sources::{self, FrameSource, VideoInput},
    storage::{AssetId, Storage, StorageError},
    AppState,
};

/// Number of encoded frames buffered ahead of the client.
const STREAM_BUFFER: usize = 2;

pub type FrameStream = ReceiverStream<Result<Bytes, io::Error>>;

/// Open `input` and start streaming its annotated frames.
///
/// Resolves once the source is open, so failing to open it is reported as an error instead of
/// an empty stream.
pub async fn spawn_frame_stream(
    state: Arc<AppState>,
    input: VideoInput,
) -> Result<FrameStream, AppError> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let (opened_tx, opened_rx) = oneshot::channel();

    tokio::task::spawn_blocking(move || {
        // Uploaded videos are deleted however the stream ends, failing to open included
        let cleanup = match &input {
            VideoInput::Asset(id) if state.claim_video(id) => Some(DeleteOnDrop {
                storage: Arc::clone(&state.storage),
                id: id.clone(),
            }),
            _ => None,
        };

        let source = match sources::open(&input, state.storage.as_ref()) {
            Ok(source) => source,
            Err(err) => {
                drop(cleanup);
                opened_tx.send(Err(err)).ok();
                return;
            }
        };

        match opened_tx.send(Ok(())) {
            Ok(()) => run_stream(&state, source, &tx, &input),
            Err(_) => drop(source),
        }

        // Release the asset before the body sees the end of the stream
        drop(cleanup);
        drop(tx);
    });

    match opened_rx.await {
        Ok(Ok(())) => Ok(ReceiverStream::new(rx)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(anyhow::anyhow!("stream worker exited before opening the source").into()),
    }
}

fn run_stream(
    state: &AppState,
    mut source: Box<dyn FrameSource>,
    tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    input: &VideoInput,
) {
    let mut num_frames: u64 = 0;

    loop {
        let image = match source.next_frame() {
            Ok(Some(image)) => image,
            Ok(None) => {
                log::info!("{input}: source exhausted after {num_frames} frames");
                break;
            }
            Err(err) => {
                log::warn!("{input}: stopping after {num_frames} frames: {err}");
                break;
            }
        };

        let part = match annotate_frame(state, image) {
            Ok(part) => part,
            Err(err) => {
                log::error!("{input}: stopping after {num_frames} frames: {err:#}");
                break;
            }
        };

        if tx.blocking_send(Ok(part)).is_err() {
            log::info!("{input}: client disconnected after {num_frames} frames");
            break;
        }

        num_frames += 1;
        METER.tick_streamed();
        log::debug!("{input}: streamed frame {num_frames}");
    }
}

fn annotate_frame(state: &AppState, image: image::RgbImage) -> anyhow::Result<Bytes> {
    let detections = state.detector.detect(&image)?;
    let frame = DetectionResult { image, detections }.plot(&state.annotator);
    let jpeg = encode_jpeg(&frame, state.settings.jpeg_quality)?;
    Ok(as_jpeg_stream_item(&jpeg))
}

/// Deletes an uploaded video once its stream is done with it.
struct DeleteOnDrop {
    storage: Arc<dyn Storage>,
    id: AssetId,
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        match self.storage.delete(&self.id) {
            Ok(()) => log::debug!("Deleted streamed asset {}", self.id),
            Err(StorageError::NotFound(_)) => (),
            Err(err) => log::warn!("Failed to delete streamed asset {}: {err}", self.id),
        }
    }
}
