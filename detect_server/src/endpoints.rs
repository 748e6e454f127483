//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::{Bytes, StreamBody},
    extract::{Multipart, Path, Query},
    http::header,
    response::{Html, IntoResponse, Redirect, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    annotate::{encode_jpeg, DetectionResult},
    config::ResultNaming,
    error::AppError,
    meter::METER,
    pages::{image_page, index_page, ImagePage},
    sources::VideoInput,
    storage::{AssetId, Storage, StorageError},
    streamer::{spawn_frame_stream, FrameStream},
    AppState,
};

/// Name of the result file when results are not uniquely named.
pub const FIXED_RESULT_NAME: &str = "result_image.jpg";

/// Search parameters of the video feed.
#[derive(Debug, Deserialize)]
pub struct VideoFeedParams {
    #[serde(default)]
    video_path: Option<String>,
}

/// Acknowledgement of a sweeper start request.
#[derive(Debug, Serialize)]
pub struct SweepAck {
    pub status: &'static str,
    pub interval_secs: u64,
}

/// A file received through a multipart form.
#[derive(Debug)]
pub struct Upload {
    pub file_name: String,
    pub data: Bytes,
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Landing page.
pub async fn index() -> Html<String> {
    Html(index_page())
}

/// Empty image form.
pub async fn image_form() -> Html<String> {
    Html(image_page(&ImagePage::default()))
}

/// Run the detector on an uploaded image and show the result.
pub async fn image_upload(
    Extension(state): Extension<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Html<String>, AppError> {
    let upload = read_upload(multipart, "image").await?;
    log::info!(
        "Received image {:?} ({} bytes)",
        &upload.file_name,
        upload.data.len()
    );

    let page = tokio::task::spawn_blocking(move || render_image_result(&state, &upload))
        .await
        .map_err(anyhow::Error::from)??;

    Ok(Html(image_page(&page)))
}

/// Empty video form.
pub async fn video_form() -> Html<String> {
    Html(index_page())
}

/// Store an uploaded video and redirect to its stream.
pub async fn video_upload(
    Extension(state): Extension<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Redirect, AppError> {
    let upload = read_upload(multipart, "file").await?;
    log::info!(
        "Received video {:?} ({} bytes)",
        &upload.file_name,
        upload.data.len()
    );

    let storage = Arc::clone(&state.storage);
    let id = tokio::task::spawn_blocking(move || storage.put(&upload.data, Some(&upload.file_name)))
        .await
        .map_err(anyhow::Error::from)??;
    state.register_video(id.clone());

    Ok(Redirect::to(&format!("/video_feed?video_path={id}")))
}

/// Stream of annotated frames of an uploaded video.
pub async fn video_feed(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<VideoFeedParams>,
) -> Result<Response, AppError> {
    let video_path = params
        .video_path
        .filter(|path| !path.is_empty())
        .ok_or(AppError::MissingVideoPath)?;
    let id = AssetId::parse(strip_static_prefix(&video_path))?;
    log::info!("Stream for {} requested", &id);

    let stream = spawn_frame_stream(state, VideoInput::Asset(id)).await?;
    Ok(stream_response(stream))
}

/// Stream of annotated frames of the camera.
pub async fn live_feed(Extension(state): Extension<Arc<AppState>>) -> Result<Response, AppError> {
    let device = state.settings.camera.clone();
    log::info!("Live stream from {} requested", &device);

    let stream = spawn_frame_stream(state, VideoInput::Camera(device)).await?;
    Ok(stream_response(stream))
}

/// Start the storage sweeper unless it already runs.
pub async fn start_sweeper(Extension(state): Extension<Arc<AppState>>) -> Json<SweepAck> {
    let status = match state.sweeper.start() {
        true => "started",
        false => "already running",
    };

    Json(SweepAck {
        status,
        interval_secs: state.sweeper.interval().as_secs(),
    })
}

/// Serve a stored asset.
pub async fn static_asset(
    Extension(state): Extension<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let id = AssetId::parse(&name)?;
    let content_type = content_type(&id);

    let data = tokio::task::spawn_blocking(move || state.storage.get(&id))
        .await
        .map_err(anyhow::Error::from)??;

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        data,
    )
        .into_response())
}

/// Take the file field `field_name` out of a multipart form.
async fn read_upload(mut multipart: Multipart, field_name: &'static str) -> Result<Upload, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(field_name) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_owned();
        if file_name.is_empty() {
            return Err(AppError::EmptyUpload);
        }

        let data = field.bytes().await?;
        return Ok(Upload { file_name, data });
    }

    Err(AppError::MissingField(field_name))
}

/// Store an uploaded image, detect objects on it once and store the annotated result.
///
/// The stored upload is removed again if no result could be written.
pub fn render_image_result(state: &AppState, upload: &Upload) -> Result<ImagePage, AppError> {
    let original = state.storage.put(&upload.data, Some(&upload.file_name))?;

    store_result(state, &upload.data, &original).map_err(|err| {
        discard(state.storage.as_ref(), &original);
        err
    })
}

fn store_result(state: &AppState, data: &[u8], original: &AssetId) -> Result<ImagePage, AppError> {
    let jpeg = annotate_image(state, data)?;
    METER.tick_image();

    match state.settings.result_naming {
        ResultNaming::Unique => {
            let result = state.storage.put(&jpeg, Some("result.jpg"))?;
            log::info!("Rendered {} for {}", &result, original);
            Ok(ImagePage {
                original: Some(original.clone()),
                result: Some(result),
            })
        }
        ResultNaming::Fixed => {
            let result = AssetId::parse(FIXED_RESULT_NAME)?;
            state.storage.put_named(&result, &jpeg)?;
            discard(state.storage.as_ref(), original);
            log::info!("Rendered {} for {}", &result, original);
            Ok(ImagePage {
                original: None,
                result: Some(result),
            })
        }
    }
}

/// Delete `id`, it may already be gone through the sweeper.
fn discard(storage: &dyn Storage, id: &AssetId) {
    match storage.delete(id) {
        Ok(()) | Err(StorageError::NotFound(_)) => (),
        Err(err) => log::warn!("Failed to delete {id}: {err}"),
    }
}

fn annotate_image(state: &AppState, data: &[u8]) -> Result<Vec<u8>, AppError> {
    let image = image::load_from_memory(data)
        .map_err(|err| AppError::ImageDecode(err.to_string()))?
        .to_rgb8();

    let detections = state.detector.detect(&image)?;
    log::debug!("Found {} objects", detections.len());

    let annotated = DetectionResult { image, detections }.plot(&state.annotator);
    Ok(encode_jpeg(&annotated, state.settings.jpeg_quality)?)
}

fn stream_response(stream: FrameStream) -> Response {
    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [
        (header::CONTENT_TYPE, common::mjpeg::CONTENT_TYPE),
        (header::CACHE_CONTROL, "no-cache"),
    ];

    (headers, body).into_response()
}

/// Accept `static/<name>` as well, the form in which stored files are linked.
fn strip_static_prefix(video_path: &str) -> &str {
    let path = video_path.trim_start_matches('/');
    path.strip_prefix("static/").unwrap_or(path)
}

fn content_type(id: &AssetId) -> &'static str {
    match id.extension().as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mjpg" | "mjpeg") => "video/x-motion-jpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod test {

    use std::io;

    use image::RgbImage;

    use super::*;
    use crate::{
        annotate::Annotator,
        config::Settings,
        nn::{Detection, Detector},
        storage::DiskStorage,
    };

    struct NoDetections;

    impl Detector for NoDetections {
        fn detect(&self, _image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            Ok(vec![])
        }
    }

    /// Disk storage which fails to store results, or loses uploads to a concurrent sweep.
    struct FlakyStorage {
        inner: DiskStorage,
        fail_results: bool,
        lose_on_delete: bool,
    }

    impl Storage for FlakyStorage {
        fn put(&self, bytes: &[u8], file_name: Option<&str>) -> Result<AssetId, StorageError> {
            if self.fail_results && file_name == Some("result.jpg") {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full").into());
            }
            self.inner.put(bytes, file_name)
        }

        fn put_named(&self, id: &AssetId, bytes: &[u8]) -> Result<(), StorageError> {
            self.inner.put_named(id, bytes)
        }

        fn get(&self, id: &AssetId) -> Result<Vec<u8>, StorageError> {
            self.inner.get(id)
        }

        fn delete(&self, id: &AssetId) -> Result<(), StorageError> {
            self.inner.delete(id)?;
            match self.lose_on_delete {
                true => Err(StorageError::NotFound(id.clone())),
                false => Ok(()),
            }
        }

        fn list(&self) -> Result<Vec<AssetId>, StorageError> {
            self.inner.list()
        }
    }

    fn state(storage: FlakyStorage, result_naming: ResultNaming) -> AppState {
        AppState::new(
            Arc::new(storage),
            Arc::new(NoDetections),
            Annotator::new(),
            Settings {
                result_naming,
                ..Default::default()
            },
        )
    }

    fn jpeg_upload() -> Result<Upload, anyhow::Error> {
        Ok(Upload {
            file_name: "cat.jpg".into(),
            data: encode_jpeg(&RgbImage::new(8, 8), 90)?.into(),
        })
    }

    #[test]
    fn test_fixed_result_survives_concurrently_swept_upload() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FlakyStorage {
            inner: DiskStorage::new(dir.path())?,
            fail_results: false,
            lose_on_delete: true,
        };
        let state = state(storage, ResultNaming::Fixed);

        let page = render_image_result(&state, &jpeg_upload()?).expect("rendered");

        let result = AssetId::parse(FIXED_RESULT_NAME)?;
        assert_eq!(page.result.as_ref(), Some(&result));
        assert_eq!(state.storage.list()?, vec![result]);
        Ok(())
    }

    #[test]
    fn test_failed_result_write_removes_upload() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FlakyStorage {
            inner: DiskStorage::new(dir.path())?,
            fail_results: true,
            lose_on_delete: false,
        };
        let state = state(storage, ResultNaming::Unique);

        let res = render_image_result(&state, &jpeg_upload()?);

        assert!(matches!(res, Err(AppError::Internal(_))));
        assert!(state.storage.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_strip_static_prefix() {
        assert_eq!(strip_static_prefix("static/a.gif"), "a.gif");
        assert_eq!(strip_static_prefix("/static/a.gif"), "a.gif");
        assert_eq!(strip_static_prefix("a.gif"), "a.gif");
        assert_eq!(strip_static_prefix("static/../a.gif"), "../a.gif");
    }

    #[test]
    fn test_content_type() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(content_type(&AssetId::parse("a.JPG")?), "image/jpeg");
        assert_eq!(content_type(&AssetId::parse("a")?), "application/octet-stream");
        Ok(())
    }
}
