use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use common::mjpeg::split_parts;
use detect_server::{
    annotate::Annotator,
    app,
    config::{ResultNaming, Settings},
    endpoints::FIXED_RESULT_NAME,
    nn::{Detection, Detector},
    storage::{AssetId, DiskStorage, Storage},
    AppState,
};
use hyper::body::HttpBody;
use image::{codecs::gif::GifEncoder, Frame, ImageOutputFormat, Rgb, RgbImage, Rgba, RgbaImage};
use tempfile::TempDir;
use tower::ServiceExt;

type Error = Box<dyn std::error::Error>;

/// Detector finding one person in the middle of every image.
#[derive(Default)]
struct StubDetector {
    calls: AtomicUsize,
}

impl Detector for StubDetector {
    fn detect(&self, _image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Detection {
            bbox: [0.25, 0.25, 0.75, 0.75],
            confidence: 0.9,
            class_id: 0,
            label: "person".into(),
        }])
    }
}

struct TestServer {
    app: Router,
    state: Arc<AppState>,
    detector: Arc<StubDetector>,
    _dir: TempDir,
}

impl TestServer {
    fn new(settings: Settings) -> Result<Self, Error> {
        let dir = tempfile::tempdir()?;
        let storage = Arc::new(DiskStorage::new(dir.path())?);
        let detector = Arc::new(StubDetector::default());
        let state = Arc::new(AppState::new(
            storage,
            detector.clone(),
            Annotator::new(),
            settings,
        ));

        Ok(Self {
            app: app(Arc::clone(&state)),
            state,
            detector,
            _dir: dir,
        })
    }

    fn with_naming(result_naming: ResultNaming) -> Result<Self, Error> {
        Self::new(Settings {
            result_naming,
            ..Default::default()
        })
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).expect("request"))
            .await
    }

    /// Upload a video through the form and return the stream it redirects to.
    async fn upload_video(&self, file_name: &str, data: &[u8]) -> Result<String, Error> {
        let response = self
            .send(multipart_request("/vidpred", "file", file_name, data))
            .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        Ok(response.headers()[header::LOCATION].to_str()?.to_owned())
    }

    fn stored(&self) -> Vec<AssetId> {
        self.state.storage.list().expect("list storage")
    }

    /// Poll until the storage holds `n` assets.
    async fn wait_for_stored(&self, n: usize) -> Vec<AssetId> {
        for _ in 0..100 {
            let stored = self.stored();
            if stored.len() == n {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.stored()
    }
}

fn multipart_request(uri: &str, field: &str, file_name: &str, data: &[u8]) -> Request<Body> {
    let boundary = "detect-server-test-boundary";
    let mut body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::post(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .expect("request")
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([30, 60, 90]));
    let mut buf = Cursor::new(vec![]);
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut buf, ImageOutputFormat::Png)
        .expect("encode png");
    buf.into_inner()
}

fn gif(num_frames: u8) -> Vec<u8> {
    let mut buf = vec![];
    {
        let mut encoder = GifEncoder::new(&mut buf);
        let frames = (0..num_frames).map(|i| {
            Frame::new(RgbaImage::from_pixel(32, 24, Rgba([i.wrapping_mul(10), 0, 0, 255])))
        });
        encoder.encode_frames(frames).expect("encode gif");
    }
    buf
}

/// Asset ids linked from a rendered page.
fn linked_assets(html: &str) -> Vec<AssetId> {
    html.split("src=\"/static/")
        .skip(1)
        .filter_map(|rest| rest.split('"').next())
        .map(|name| AssetId::parse(name).expect("valid asset id"))
        .collect()
}

async fn body_string(response: Response) -> String {
    let bytes = hyper::body::to_bytes(response.into_body())
        .await
        .expect("read body");
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn test_healthcheck_and_pages() -> Result<(), Error> {
    let server = TestServer::new(Settings::default())?;

    let response = server.get("/healthcheck").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "healthy");

    for uri in ["/", "/imgpred", "/vidpred"] {
        let response = server.get(uri).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        assert!(body_string(response).await.contains("multipart/form-data"));
    }

    Ok(())
}

#[tokio::test]
async fn test_image_upload_renders_result_with_source_dimensions() -> Result<(), Error> {
    let server = TestServer::with_naming(ResultNaming::Unique)?;

    let response = server
        .send(multipart_request("/imgpred", "image", "cat.png", &png(64, 48)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let html = body_string(response).await;
    let linked = linked_assets(&html);
    assert_eq!(linked.len(), 2, "original and result are shown");
    assert_eq!(server.detector.calls.load(Ordering::SeqCst), 1);

    let (original, result) = (&linked[0], &linked[1]);
    assert_eq!(original.extension().as_deref(), Some("png"));
    assert_eq!(result.extension().as_deref(), Some("jpg"));

    let mut stored = server.stored();
    stored.sort();
    let mut expected = linked.clone();
    expected.sort();
    assert_eq!(stored, expected);

    let result_image = image::load_from_memory(&server.state.storage.get(result)?)?;
    assert_eq!((result_image.width(), result_image.height()), (64, 48));

    // The linked result is served
    let response = server.get(&format!("/static/{result}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");

    Ok(())
}

#[tokio::test]
async fn test_fixed_naming_keeps_only_the_result() -> Result<(), Error> {
    let server = TestServer::with_naming(ResultNaming::Fixed)?;

    let response = server
        .send(multipart_request("/imgpred", "image", "cat.png", &png(20, 10)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let linked = linked_assets(&body_string(response).await);
    assert_eq!(linked, vec![AssetId::parse(FIXED_RESULT_NAME)?]);
    assert_eq!(server.stored(), linked);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_uploads_with_unique_names_do_not_collide() -> Result<(), Error> {
    let server = TestServer::with_naming(ResultNaming::Unique)?;

    let (a, b) = tokio::join!(
        server.send(multipart_request("/imgpred", "image", "a.png", &png(16, 16))),
        server.send(multipart_request("/imgpred", "image", "b.png", &png(16, 16))),
    );
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    let result_a = linked_assets(&body_string(a).await)[1].clone();
    let result_b = linked_assets(&body_string(b).await)[1].clone();
    assert_ne!(result_a, result_b);
    assert_eq!(server.stored().len(), 4);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_uploads_with_fixed_name_leave_one_result() -> Result<(), Error> {
    let server = TestServer::with_naming(ResultNaming::Fixed)?;

    let (a, b) = tokio::join!(
        server.send(multipart_request("/imgpred", "image", "a.png", &png(16, 16))),
        server.send(multipart_request("/imgpred", "image", "b.png", &png(16, 16))),
    );
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    assert_eq!(server.stored(), vec![AssetId::parse(FIXED_RESULT_NAME)?]);
    let result = image::load_from_memory(&server.state.storage.get(&server.stored()[0])?)?;
    assert_eq!((result.width(), result.height()), (16, 16));

    Ok(())
}

#[tokio::test]
async fn test_missing_field_and_empty_filename_store_nothing() -> Result<(), Error> {
    let server = TestServer::new(Settings::default())?;

    let cases = [
        multipart_request("/imgpred", "picture", "cat.png", &png(4, 4)),
        multipart_request("/imgpred", "image", "", b""),
        multipart_request("/vidpred", "video", "clip.gif", &gif(1)),
        multipart_request("/vidpred", "file", "", b""),
    ];
    for request in cases {
        let response = server.send(request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    assert!(server.stored().is_empty());
    assert_eq!(server.detector.calls.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn test_undecodable_image_is_rejected_and_removed() -> Result<(), Error> {
    let server = TestServer::new(Settings::default())?;

    let response = server
        .send(multipart_request("/imgpred", "image", "cat.png", b"not an image"))
        .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(server.stored().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_video_upload_streams_every_frame_then_deletes_upload() -> Result<(), Error> {
    let server = TestServer::new(Settings::default())?;

    let response = server
        .send(multipart_request("/vidpred", "file", "clip.gif", &gif(3)))
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[header::LOCATION].to_str()?.to_owned();
    assert!(location.starts_with("/video_feed?video_path="));
    assert_eq!(server.stored().len(), 1);

    let response = server.get(&location).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );

    let body = hyper::body::to_bytes(response.into_body())
        .await
        .expect("read body");
    let parts = split_parts(&body).map_err(|err| err.to_string())?;

    assert_eq!(parts.len(), 3);
    for part in parts {
        assert_eq!(part.content_type, "image/jpeg");
        let frame = image::load_from_memory(&part.data)?;
        assert_eq!((frame.width(), frame.height()), (32, 24));
    }
    assert_eq!(server.detector.calls.load(Ordering::SeqCst), 3);

    assert!(server.wait_for_stored(0).await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_disconnecting_client_stops_stream_and_deletes_upload() -> Result<(), Error> {
    let server = TestServer::new(Settings::default())?;
    let location = server.upload_video("long.gif", &gif(40)).await?;

    let response = server.get(&location).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let first = body.data().await.expect("first chunk").expect("chunk");
    assert!(first.starts_with(b"--frame\r\n"));
    drop(body);

    assert!(server.wait_for_stored(0).await.is_empty());
    assert!(server.detector.calls.load(Ordering::SeqCst) < 40);

    Ok(())
}

#[tokio::test]
async fn test_video_feed_errors_are_explicit() -> Result<(), Error> {
    let server = TestServer::new(Settings::default())?;

    let response = server.get("/video_feed").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(response).await, "Error: No video file provided.");

    let response = server.get("/video_feed?video_path=").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server.get("/video_feed?video_path=..%2Fsecret").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server.get("/video_feed?video_path=missing.gif").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let broken = server.state.storage.put(b"garbage", Some("broken.gif"))?;
    let response = server
        .get(&format!("/video_feed?video_path=static/{broken}"))
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    // Only videos uploaded through the form are removed by their stream
    assert_eq!(server.stored(), vec![broken]);

    Ok(())
}

#[tokio::test]
async fn test_uploaded_video_failing_to_open_is_deleted() -> Result<(), Error> {
    let server = TestServer::new(Settings::default())?;

    let location = server.upload_video("broken.gif", b"garbage").await?;
    let response = server.get(&location).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(server.wait_for_stored(0).await.is_empty());

    let location = server.upload_video("clip.mp4", b"\0\0\0\x18ftypmp42").await?;
    let response = server.get(&location).await;
    #[cfg(not(feature = "ffmpeg"))]
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    #[cfg(feature = "ffmpeg")]
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(server.wait_for_stored(0).await.is_empty());

    // The video is gone for good
    let response = server.get(&location).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_streaming_a_rendered_result_keeps_it() -> Result<(), Error> {
    let server = TestServer::with_naming(ResultNaming::Fixed)?;

    let response = server
        .send(multipart_request("/imgpred", "image", "cat.png", &png(20, 10)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .get(&format!("/video_feed?video_path=static/{FIXED_RESULT_NAME}"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .expect("read body");
    assert_eq!(split_parts(&body).map_err(|err| err.to_string())?.len(), 1);

    assert_eq!(server.stored(), vec![AssetId::parse(FIXED_RESULT_NAME)?]);

    Ok(())
}

#[cfg(not(feature = "camera"))]
#[tokio::test]
async fn test_live_feed_without_camera_support() -> Result<(), Error> {
    let server = TestServer::new(Settings::default())?;

    let response = server.get("/live_feed").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    Ok(())
}

#[tokio::test]
async fn test_delete_starts_a_single_sweeper() -> Result<(), Error> {
    let server = TestServer::new(Settings {
        sweep_interval: Duration::from_millis(100),
        ..Default::default()
    })?;
    server.state.storage.put(b"old", Some("old.jpg"))?;

    let response = server.get("/delete").await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack: serde_json::Value = serde_json::from_str(&body_string(response).await)?;
    assert_eq!(ack["status"], "started");

    let response = server.get("/delete").await;
    let ack: serde_json::Value = serde_json::from_str(&body_string(response).await)?;
    assert_eq!(ack["status"], "already running");
    assert!(server.state.sweeper.is_running());

    // Files added after the trigger are swept as well
    server.state.storage.put(b"new", Some("new.jpg"))?;
    assert!(server.wait_for_stored(0).await.is_empty());

    Ok(())
}
