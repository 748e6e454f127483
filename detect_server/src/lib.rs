//! Object detection on uploaded images, uploaded videos and a webcam, served to the browser.
//!
//! Still images are answered with an HTML page showing the annotated result. Videos and the
//! camera are answered with a `multipart/x-mixed-replace` stream of annotated JPEG frames which
//! browsers play in an `<img>` tag.
pub mod annotate;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod meter;
pub mod nn;
pub mod pages;
pub mod sources;
pub mod storage;
pub mod streamer;
pub mod sweeper;
pub mod utils;

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use axum::{extract::DefaultBodyLimit, routing::get, Extension, Router};

use crate::{
    annotate::Annotator,
    config::Settings,
    nn::Detector,
    storage::{AssetId, Storage},
    sweeper::RetentionSweeper,
};

/// State shared by all request handlers.
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub detector: Arc<dyn Detector>,
    pub annotator: Annotator,
    pub sweeper: RetentionSweeper,
    pub settings: Settings,
    /// Videos uploaded through `/vidpred` and not streamed yet.
    uploaded_videos: Mutex<HashSet<AssetId>>,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn Storage>,
        detector: Arc<dyn Detector>,
        annotator: Annotator,
        settings: Settings,
    ) -> Self {
        let sweeper = RetentionSweeper::new(Arc::clone(&storage), settings.sweep_interval);
        Self {
            storage,
            detector,
            annotator,
            sweeper,
            settings,
            uploaded_videos: Mutex::default(),
        }
    }

    /// Remember `id` as an uploaded video, deleted once it is streamed.
    pub fn register_video(&self, id: AssetId) {
        self.uploaded_videos
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    /// Take ownership of an uploaded video. Returns `false` for assets which were not uploaded as
    /// a video or are already claimed by another stream, those are never deleted by a stream.
    pub fn claim_video(&self, id: &AssetId) -> bool {
        self.uploaded_videos
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }
}

/// Build the HTTP router with all endpoints.
pub fn app(state: Arc<AppState>) -> Router {
    use endpoints::*;

    let max_upload_bytes = state.settings.max_upload_bytes;

    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/imgpred", get(image_form).post(image_upload))
        .route("/vidpred", get(video_form).post(video_upload))
        .route("/video_feed", get(video_feed))
        .route("/live_feed", get(live_feed))
        .route("/delete", get(start_sweeper))
        .route("/static/:name", get(static_asset))
        .layer(Extension(state))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
