//! Errors surfaced to HTTP clients.
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    sources::SourceError,
    storage::{AssetId, StorageError},
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Error: No {0} field in upload.")]
    MissingField(&'static str),
    #[error("Error: No file selected.")]
    EmptyUpload,
    #[error("Error: No video file provided.")]
    MissingVideoPath,
    #[error("Error: Invalid asset name {0:?}.")]
    InvalidAssetId(String),
    #[error("Error: {0} not found.")]
    AssetNotFound(AssetId),
    #[error("Error: Unsupported video format {0:?}.")]
    UnsupportedVideo(Option<String>),
    #[error("Error: Could not decode upload: {0}")]
    ImageDecode(String),
    #[error("Error: Camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("Error: Malformed upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Error: Internal server error.")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingField(_)
            | AppError::EmptyUpload
            | AppError::MissingVideoPath
            | AppError::InvalidAssetId(_)
            | AppError::Multipart(_) => StatusCode::BAD_REQUEST,
            AppError::AssetNotFound(_) => StatusCode::NOT_FOUND,
            AppError::UnsupportedVideo(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::ImageDecode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::CameraUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Internal(err) => log::error!("Request failed: {err:#}"),
            _ => log::warn!("Rejecting request ({status}): {self}"),
        }
        (status, self.to_string()).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidId(name) => AppError::InvalidAssetId(name),
            StorageError::NotFound(id) => AppError::AssetNotFound(id),
            StorageError::Io(err) => AppError::Internal(err.into()),
        }
    }
}

impl From<SourceError> for AppError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unsupported(ext) => AppError::UnsupportedVideo(ext),
            SourceError::Open(msg) => AppError::ImageDecode(msg),
            SourceError::Decode(err) => AppError::ImageDecode(err.to_string()),
            SourceError::Camera(msg) => AppError::CameraUnavailable(msg),
            SourceError::Storage(err) => err.into(),
        }
    }
}
