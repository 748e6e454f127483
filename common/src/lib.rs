//! Common code shared between the detection server and its clients.
pub mod mjpeg;

/// Error type.
pub type Error = Box<dyn std::error::Error + Send + Sync>;
