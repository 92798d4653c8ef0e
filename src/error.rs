use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("failed to load model {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },
    #[error("inference failed: {0}")]
    Inference(#[from] candle_core::Error),
    #[error("failed to open {backend} camera: {reason}")]
    CameraOpen {
        backend: &'static str,
        reason: String,
    },
    #[error("failed to read frame: {0}")]
    FrameRead(String),
    #[error("video recorder: {0}")]
    Recorder(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[cfg(feature = "preview")]
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
