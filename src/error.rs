use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Conditions that stop a control loop from ever starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to reserve {bytes} byte classifier arena")]
    ArenaReservation { bytes: usize },
    #[error("tensor allocation failed: need {needed} bytes, arena has {available} left")]
    TensorAllocation { needed: usize, available: usize },
    #[error("camera initialisation failed: {0}")]
    Camera(String),
    #[error("failed to load model {path}: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: ModelError,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("preprocessor configuration invalid: {0}")]
    Preprocess(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model schema version {found} does not match runtime version {expected}")]
    SchemaMismatch { expected: u32, found: u32 },
    #[error("not a compiled model (bad magic)")]
    BadMagic,
    #[error("model truncated at byte {0}")]
    Truncated(usize),
    #[error("model layer {index} invalid: {reason}")]
    InvalidLayer { index: usize, reason: String },
    #[error("model {what} {value} does not fit a 16-bit field")]
    FieldOverflow { what: &'static str, value: usize },
    #[error("model has {found} outputs, expected {expected}")]
    OutputCount { expected: usize, found: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("onnx engine: {0}")]
    Engine(String),
}

/// A forward pass that did not produce scores. The cycle is skipped.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("engine failure: {0}")]
    Engine(String),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("camera capture failed: {0}")]
    Capture(String),
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("frame shape mismatch: {0}")]
    Shape(String),
    #[error("jpeg encode failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("stream request failed: {0}")]
    Request(String),
    #[error("stream rejected with status {0}")]
    Status(u16),
    #[error("stream is not multipart (content type {0:?})")]
    NotMultipart(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ureq::Error> for CollectError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => CollectError::Status(code),
            other => CollectError::Request(other.to_string()),
        }
    }
}
