use thiserror::Error;

use crate::frame::Representation;

/// Fatal configuration errors. These indicate a caller mistake and are never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown detector type: {0}")]
    UnknownDetector(String),

    #[error("Unknown descriptor type: {0}")]
    UnknownDescriptor(String),

    #[error("Unknown matcher type: {0}")]
    UnknownMatcher(String),

    #[error("Unknown selector type: {0}")]
    UnknownSelector(String),

    #[error("Window capacity must be positive, got {0}")]
    InvalidCapacity(usize),

    #[error("Keypoint limit must be positive")]
    InvalidKeypointLimit,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by recency access on a [`FrameWindow`](crate::window::FrameWindow).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    #[error("Recency offset {offset} out of range for a window holding {len} frames")]
    OutOfRange { offset: usize, len: usize },

    #[error("Recency offset {0} requested twice in one borrow")]
    Aliased(usize),

    #[error("Window is empty")]
    Empty,
}

/// Errors that abort a single pipeline step.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Window(#[from] WindowError),

    #[error("Descriptor representation mismatch: matcher expects {expected}, got {found}")]
    RepresentationMismatch {
        expected: Representation,
        found: Representation,
    },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
