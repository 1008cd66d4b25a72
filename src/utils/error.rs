//! Error Handling Module
//!
//! Defines the error type shared by the segmentation training library.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for active-learning segmentation runs
#[derive(Error, Debug)]
pub enum SegmentationError {
    /// Invalid run configuration; always fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error with dataset manifests or metadata
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error loading or decoding an image or label map
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with model construction or records
    #[error("Model error: {0}")]
    Model(String),

    /// Error writing or reading checkpoints
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Error raised inside a training or validation pass
    #[error("Training error: {0}")]
    Training(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Selection report export error
    #[error("CSV error: {0}")]
    Csv(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
}

/// Convenience Result type for segmentation operations
pub type Result<T> = std::result::Result<T, SegmentationError>;

impl From<serde_json::Error> for SegmentationError {
    fn from(err: serde_json::Error) -> Self {
        SegmentationError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for SegmentationError {
    fn from(err: image::ImageError) -> Self {
        SegmentationError::Dataset(format!("image error: {}", err))
    }
}

impl From<csv::Error> for SegmentationError {
    fn from(err: csv::Error) -> Self {
        SegmentationError::Csv(err.to_string())
    }
}

impl From<burn::record::RecorderError> for SegmentationError {
    fn from(err: burn::record::RecorderError) -> Self {
        SegmentationError::Checkpoint(format!("{:?}", err))
    }
}

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| SegmentationError::InvalidInput(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| SegmentationError::InvalidInput(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| SegmentationError::InvalidInput(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| SegmentationError::InvalidInput(f()))
    }
}
