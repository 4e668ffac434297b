//! Custom error types for sketchcolor.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the sketchcolor library.
#[derive(Error, Debug)]
pub enum Error {
    /// The uploaded file could not be decoded as an image.
    #[error("failed to decode image from {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// A request was made without the input it needs.
    #[error("{0}")]
    InvalidInput(String),

    /// Two buffers that must line up pixel for pixel do not.
    #[error("dimension mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },

    /// Failed to download a model.
    #[error("failed to download model {name}: {source}")]
    ModelDownload {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    /// Failed to load an ONNX model.
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// A checkpoint is not on disk and has no download source.
    #[error("model {name} not found at {path}")]
    ModelMissing { name: String, path: PathBuf },

    /// The `ControlNet` and `UNet` checkpoints cannot be wired together.
    #[error(
        "ControlNet produces {controlnet_outputs} residuals but the UNet takes {unet_residual_inputs}"
    )]
    IncompatibleModels {
        controlnet_outputs: usize,
        unet_residual_inputs: usize,
    },

    /// Failed to load or apply the prompt tokenizer.
    #[error("tokenizer error: {source}")]
    Tokenizer {
        #[source]
        source: tokenizers::Error,
    },

    /// A model failed while running. Passed through untouched.
    #[error("{model} inference failed: {source}")]
    Generation {
        model: &'static str,
        #[source]
        source: ort::Error,
    },

    /// A model session lock was poisoned by a panic in another caller.
    #[error("{model} session lock poisoned")]
    SessionPoisoned { model: &'static str },

    /// Failed to create cache directory.
    #[error("failed to create cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

/// Result type alias for sketchcolor operations.
pub type Result<T> = std::result::Result<T, Error>;
