//! Pipeline error taxonomy

use thiserror::Error;

/// Errors raised by the inference pipeline.
///
/// `Clone` so a failed model load can be cached and handed to every later caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VisionError {
    #[error("unknown model id: {0}")]
    UnknownModel(String),

    #[error("model {model_id} unavailable: {reason}")]
    ModelUnavailable { model_id: String, reason: String },

    #[error("malformed output from {model_id}: {reason}")]
    MalformedOutput { model_id: String, reason: String },

    #[error("degenerate geometry: {0}")]
    GeometryDegenerate(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("invalid tensor: {0}")]
    InvalidTensor(String),
}

impl VisionError {
    pub fn unavailable(model_id: &str, reason: impl ToString) -> Self {
        VisionError::ModelUnavailable {
            model_id: model_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(model_id: &str, reason: impl ToString) -> Self {
        VisionError::MalformedOutput {
            model_id: model_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn inference(reason: impl ToString) -> Self {
        VisionError::Inference(reason.to_string())
    }

    /// True for failures that make a model id unusable until it is reloaded.
    pub fn is_model_unavailable(&self) -> bool {
        matches!(self, VisionError::ModelUnavailable { .. })
    }
}

impl From<image::ImageError> for VisionError {
    fn from(err: image::ImageError) -> Self {
        VisionError::Image(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;
