//! Error taxonomy for the classification pipeline.
//!
//! Only faults live here. Expected refusals (no leaf, high entropy, water,
//! class vetoes, guard rejections) are `FinalVerdict::Rejected` values and
//! never surface as errors.

use std::time::Duration;

use thiserror::Error;

/// Faults raised while building an [`crate::pipeline::InferenceContext`] or
/// while classifying a single image.
#[derive(Error, Debug)]
pub enum ClassifyError {
    /// The raster is empty or could not be decoded. Not retried.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Weights, vocabulary or calibration could not be loaded at startup.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Unexpected fault during metric extraction or inference.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The caller-imposed deadline elapsed before the pipeline finished.
    #[error("Classification did not finish within {0:?}")]
    Timeout(Duration),
}

impl ClassifyError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        ClassifyError::Internal(err.to_string())
    }

    pub fn model_unavailable(err: impl std::fmt::Display) -> Self {
        ClassifyError::ModelUnavailable(err.to_string())
    }

    /// Stable short code for logs and metadata.
    pub fn code(&self) -> &'static str {
        match self {
            ClassifyError::InvalidImage(_) => "InvalidImage",
            ClassifyError::ModelUnavailable(_) => "ModelUnavailable",
            ClassifyError::Internal(_) => "InternalError",
            ClassifyError::Timeout(_) => "Timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ClassifyError::InvalidImage("x".into()).code(), "InvalidImage");
        assert_eq!(ClassifyError::internal("boom").code(), "InternalError");
        assert_eq!(
            ClassifyError::Timeout(Duration::from_millis(5)).code(),
            "Timeout"
        );
    }

    #[test]
    fn test_error_messages_carry_detail() {
        let err = ClassifyError::model_unavailable("weights/RN/best.onnx missing");
        assert!(err.to_string().contains("weights/RN/best.onnx"));
    }
}
