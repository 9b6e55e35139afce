//! Error types for zen-distill
//!
//! One crate-wide error enum covers dataset loading, splitting, model
//! construction, training and configuration resolution. Every fallible
//! operation returns [`Result`] and propagates with `?`.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, DistillError>;

#[derive(Debug, Error)]
pub enum DistillError {
    /// A class cannot supply the requested number of split members
    #[error("Class {class} has {available} samples but the split requires {required}")]
    InsufficientClassSamples {
        class: usize,
        available: usize,
        required: usize,
    },

    /// Model tag outside the supported set (GCN, GAT, GraphSAGE, SGC, APPNP, MLP)
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    /// A required key is absent from the merged experiment configuration
    #[error("Missing configuration key: {0}")]
    ConfigurationMissingKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    /// A parameter or loss became NaN or infinite
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl DistillError {
    /// Whether the error stems from the experiment setup rather than the data
    ///
    /// Setup errors abort a run before any epoch executes; search drivers use
    /// this to skip a trial instead of failing the whole sweep.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            DistillError::UnsupportedModel(_)
                | DistillError::ConfigurationMissingKey(_)
                | DistillError::InvalidConfiguration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DistillError::InsufficientClassSamples {
            class: 2,
            available: 3,
            required: 50,
        };
        assert_eq!(
            err.to_string(),
            "Class 2 has 3 samples but the split requires 50"
        );

        let err = DistillError::UnsupportedModel("GIN".to_string());
        assert_eq!(err.to_string(), "Unsupported model: GIN");
        assert!(err.is_configuration_error());

        let err = DistillError::Dataset("empty".to_string());
        assert!(!err.is_configuration_error());
    }
}
