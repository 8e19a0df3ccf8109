//! Error types for sparse-quant.

use thiserror::Error;

/// Result type alias for sparse-quant operations.
pub type Result<T> = std::result::Result<T, TransformError>;

/// Errors that can occur while quantizing or sparsifying a weight.
///
/// None of these are retryable: every operation in this crate is a pure
/// function of its inputs and configuration.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A mode/type combination that has no implemented algorithm.
    #[error("unsupported configuration: {feature} ({config})")]
    UnsupportedConfiguration {
        /// The unsupported feature.
        feature: &'static str,
        /// The configuration values that selected it.
        config: String,
    },

    /// Shapes that cannot be reconciled, e.g. a mask whose element count
    /// differs from the weight it gates.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Invalid mask update schedule.
    #[error("invalid schedule configuration: {0}")]
    InvalidScheduleConfig(String),

    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A named variable was not found in the variable store.
    #[error("variable not found: {0}")]
    MissingVariable(String),

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl TransformError {
    pub(crate) fn unsupported(feature: &'static str, config: impl std::fmt::Debug) -> Self {
        Self::UnsupportedConfiguration {
            feature,
            config: format!("{config:?}"),
        }
    }

    pub(crate) fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
