//! Error types for network configuration and the imputation sampler.

use thiserror::Error;

/// Errors raised by construction, likelihood evaluation, and backward imputation.
#[derive(Debug, Error)]
pub enum StoNetError {
    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The conditioning covariance block of a missing column could not be solved.
    #[error("singular conditioning covariance for missing column {col}")]
    SingularConditioning { col: usize },

    /// The conditional variance collapsed to a non-positive or non-finite value.
    #[error("degenerate conditional variance {value} for missing column {col}")]
    DegenerateConditionalVariance { col: usize, value: f64 },

    /// A call violated a precondition implied by the configuration.
    #[error("contract violation: {0}")]
    Contract(String),

    /// Backward pass produced no gradient for a tensor that must receive one.
    #[error("no gradient recorded for {target}")]
    NoGradient { target: String },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, StoNetError>;

impl StoNetError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        StoNetError::Config(msg.into())
    }

    pub(crate) fn contract(msg: impl Into<String>) -> Self {
        StoNetError::Contract(msg.into())
    }
}
