use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the downsampler and the result cache.
///
/// Cloneable so a single failed computation can be handed to every caller
/// that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("compute failed: {0}")]
    ComputeFailure(Arc<eyre::Report>),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub(crate) fn compute(report: impl Into<eyre::Report>) -> Self {
        Error::ComputeFailure(Arc::new(report.into()))
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Error::InvalidInput(_))
    }

    pub fn is_compute_failure(&self) -> bool {
        matches!(self, Error::ComputeFailure(_))
    }
}
