use thiserror::Error;

/// Errors surfaced by expression construction, system validation, compilation
/// and (de)serialization.
///
/// Numerical trouble during stepping is deliberately absent from the failure
/// paths of `step`/`propagate_*`: it is reported through
/// [`TaylorOutcome::ErrNfState`](crate::integrator::TaylorOutcome::ErrNfState).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
    #[error("event protocol violation: {0}")]
    EventProtocolViolation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A user callback failed; the original error is carried unchanged.
    #[error("callback failed: {0}")]
    Callback(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(Error::InvalidInput(message.into()))
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
