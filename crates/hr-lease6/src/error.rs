use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// Caller broke a handle contract (stale or already-released handle,
    /// wrong pool type). Always a logic error on the caller's side.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Not found")]
    NotFound,

    /// Generation gave up. `attempts` tells the caller how hard the pool
    /// was to allocate from.
    #[error("No free address or prefix after {attempts} attempts")]
    NoResources { attempts: u32 },

    #[error("Consistency conflict: {0}")]
    Failure(String),
}

pub type LeaseResult<T> = Result<T, LeaseError>;

impl From<std::collections::TryReserveError> for LeaseError {
    fn from(_: std::collections::TryReserveError) -> Self {
        LeaseError::OutOfMemory
    }
}
