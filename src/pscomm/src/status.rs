use std::sync::Arc;

use thiserror::Error;

/// Failure kinds surfaced to user callbacks and returned from enqueue paths.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommError {
    #[error("unknown error: {0}")]
    Unknown(String),
    #[error("precondition error: {0}")]
    Precondition(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("data loss: {0}")]
    DataLoss(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation in progress")]
    InProgress,
}

pub type Status = Result<(), CommError>;

/// Invoked when an operation completes. The completion token guarantees a
/// single invocation per enqueue; the error-handler hook may reuse the same
/// callback on transport failure, with dedup at the handle manager.
pub type StatusCallback = Arc<dyn Fn(Status) + Send + Sync>;

pub fn not_initialized() -> CommError {
    CommError::Precondition("pscomm has not been initialized; call Runtime::init()".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_reason() {
        let err = CommError::InvalidArgument("bad split".into());
        assert_eq!(err.to_string(), "invalid argument: bad split");
        let err = CommError::Aborted("shutdown".into());
        assert!(err.to_string().contains("shutdown"));
    }
}
