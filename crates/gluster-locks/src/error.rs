use thiserror::Error;

/// Errors returned by the lock engines and the translator facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("Lock request would block")]
    WouldBlock,

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("No matching lock found for {what}")]
    NotFound { what: String },

    #[error("Out of memory while building lock records")]
    OutOfMemory,

    #[error("Blocked lock request was cancelled")]
    Cancelled,

    #[error("Operation not supported: {op}")]
    NotSupported { op: String },
}

pub type Result<T> = std::result::Result<T, LockError>;

impl LockError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        LockError::InvalidArgument { msg: msg.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        LockError::NotFound { what: what.into() }
    }

    /// Wire-level errno reported to the caller of the translator.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            LockError::WouldBlock => EAGAIN,
            LockError::InvalidArgument { .. } => EINVAL,
            // a bad unlock has always been answered with EINVAL
            LockError::NotFound { .. } => EINVAL,
            LockError::OutOfMemory => ENOMEM,
            LockError::Cancelled => EAGAIN,
            LockError::NotSupported { .. } => ENOTSUP,
        }
    }
}

impl From<std::collections::TryReserveError> for LockError {
    fn from(_: std::collections::TryReserveError) -> Self {
        LockError::OutOfMemory
    }
}
