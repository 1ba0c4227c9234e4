//! kvattn error types

/// kvattn result type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], for callers that only branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    AllocationFailure,
    Config,
    ThreadPool,
}

/// kvattn errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid argument to an operation (shape, rank or value mismatch)
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Scratch buffer could not be obtained
    #[error("allocation of {bytes} bytes failed: {reason}")]
    AllocationFailure {
        /// Requested size in bytes
        bytes: usize,
        /// Description of what went wrong
        reason: String,
    },

    /// Configuration loading or validation error
    #[error("config error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },

    /// Worker pool construction error
    #[error("thread pool error: {reason}")]
    ThreadPool {
        /// Description of what went wrong
        reason: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            Error::Config { .. } => ErrorKind::Config,
            Error::ThreadPool { .. } => ErrorKind::ThreadPool,
        }
    }

    pub(crate) fn invalid(arg: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_and_message() {
        let err = Error::invalid("past_key", "expected 4 dimensions, got 3");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            err.to_string(),
            "invalid argument 'past_key': expected 4 dimensions, got 3"
        );

        let err = Error::AllocationFailure {
            bytes: 64,
            reason: "limit exceeded".into(),
        };
        assert_eq!(err.kind(), ErrorKind::AllocationFailure);
        assert!(err.to_string().contains("64 bytes"));
    }
}
