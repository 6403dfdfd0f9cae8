//! Errors returned by combiner operations.

/// Caller-recoverable failures. None of them leaves the registry partially mutated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CombinerError {
    /// Priority or timeout outside the accepted range. Rejected before any mutation.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// No registered slot wraps the given queue handle.
    #[error("input queue not registered")]
    NotFound,

    /// The driver loop has already been started for this combiner.
    #[error("combiner loop already started")]
    AlreadyStarted,
}

impl CombinerError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}
