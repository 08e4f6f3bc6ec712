//! Error types for the scheduler and the HTTP dispatcher.
//!
//! Store failures are transient: the loop that hit one logs it and tries
//! again on its next tick. Dispatcher errors never escape a worker; they are
//! classified into an attempt outcome and written to the store.

use hooky_core::CoreError;
use thiserror::Error;

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors surfaced by the scheduler lifecycle and its loops.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Task store operation failed.
    #[error("store error: {0}")]
    Store(#[from] CoreError),

    /// Invalid scheduler configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },

    /// `start` was called while the scheduler was not stopped.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// Loops did not finish within the shutdown grace period.
    #[error("shutdown timed out after {timeout_secs}s")]
    ShutdownTimeout {
        /// Grace period that elapsed.
        timeout_secs: u64,
    },

    /// A loop task panicked.
    #[error("worker panicked: {message}")]
    WorkerPanic {
        /// Panic description from the join handle.
        message: String,
    },

    /// Unexpected internal failure.
    #[error("internal scheduler error: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl SchedulerError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns true if the failing operation should simply be retried on the
    /// next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::Configuration { .. }
            | Self::AlreadyRunning
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::Internal { .. } => false,
        }
    }
}

/// Failure to complete one HTTP delivery.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The request could not be constructed (bad URL, method or header).
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was invalid.
        message: String,
    },

    /// No response arrived within the per-call timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Connection-level failure.
    #[error("network error: {message}")]
    Network {
        /// Transport error description.
        message: String,
    },

    /// The response body could not be read.
    #[error("failed to read response body: {message}")]
    Body {
        /// Read error description.
        message: String,
    },
}

impl DispatchError {
    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Returns false for errors that would fail identically on every retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } | Self::Body { .. } => true,
            Self::InvalidRequest { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_transient_only_for_database_failures() {
        assert!(SchedulerError::from(CoreError::Database("reset".into())).is_transient());
        assert!(!SchedulerError::from(CoreError::NotFound("task".into())).is_transient());
        assert!(!SchedulerError::AlreadyRunning.is_transient());
        assert!(!SchedulerError::configuration("zero workers").is_transient());
    }

    #[test]
    fn only_invalid_requests_are_terminal() {
        assert!(DispatchError::Timeout { timeout_ms: 30_000 }.is_retryable());
        assert!(DispatchError::network("connection refused").is_retryable());
        assert!(DispatchError::Body { message: "eof".into() }.is_retryable());
        assert!(!DispatchError::invalid_request("bad method").is_retryable());
    }

    #[test]
    fn error_display_format() {
        assert_eq!(
            DispatchError::Timeout { timeout_ms: 1_500 }.to_string(),
            "request timeout after 1500ms"
        );
        assert_eq!(
            SchedulerError::ShutdownTimeout { timeout_secs: 30 }.to_string(),
            "shutdown timed out after 30s"
        );
    }
}
