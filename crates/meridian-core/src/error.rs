//! Core error kinds shared across the engine, scheduler, and queue.
//!
//! Errors crossing the executor and repository boundaries use the tagged
//! `{success, data|error}` shape described in the repository/executor
//! contracts; internally we use this sum type so callers can match on
//! `ErrorKind` without string parsing.

use thiserror::Error;

/// Broad classification of a failure, independent of which component raised it.
///
/// This mirrors the error-kind taxonomy in the error handling design: kinds
/// determine retry eligibility, not the specific error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Definition invalid, bad cron expression, missing required field. Never retried.
    Validation,
    /// Executor, definition, or schedule not found. Never retried.
    NotFound,
    /// DB deadlock, lease conflict, network blip. Retried locally a bounded number of times.
    Transient,
    /// Executor returned `success=false`. Retried up to max_attempts with backoff.
    ExecutorFailure,
    /// Executor exceeded a timeout. Retried as transient; exhausting budget becomes terminal.
    Timeout,
    /// The caller no longer holds the lease it tried to write under.
    LeaseLost,
    /// Programming error or invariant violation. Terminal, escalates entity health to "error".
    Fatal,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth retrying at all.
    ///
    /// `LeaseLost` is deliberately excluded: the current actor must abort,
    /// not retry, because another actor may already own the entity.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::ExecutorFailure | ErrorKind::Timeout
        )
    }
}

/// A structured error recorded on an entity (task node, instance, schedule, queue job).
///
/// Stored verbatim on the owning row so the read model never loses the
/// reason a thing failed.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn executor_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutorFailure, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn lease_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LeaseLost, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_lost_is_never_retryable() {
        assert!(!ErrorKind::LeaseLost.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
    }

    #[test]
    fn transient_and_executor_failures_are_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::ExecutorFailure.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
    }

    #[test]
    fn with_details_attaches_context() {
        let err = CoreError::validation("bad cron expression").with_details("field: cron_expression");
        assert_eq!(err.details.as_deref(), Some("field: cron_expression"));
    }
}
