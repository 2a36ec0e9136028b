//! Error taxonomy for the coordination layer.
//!
//! Errors are `Clone` because a single outcome is fanned out to every
//! waiter of a deduplicated execution or a batch.

use crate::time::Timestamp;
use std::time::Duration;

/// Coordination result type
pub type CoordResult<T> = Result<T, CoordError>;

/// Coordination error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    /// Request rejected by the throttler
    #[error("Rate limited ({reason}), retry after {}ms", .retry_after.as_millis())]
    RateLimited {
        /// Suggested wait before retrying
        retry_after: Duration,
        /// Which check rejected the request
        reason: String,
    },

    /// Circuit breaker refused the call
    #[error("Circuit open for {resource}, next retry at {next_retry_at}")]
    CircuitOpen {
        /// Guarded resource
        resource: String,
        /// Earliest instant a probe will be admitted
        next_retry_at: Timestamp,
    },

    /// Caller-side deadline elapsed
    #[error("Timeout: {operation} after {}ms", .after.as_millis())]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Backend call failed
    #[error("Backend error: {message}")]
    Backend {
        /// Error message from the backend
        message: String,
        /// Backend-specific error code, if any
        code: Option<String>,
        /// Whether the backend flagged the failure as transient
        retryable: bool,
    },

    /// Failure of a shared (deduplicated) execution
    #[error("Deduplicated execution {key} failed: {source}")]
    DedupPropagated {
        /// Deduplication key
        key: String,
        /// Underlying failure
        source: Box<CoordError>,
    },

    /// Failure of a whole batch, delivered to every member
    #[error("Batch {group} of {size} failed: {source}")]
    BatchPropagated {
        /// Batch group key
        group: String,
        /// Number of members in the batch
        size: usize,
        /// Underlying failure
        source: Box<CoordError>,
    },

    /// Cancelled before completion
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid input or configuration
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// What was wrong
        reason: String,
    },

    /// Cache storage failure
    #[error("Storage error: {reason}")]
    Storage {
        /// Error message
        reason: String,
    },
}

impl CoordError {
    /// Transient backend failure
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Permanent backend failure
    #[must_use]
    pub fn backend_fatal(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Attach a backend error code (no-op for other variants)
    #[must_use]
    pub fn with_code(mut self, new_code: impl Into<String>) -> Self {
        if let Self::Backend { code, .. } = &mut self {
            *code = Some(new_code.into());
        }
        self
    }

    /// Validation failure
    #[must_use]
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Strip dedup/batch propagation wrappers
    #[must_use]
    pub fn root_cause(&self) -> &CoordError {
        match self {
            Self::DedupPropagated { source, .. } | Self::BatchPropagated { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Short stable name of the variant, for metrics labels
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::Backend { .. } => "backend",
            Self::DedupPropagated { .. } => "dedup_propagated",
            Self::BatchPropagated { .. } => "batch_propagated",
            Self::Cancelled => "cancelled",
            Self::Validation { .. } => "validation",
            Self::Storage { .. } => "storage",
        }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation {
            field: "json".to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordError::Cancelled;
        assert_eq!(format!("{}", err), "Operation cancelled");

        let err = CoordError::RateLimited {
            retry_after: Duration::from_millis(250),
            reason: "token_bucket".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Rate limited (token_bucket), retry after 250ms"
        );
    }

    #[test]
    fn test_circuit_open_carries_retry_time() {
        let err = CoordError::CircuitOpen {
            resource: "orders".to_string(),
            next_retry_at: Timestamp::from_millis(30_000),
        };
        let s = format!("{}", err);
        assert!(s.contains("orders"));
        assert!(s.contains("30000ms"));
    }

    #[test]
    fn test_root_cause_unwraps_nested() {
        let inner = CoordError::backend("connection reset");
        let err = CoordError::BatchPropagated {
            group: "g".to_string(),
            size: 3,
            source: Box::new(CoordError::DedupPropagated {
                key: "k".to_string(),
                source: Box::new(inner.clone()),
            }),
        };
        assert_eq!(err.root_cause(), &inner);
        assert_eq!(err.kind(), "batch_propagated");
    }

    #[test]
    fn test_with_code_only_touches_backend() {
        let err = CoordError::backend_fatal("denied").with_code("403");
        assert!(matches!(
            err,
            CoordError::Backend { code: Some(ref c), retryable: false, .. } if c == "403"
        ));

        let err = CoordError::Cancelled.with_code("x");
        assert_eq!(err, CoordError::Cancelled);
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(CoordError::backend("a"), CoordError::backend("a"));
        assert_ne!(CoordError::backend("a"), CoordError::backend_fatal("a"));
    }
}
