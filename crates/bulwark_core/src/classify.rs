//! Error classification seam.
//!
//! The coordinator never decides on its own whether a failure is worth a
//! retry or a cache fallback; it asks an [`ErrorClassifier`].

use crate::error::CoordError;
use serde::{Deserialize, Serialize};

/// Broad failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rejected by a rate limiter
    RateLimit,
    /// Refused by a circuit breaker
    Circuit,
    /// Deadline elapsed
    Timeout,
    /// Transport-level failure
    Network,
    /// Backend-side failure
    Server,
    /// Request was wrong; retrying will not help
    Client,
    /// Credentials rejected
    Auth,
    /// Cancelled by the caller or a reset
    Cancelled,
    /// Failure inside the coordination layer itself
    Internal,
}

/// Verdict of an [`ErrorClassifier`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Worth retrying with backoff
    pub is_retryable: bool,
    /// Caller should switch to an alternate transport
    pub should_switch_protocol: bool,
    /// A cached value may stand in for the result
    pub should_use_cache: bool,
    /// Failure category
    pub category: ErrorCategory,
}

impl Classification {
    /// Non-retryable, no fallback
    #[must_use]
    pub const fn fatal(category: ErrorCategory) -> Self {
        Self {
            is_retryable: false,
            should_switch_protocol: false,
            should_use_cache: false,
            category,
        }
    }

    /// Retryable, cache fallback allowed
    #[must_use]
    pub const fn transient(category: ErrorCategory) -> Self {
        Self {
            is_retryable: true,
            should_switch_protocol: false,
            should_use_cache: true,
            category,
        }
    }
}

/// Classifies failures for retry and fallback decisions
pub trait ErrorClassifier: Send + Sync {
    /// Classify a failure
    fn classify(&self, err: &CoordError) -> Classification;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&CoordError) -> Classification + Send + Sync,
{
    fn classify(&self, err: &CoordError) -> Classification {
        self(err)
    }
}

/// Classifier used when the caller supplies none
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl DefaultClassifier {
    fn is_auth_code(code: &str) -> bool {
        matches!(code, "401" | "403" | "unauthenticated" | "permission_denied")
    }

    fn is_network_code(code: &str) -> bool {
        matches!(
            code,
            "connection_reset" | "connection_refused" | "dns" | "network" | "unavailable"
        )
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, err: &CoordError) -> Classification {
        match err.root_cause() {
            CoordError::RateLimited { .. } => Classification {
                is_retryable: false,
                should_switch_protocol: false,
                should_use_cache: true,
                category: ErrorCategory::RateLimit,
            },
            CoordError::CircuitOpen { .. } => Classification {
                is_retryable: false,
                should_switch_protocol: true,
                should_use_cache: true,
                category: ErrorCategory::Circuit,
            },
            CoordError::Timeout { .. } => Classification::transient(ErrorCategory::Timeout),
            CoordError::Backend {
                code: Some(code), ..
            } if Self::is_auth_code(code) => Classification::fatal(ErrorCategory::Auth),
            CoordError::Backend {
                code: Some(code),
                retryable,
                ..
            } if Self::is_network_code(code) => Classification {
                is_retryable: *retryable,
                should_switch_protocol: true,
                should_use_cache: true,
                category: ErrorCategory::Network,
            },
            CoordError::Backend {
                retryable: true, ..
            } => Classification::transient(ErrorCategory::Server),
            CoordError::Backend { .. } => Classification::fatal(ErrorCategory::Client),
            CoordError::Cancelled => Classification::fatal(ErrorCategory::Cancelled),
            CoordError::Validation { .. }
            | CoordError::Storage { .. }
            | CoordError::DedupPropagated { .. }
            | CoordError::BatchPropagated { .. } => Classification::fatal(ErrorCategory::Internal),
        }
    }
}
