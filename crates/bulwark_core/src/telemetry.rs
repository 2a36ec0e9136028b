//! Structured telemetry events and sinks.
//!
//! The coordinator and the breakers push [`TelemetryEvent`]s into a
//! [`TelemetrySink`]. Delivery is best effort: [`emit_safely`] contains a
//! panicking sink so telemetry can never change an outcome.

use crate::id::RequestId;
use crate::priority::Priority;
use crate::state::CircuitState;
use crate::time::Timestamp;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};

/// Structured event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A circuit breaker changed state
    BreakerTransition {
        /// Guarded resource
        resource: String,
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
        /// Transition instant
        at: Timestamp,
    },
    /// A request was throttled
    Throttled {
        /// Request
        request: RequestId,
        /// Resource key
        resource: String,
        /// Request priority
        priority: Priority,
        /// Which check rejected it
        reason: String,
        /// Suggested wait in milliseconds
        retry_after_ms: u64,
    },
    /// A request produced a value
    RequestCompleted {
        /// Request
        request: RequestId,
        /// Resource key
        resource: String,
        /// Request priority
        priority: Priority,
        /// End-to-end time in milliseconds
        execution_time_ms: u64,
        /// Served by a batch
        was_batched: bool,
        /// Attached to another caller's execution
        was_deduplicated: bool,
        /// Served from the cache
        from_cache: bool,
        /// Backend attempts made
        attempts: u32,
    },
    /// A request failed
    RequestFailed {
        /// Request
        request: RequestId,
        /// Resource key
        resource: String,
        /// Request priority
        priority: Priority,
        /// Error kind label
        error_kind: String,
        /// Error message
        message: String,
    },
    /// A stale cached value replaced a failure
    StaleServed {
        /// Request
        request: RequestId,
        /// Resource key
        resource: String,
        /// Age of the value in milliseconds
        age_ms: u64,
    },
    /// A batch group was flushed
    BatchFlushed {
        /// Group key
        group: String,
        /// Members in the flush
        size: usize,
        /// Backend time in milliseconds
        execution_time_ms: u64,
        /// Members ran one by one instead of as a batch
        individual: bool,
    },
    /// A failed attempt will be retried
    Retrying {
        /// Request
        request: RequestId,
        /// Resource key
        resource: String,
        /// Attempt that failed (1-based)
        attempt: u32,
        /// Backoff before the next attempt in milliseconds
        delay_ms: u64,
    },
    /// The persistent cache tier failed and was bypassed
    CacheTierDegraded {
        /// Tier operation
        operation: String,
        /// Failure message
        reason: String,
    },
}

impl TelemetryEvent {
    /// Stable event name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BreakerTransition { .. } => "breaker_transition",
            Self::Throttled { .. } => "throttled",
            Self::RequestCompleted { .. } => "request_completed",
            Self::RequestFailed { .. } => "request_failed",
            Self::StaleServed { .. } => "stale_served",
            Self::BatchFlushed { .. } => "batch_flushed",
            Self::Retrying { .. } => "retrying",
            Self::CacheTierDegraded { .. } => "cache_tier_degraded",
        }
    }
}

/// Receiver of telemetry events
pub trait TelemetrySink: Send + Sync {
    /// Deliver one event
    fn emit(&self, event: &TelemetryEvent);
}

/// Deliver an event, swallowing a panicking sink
pub fn emit_safely(sink: &dyn TelemetrySink, event: &TelemetryEvent) {
    if catch_unwind(AssertUnwindSafe(|| sink.emit(event))).is_err() {
        tracing::warn!(event = event.name(), "telemetry sink panicked; event dropped");
    }
}

/// Sink that forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::BreakerTransition { resource, from, to, at } => {
                tracing::info!(%resource, %from, %to, %at, "circuit breaker transition");
            }
            TelemetryEvent::Throttled {
                request,
                resource,
                priority,
                reason,
                retry_after_ms,
            } => {
                tracing::debug!(%request, %resource, %priority, %reason, retry_after_ms, "request throttled");
            }
            TelemetryEvent::RequestCompleted {
                request,
                resource,
                execution_time_ms,
                was_batched,
                was_deduplicated,
                from_cache,
                attempts,
                ..
            } => {
                tracing::debug!(
                    %request,
                    %resource,
                    execution_time_ms,
                    was_batched,
                    was_deduplicated,
                    from_cache,
                    attempts,
                    "request completed"
                );
            }
            TelemetryEvent::RequestFailed {
                request,
                resource,
                error_kind,
                message,
                ..
            } => {
                tracing::debug!(%request, %resource, %error_kind, %message, "request failed");
            }
            TelemetryEvent::StaleServed { request, resource, age_ms } => {
                tracing::warn!(%request, %resource, age_ms, "serving stale cached value");
            }
            TelemetryEvent::BatchFlushed {
                group,
                size,
                execution_time_ms,
                individual,
            } => {
                tracing::info!(%group, size, execution_time_ms, individual, "batch flushed");
            }
            TelemetryEvent::Retrying {
                request,
                resource,
                attempt,
                delay_ms,
            } => {
                tracing::debug!(%request, %resource, attempt, delay_ms, "retrying after failure");
            }
            TelemetryEvent::CacheTierDegraded { operation, reason } => {
                tracing::warn!(%operation, %reason, "persistent cache tier degraded");
            }
        }
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: &TelemetryEvent) {}
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events
    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events with the given name
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    /// Drop all recorded events
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: &TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingSink;

    impl TelemetrySink for PanickingSink {
        fn emit(&self, _event: &TelemetryEvent) {
            panic!("sink exploded");
        }
    }

    fn transition() -> TelemetryEvent {
        TelemetryEvent::BreakerTransition {
            resource: "orders".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            at: Timestamp::from_millis(10),
        }
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        emit_safely(&sink, &transition());
        emit_safely(
            &sink,
            &TelemetryEvent::CacheTierDegraded {
                operation: "get".to_string(),
                reason: "io".to_string(),
            },
        );
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.count("breaker_transition"), 1);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        emit_safely(&PanickingSink, &transition());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(transition()).unwrap();
        assert_eq!(json["event"], "breaker_transition");
        assert_eq!(json["to"], "open");
    }

    #[test]
    fn test_tracing_and_null_sinks_accept_events() {
        TracingSink.emit(&transition());
        NullSink.emit(&transition());
    }
}
