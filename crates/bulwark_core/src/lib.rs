//! BULWARK Core Types
//!
//! Shared vocabulary for the coordination layer: the error taxonomy, the
//! clock abstraction, priority classes, request descriptors, configuration
//! and the seams to external collaborators (error classifier, telemetry).
//! Nothing in this crate talks to a backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod id;
pub mod priority;
pub mod rng;
pub mod state;
pub mod telemetry;
pub mod time;

// Re-exports
pub use classify::{Classification, DefaultClassifier, ErrorCategory, ErrorClassifier};
pub use config::{
    AdaptiveConfig, BatchConfig, BreakerConfig, CacheConfig, ConfigError, ConfigPatch,
    CoordinatorConfig, RetryConfig, ThrottleConfig, ThrottleMode,
};
pub use descriptor::{BatchSpec, CachePolicy, ExecuteOptions, RequestDescriptor, Work, WorkFuture};
pub use error::{CoordError, CoordResult};
pub use id::RequestId;
pub use priority::{Priority, PriorityContext, PriorityTable};
pub use rng::{FixedRandom, RandomSource, SeededRandom};
pub use state::CircuitState;
pub use telemetry::{NullSink, RecordingSink, TelemetryEvent, TelemetrySink, TracingSink, emit_safely};
pub use time::{Clock, ManualClock, SharedClock, SystemClock, Timestamp, duration_millis};
