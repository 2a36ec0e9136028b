//! BULWARK Runtime
//!
//! Resilience components and the coordination facade built from them:
//! circuit breakers, in-flight deduplication, throttling, request batching
//! and priority admission, all behind [`Coordinator`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod breaker;
pub mod bucket;
pub mod coordinator;
pub mod dedup;
pub mod load;
pub mod monitor;
pub mod retry;
pub mod scheduler;
pub mod sizing;
pub mod throttle;
pub mod window;

pub use batch::{
    BatchCoordinator, BatchHandler, BatchRunner, BatchStats, Batched, DirectRunner,
    FnBatchHandler, GroupKey, batch_handler_fn,
};
pub use breaker::{BreakerRegistry, BreakerStatus, CircuitBreaker, StateChange, StateListener};
pub use bucket::TokenBucket;
pub use coordinator::{Coordinator, CoordinatorBuilder, Execution, ExecutionMetadata};
pub use dedup::{DedupStats, Deduplicated, Deduplicator};
pub use load::{LoadMonitor, LoadSample};
pub use monitor::{
    MetricsSnapshot, Recommendation, RecommendationKind, RequestMetrics,
};
pub use retry::RetryPolicy;
pub use scheduler::{PriorityScheduler, QueueDepths, SchedulerStats, SlotGuard, Urgency};
pub use sizing::{AdaptiveSizer, SizerSnapshot};
pub use throttle::{ThrottleDecision, ThrottleReason, ThrottleStats, Throttler};
pub use window::SlidingWindow;
