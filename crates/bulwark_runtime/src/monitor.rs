//! Request metrics and advisory recommendations.
//!
//! Counters are updated by the coordinator on every request; a snapshot
//! aggregates them with the stats of each component and derives
//! recommendations. Recommendations are advice, never errors.

use crate::batch::BatchStats;
use crate::breaker::BreakerStatus;
use crate::dedup::DedupStats;
use crate::scheduler::SchedulerStats;
use crate::throttle::ThrottleStats;
use bulwark_core::CircuitState;
use bulwark_storage::CacheStats;
use serde::Serialize;
use std::time::Duration;

const HIGH_THROTTLE_RATIO: f64 = 0.2;
const LOW_HIT_RATE: f64 = 0.3;
const MIN_CACHE_LOOKUPS: u64 = 20;
const MIN_BATCHES: u64 = 5;
const FREQUENT_STALE_RATIO: f64 = 0.1;

/// Per-request counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestMetrics {
    /// Requests handled
    pub total: u64,
    /// Requests that returned a value
    pub succeeded: u64,
    /// Requests that returned an error
    pub failed: u64,
    /// Requests rejected by the throttler
    pub throttled: u64,
    /// Requests served by another caller's execution
    pub deduplicated: u64,
    /// Requests served by a batch call
    pub batched: u64,
    /// Requests served from the cache
    pub cache_hits: u64,
    /// Requests answered with a stale value after a failure
    pub stale_served: u64,
    /// Requests that hit their deadline
    pub timed_out: u64,
    /// Requests refused by an open circuit
    pub circuit_rejected: u64,
    /// Extra attempts made by retry
    pub retries: u64,
    /// Sum of end-to-end latency of successful requests
    pub total_latency_ms: u64,
}

impl RequestMetrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get success rate (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.total as f64
    }

    /// Mean latency of successful requests
    #[must_use]
    pub fn avg_latency(&self) -> Duration {
        if self.succeeded == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_latency_ms / self.succeeded)
    }

    /// Reset metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What a recommendation is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// A large share of requests is throttled
    HighThrottleRatio,
    /// At least one circuit is open
    OpenCircuits,
    /// Cache rarely hits
    LowCacheHitRate,
    /// More callers wait than can run
    DeepQueue,
    /// Batches stay small
    LowBatchEfficiency,
    /// Stale values are served often
    FrequentStaleFallback,
}

/// Advisory note derived from a snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    /// Topic
    pub kind: RecommendationKind,
    /// Human readable advice
    pub message: String,
}

/// Point-in-time view of the whole coordinator
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Request counters
    pub requests: RequestMetrics,
    /// Smoothed system load (0.0 - 1.0)
    pub load: f64,
    /// Whether fallback mode is forced
    pub fallback_active: bool,
    /// Throttler stats
    pub throttle: ThrottleStats,
    /// Scheduler stats
    pub scheduler: SchedulerStats,
    /// Deduplicator stats
    pub dedup: DedupStats,
    /// Batch stats
    pub batch: BatchStats,
    /// Cache stats
    pub cache: CacheStats,
    /// Every known breaker
    pub breakers: Vec<BreakerStatus>,
    /// Advice
    pub recommendations: Vec<Recommendation>,
}

impl MetricsSnapshot {
    /// Fill `recommendations` from the other fields
    #[must_use]
    pub fn with_recommendations(mut self) -> Self {
        self.recommendations = recommend(&self);
        self
    }

    /// Whether any breaker is not closed
    #[must_use]
    pub fn has_open_circuits(&self) -> bool {
        self.breakers
            .iter()
            .any(|b| b.state != CircuitState::Closed)
    }
}

fn recommend(snapshot: &MetricsSnapshot) -> Vec<Recommendation> {
    let mut out = Vec::new();

    let ratio = snapshot.throttle.throttle_ratio();
    if ratio > HIGH_THROTTLE_RATIO {
        out.push(Recommendation {
            kind: RecommendationKind::HighThrottleRatio,
            message: format!(
                "{:.0}% of checked requests were throttled; raise max_burst or rate_per_second",
                ratio * 100.0
            ),
        });
    }

    let open: Vec<&str> = snapshot
        .breakers
        .iter()
        .filter(|b| b.state != CircuitState::Closed)
        .map(|b| b.resource.as_str())
        .collect();
    if !open.is_empty() {
        out.push(Recommendation {
            kind: RecommendationKind::OpenCircuits,
            message: format!("circuits not closed: {}", open.join(", ")),
        });
    }

    let cache = &snapshot.cache;
    let lookups = cache.tier1_hits + cache.tier2_hits + cache.misses;
    if lookups >= MIN_CACHE_LOOKUPS && cache.hit_rate() < LOW_HIT_RATE {
        out.push(Recommendation {
            kind: RecommendationKind::LowCacheHitRate,
            message: format!(
                "cache hit rate {:.0}%; consider a longer cache_ttl_default",
                cache.hit_rate() * 100.0
            ),
        });
    }

    let scheduler = &snapshot.scheduler;
    if scheduler.queued.total() > scheduler.max_concurrent * 2 {
        out.push(Recommendation {
            kind: RecommendationKind::DeepQueue,
            message: format!(
                "{} callers queued for {} slots; consider raising max_concurrent",
                scheduler.queued.total(),
                scheduler.max_concurrent
            ),
        });
    }

    let batch = &snapshot.batch;
    if batch.batches_flushed >= MIN_BATCHES
        && (batch.average_batch_size() < 2.0 || batch.individual_fallbacks > batch.members_batched)
    {
        out.push(Recommendation {
            kind: RecommendationKind::LowBatchEfficiency,
            message: format!(
                "average batch size {:.1}; consider a longer batch_max_wait",
                batch.average_batch_size()
            ),
        });
    }

    let requests = &snapshot.requests;
    if requests.total > 0
        && requests.stale_served as f64 / requests.total as f64 > FREQUENT_STALE_RATIO
    {
        out.push(Recommendation {
            kind: RecommendationKind::FrequentStaleFallback,
            message: format!(
                "{} of {} requests were answered with stale data",
                requests.stale_served, requests.total
            ),
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            requests: RequestMetrics::new(),
            load: 0.0,
            fallback_active: false,
            throttle: ThrottleStats::default(),
            scheduler: SchedulerStats {
                max_concurrent: 6,
                ..SchedulerStats::default()
            },
            dedup: DedupStats::default(),
            batch: BatchStats::default(),
            cache: CacheStats::default(),
            breakers: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    fn kinds(snapshot: MetricsSnapshot) -> Vec<RecommendationKind> {
        snapshot
            .with_recommendations()
            .recommendations
            .into_iter()
            .map(|r| r.kind)
            .collect()
    }

    #[test]
    fn test_metrics_rates() {
        let mut metrics = RequestMetrics::new();
        assert_eq!(metrics.success_rate(), 1.0);
        metrics.total = 4;
        metrics.succeeded = 3;
        metrics.total_latency_ms = 30;
        assert_eq!(metrics.success_rate(), 0.75);
        assert_eq!(metrics.avg_latency(), Duration::from_millis(10));
        metrics.reset();
        assert_eq!(metrics.total, 0);
    }

    #[test]
    fn test_quiet_snapshot_has_no_advice() {
        assert!(kinds(snapshot()).is_empty());
    }

    #[test]
    fn test_throttle_and_stale_advice() {
        let mut s = snapshot();
        s.throttle.checks = 10;
        s.throttle.throttled_bucket = 5;
        s.requests.total = 10;
        s.requests.stale_served = 2;
        assert_eq!(
            kinds(s),
            vec![
                RecommendationKind::HighThrottleRatio,
                RecommendationKind::FrequentStaleFallback
            ]
        );
    }

    #[test]
    fn test_queue_and_cache_advice() {
        let mut s = snapshot();
        s.scheduler.queued.low = 13;
        s.cache.misses = 20;
        assert_eq!(
            kinds(s),
            vec![
                RecommendationKind::LowCacheHitRate,
                RecommendationKind::DeepQueue
            ]
        );
    }

    #[test]
    fn test_small_batches_advice() {
        let mut s = snapshot();
        s.batch.batches_flushed = 5;
        s.batch.members_batched = 6;
        assert_eq!(kinds(s), vec![RecommendationKind::LowBatchEfficiency]);
    }
}
