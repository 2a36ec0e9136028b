//! Admission throttling.
//!
//! Three checks, in order: sliding window, token bucket, adaptive load
//! throttle. Every check is evaluated before anything is committed, so a
//! rejected request never takes a token or a window slot. Critical
//! requests skip all of them.

use crate::bucket::TokenBucket;
use crate::load::{LoadMonitor, LoadSample};
use crate::window::SlidingWindow;
use bulwark_core::{
    Priority, RandomSource, RequestId, SeededRandom, SharedClock, ThrottleConfig,
};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Which check rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    /// Sustained rate cap
    SlidingWindow,
    /// Burst capacity exhausted
    TokenBucket,
    /// Probabilistic load shedding
    Adaptive,
}

impl ThrottleReason {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SlidingWindow => "sliding_window",
            Self::TokenBucket => "token_bucket",
            Self::Adaptive => "adaptive",
        }
    }
}

impl std::fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a throttle check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    /// Request must not proceed now
    pub throttled: bool,
    /// Suggested wait, when throttled
    pub retry_after: Option<Duration>,
    /// Rejecting check, when throttled
    pub reason: Option<ThrottleReason>,
}

impl ThrottleDecision {
    /// Admit
    #[must_use]
    pub const fn admit() -> Self {
        Self {
            throttled: false,
            retry_after: None,
            reason: None,
        }
    }

    /// Reject
    #[must_use]
    pub const fn reject(reason: ThrottleReason, retry_after: Duration) -> Self {
        Self {
            throttled: true,
            retry_after: Some(retry_after),
            reason: Some(reason),
        }
    }
}

/// Throttle statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    /// Requests checked
    pub checks: u64,
    /// Rejected by the sliding window
    pub throttled_window: u64,
    /// Rejected by the token bucket
    pub throttled_bucket: u64,
    /// Rejected by the adaptive layer
    pub throttled_adaptive: u64,
    /// Critical requests that skipped the checks
    pub bypassed: u64,
}

impl ThrottleStats {
    /// Total rejections
    #[must_use]
    pub fn throttled(&self) -> u64 {
        self.throttled_window + self.throttled_bucket + self.throttled_adaptive
    }

    /// Fraction of checks that were rejected
    #[must_use]
    pub fn throttle_ratio(&self) -> f64 {
        if self.checks == 0 {
            return 0.0;
        }
        self.throttled() as f64 / self.checks as f64
    }
}

struct ThrottleState {
    config: ThrottleConfig,
    bucket: TokenBucket,
    window: SlidingWindow,
    load: LoadMonitor,
    stats: ThrottleStats,
}

/// Token bucket, sliding window and adaptive load throttle
pub struct Throttler {
    state: Mutex<ThrottleState>,
    rng: Mutex<Box<dyn RandomSource>>,
    clock: SharedClock,
}

impl Throttler {
    /// Create with a default-seeded random source
    #[must_use]
    pub fn new(config: ThrottleConfig, clock: SharedClock) -> Self {
        Self::with_random(config, clock, Box::new(SeededRandom::default()))
    }

    /// Create with an explicit random source
    #[must_use]
    pub fn with_random(
        config: ThrottleConfig,
        clock: SharedClock,
        rng: Box<dyn RandomSource>,
    ) -> Self {
        let now = clock.now();
        let state = ThrottleState {
            bucket: TokenBucket::new(config.max_burst, config.rate_per_second, now),
            window: SlidingWindow::new(config.window, config.window_max_requests),
            load: LoadMonitor::new(config.adaptive.clone()),
            stats: ThrottleStats::default(),
            config,
        };
        Self {
            state: Mutex::new(state),
            rng: Mutex::new(rng),
            clock,
        }
    }

    /// Decide whether a request may proceed, consuming capacity if it may
    pub fn should_throttle(
        &self,
        id: RequestId,
        priority: Priority,
        resource_key: &str,
    ) -> ThrottleDecision {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stats.checks += 1;

        if priority.is_critical() {
            state.stats.bypassed += 1;
            return ThrottleDecision::admit();
        }

        let mode = state.config.mode;
        if mode.uses_window() && !state.window.has_room(now) {
            state.stats.throttled_window += 1;
            let retry_after = state.window.retry_after(now);
            tracing::debug!(%id, %resource_key, %priority, "throttled by sliding window");
            return ThrottleDecision::reject(ThrottleReason::SlidingWindow, retry_after);
        }
        if mode.uses_bucket() && !state.bucket.has_token(now) {
            state.stats.throttled_bucket += 1;
            let retry_after = state.bucket.time_until_available(now);
            tracing::debug!(%id, %resource_key, %priority, "throttled by token bucket");
            return ThrottleDecision::reject(ThrottleReason::TokenBucket, retry_after);
        }

        let probability = state.load.throttle_probability(priority);
        if probability > 0.0 {
            let draw = self
                .rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .next_f64();
            if draw < probability {
                state.stats.throttled_adaptive += 1;
                tracing::debug!(%id, %resource_key, %priority, probability, "shed under load");
                return ThrottleDecision::reject(ThrottleReason::Adaptive, state.load.retry_after());
            }
        }

        if mode.uses_window() {
            state.window.record(now);
        }
        if mode.uses_bucket() {
            state.bucket.try_consume(now);
        }
        ThrottleDecision::admit()
    }

    /// Feed a load observation to the adaptive layer
    pub fn observe_load(&self, sample: &LoadSample) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .load
            .observe(sample);
    }

    /// Smoothed load
    #[must_use]
    pub fn load(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .load
            .load()
    }

    /// Apply new settings; the bucket keeps its fill, clamped
    pub fn reconfigure(&self, config: ThrottleConfig) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .bucket
            .reconfigure(config.max_burst, config.rate_per_second, now);
        state
            .window
            .reconfigure(config.window, config.window_max_requests);
        state.load.reconfigure(config.adaptive.clone());
        state.config = config;
    }

    /// Refill the bucket, clear the window, forget load history and stats
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.bucket.fill(now);
        state.window.clear();
        state.load.reset();
        state.stats = ThrottleStats::default();
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> ThrottleStats {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{AdaptiveConfig, FixedRandom, ManualClock, ThrottleMode};

    fn config(burst: u32, window_max: u32, mode: ThrottleMode) -> ThrottleConfig {
        ThrottleConfig {
            max_burst: burst,
            rate_per_second: 1.0,
            window: Duration::from_secs(1),
            window_max_requests: window_max,
            mode,
            adaptive: AdaptiveConfig::default(),
        }
    }

    fn check(t: &Throttler, p: Priority) -> ThrottleDecision {
        t.should_throttle(RequestId::new(), p, "orders")
    }

    #[test]
    fn test_burst_boundary() {
        let clock = ManualClock::new();
        let t = Throttler::new(config(5, 100, ThrottleMode::Both), clock.shared());
        for _ in 0..5 {
            assert!(!check(&t, Priority::Medium).throttled);
        }
        let sixth = check(&t, Priority::Low);
        assert!(sixth.throttled);
        assert_eq!(sixth.reason, Some(ThrottleReason::TokenBucket));
        assert_eq!(sixth.retry_after, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_critical_always_bypasses() {
        let clock = ManualClock::new();
        let t = Throttler::new(config(1, 1, ThrottleMode::Both), clock.shared());
        assert!(!check(&t, Priority::High).throttled);
        assert!(check(&t, Priority::High).throttled);
        for _ in 0..100 {
            assert!(!check(&t, Priority::Critical).throttled);
        }
        assert_eq!(t.stats().bypassed, 100);
    }

    #[test]
    fn test_window_rejection_keeps_tokens() {
        let clock = ManualClock::new();
        let t = Throttler::new(config(10, 2, ThrottleMode::Both), clock.shared());
        assert!(!check(&t, Priority::Medium).throttled);
        assert!(!check(&t, Priority::Medium).throttled);
        let d = check(&t, Priority::Medium);
        assert_eq!(d.reason, Some(ThrottleReason::SlidingWindow));
        clock.advance(Duration::from_secs(1));
        for _ in 0..2 {
            assert!(!check(&t, Priority::Medium).throttled);
        }
        let stats = t.stats();
        assert_eq!(stats.throttled_window, 1);
        assert_eq!(stats.checks, 5);
    }

    #[test]
    fn test_mode_selects_checks() {
        let clock = ManualClock::new();
        let bucket_only = Throttler::new(config(3, 1, ThrottleMode::TokenBucket), clock.shared());
        for _ in 0..3 {
            assert!(!check(&bucket_only, Priority::Medium).throttled);
        }

        let window_only =
            Throttler::new(config(1, 3, ThrottleMode::SlidingWindow), clock.shared());
        for _ in 0..3 {
            assert!(!check(&window_only, Priority::Medium).throttled);
        }
        assert!(check(&window_only, Priority::Medium).throttled);
    }

    #[test]
    fn test_adaptive_sheds_low_priority_deterministically() {
        let clock = ManualClock::new();
        let t = Throttler::with_random(
            config(100, 100, ThrottleMode::Both),
            clock.shared(),
            Box::new(FixedRandom(0.3)),
        );
        t.observe_load(&LoadSample {
            active: 6,
            max_concurrent: 6,
            queue_depth: 50,
            avg_latency: Duration::from_secs(1),
        });
        let low = check(&t, Priority::Low);
        assert!(low.throttled);
        assert_eq!(low.reason, Some(ThrottleReason::Adaptive));
        assert!(!check(&t, Priority::Medium).throttled);
        assert!(!check(&t, Priority::High).throttled);
        assert_eq!(t.stats().throttled_adaptive, 1);
    }

    #[test]
    fn test_reset_restores_capacity() {
        let clock = ManualClock::new();
        let t = Throttler::new(config(1, 10, ThrottleMode::Both), clock.shared());
        assert!(!check(&t, Priority::Medium).throttled);
        assert!(check(&t, Priority::Medium).throttled);
        t.reset();
        assert!(!check(&t, Priority::Medium).throttled);
        assert!((t.stats().throttle_ratio() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reconfigure_raises_burst() {
        let clock = ManualClock::new();
        let t = Throttler::new(config(1, 10, ThrottleMode::TokenBucket), clock.shared());
        assert!(!check(&t, Priority::Medium).throttled);
        t.reconfigure(config(3, 10, ThrottleMode::TokenBucket));
        assert!(check(&t, Priority::Medium).throttled);
        clock.advance(Duration::from_secs(2));
        assert!(!check(&t, Priority::Medium).throttled);
        assert!(!check(&t, Priority::Medium).throttled);
    }
}
