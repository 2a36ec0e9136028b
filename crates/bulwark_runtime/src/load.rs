//! Load monitoring for adaptive throttling.
//!
//! Each sample is reduced to a load score in `[0, 1]` and folded into an
//! exponential moving average. Above the threshold, Medium and Low requests
//! face a rejection probability proportional to the excess.

use bulwark_core::{AdaptiveConfig, Priority};
use std::time::Duration;

/// One observation of system load
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadSample {
    /// Backend executions in flight
    pub active: usize,
    /// Concurrency cap
    pub max_concurrent: usize,
    /// Callers waiting for a slot
    pub queue_depth: usize,
    /// Recent average request latency
    pub avg_latency: Duration,
}

/// EMA of system load
#[derive(Debug, Clone)]
pub struct LoadMonitor {
    ema: f64,
    samples: u64,
    config: AdaptiveConfig,
}

impl LoadMonitor {
    /// Create an idle monitor
    #[must_use]
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            ema: 0.0,
            samples: 0,
            config,
        }
    }

    /// Load score of a single sample (0.0 - 1.0)
    #[must_use]
    pub fn score(&self, sample: &LoadSample) -> f64 {
        let utilization = ratio(sample.active as f64, sample.max_concurrent as f64);
        let queue = ratio(
            sample.queue_depth as f64,
            self.config.queue_reference as f64,
        );
        let latency = ratio(
            sample.avg_latency.as_secs_f64(),
            self.config.latency_target.as_secs_f64(),
        );
        0.4 * utilization + 0.3 * queue + 0.3 * latency
    }

    /// Fold a sample into the average
    pub fn observe(&mut self, sample: &LoadSample) {
        let score = self.score(sample);
        self.ema = if self.samples == 0 {
            score
        } else {
            self.config.alpha * score + (1.0 - self.config.alpha) * self.ema
        };
        self.samples += 1;
    }

    /// Current smoothed load (0.0 - 1.0)
    #[must_use]
    pub fn load(&self) -> f64 {
        self.ema
    }

    /// Whether the smoothed load is above the threshold
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.config.enabled && self.ema > self.config.threshold
    }

    /// Rejection probability for a request of `priority`
    #[must_use]
    pub fn throttle_probability(&self, priority: Priority) -> f64 {
        if !self.is_overloaded() {
            return 0.0;
        }
        let headroom = 1.0 - self.config.threshold;
        let excess = if headroom <= f64::EPSILON {
            1.0
        } else {
            ((self.ema - self.config.threshold) / headroom).clamp(0.0, 1.0)
        };
        let p = excess * self.config.max_probability;
        match priority {
            Priority::Critical | Priority::High => 0.0,
            Priority::Medium => p / 2.0,
            Priority::Low => p,
        }
    }

    /// Replace settings, keeping the average
    pub fn reconfigure(&mut self, config: AdaptiveConfig) {
        self.config = config;
    }

    /// Retry hint for adaptively throttled callers
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        self.config.retry_after
    }

    /// Forget history
    pub fn reset(&mut self) {
        self.ema = 0.0;
        self.samples = 0;
    }
}

fn ratio(value: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return 0.0;
    }
    (value / reference).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saturated() -> LoadSample {
        LoadSample {
            active: 6,
            max_concurrent: 6,
            queue_depth: 100,
            avg_latency: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_idle_has_no_throttle() {
        let mut monitor = LoadMonitor::new(AdaptiveConfig::default());
        monitor.observe(&LoadSample::default());
        assert_eq!(monitor.load(), 0.0);
        assert_eq!(monitor.throttle_probability(Priority::Low), 0.0);
    }

    #[test]
    fn test_score_is_bounded() {
        let monitor = LoadMonitor::new(AdaptiveConfig::default());
        assert!((monitor.score(&saturated()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_smooths() {
        let mut monitor = LoadMonitor::new(AdaptiveConfig::default());
        monitor.observe(&LoadSample::default());
        monitor.observe(&saturated());
        assert!((monitor.load() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_probability_by_priority() {
        let mut monitor = LoadMonitor::new(AdaptiveConfig::default());
        monitor.observe(&saturated());
        assert!(monitor.is_overloaded());
        assert!((monitor.throttle_probability(Priority::Low) - 0.5).abs() < 1e-9);
        assert!((monitor.throttle_probability(Priority::Medium) - 0.25).abs() < 1e-9);
        assert_eq!(monitor.throttle_probability(Priority::High), 0.0);
        assert_eq!(monitor.throttle_probability(Priority::Critical), 0.0);
    }

    #[test]
    fn test_disabled_never_throttles() {
        let mut monitor = LoadMonitor::new(AdaptiveConfig {
            enabled: false,
            ..AdaptiveConfig::default()
        });
        monitor.observe(&saturated());
        assert_eq!(monitor.throttle_probability(Priority::Low), 0.0);
        monitor.reset();
        assert_eq!(monitor.load(), 0.0);
    }
}
