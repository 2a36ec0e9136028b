//! Adaptive batch sizing.
//!
//! Tracks an EMA of batch efficiency (members per millisecond of backend
//! time) per group and nudges the target size one step at a time.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

const ALPHA: f64 = 0.3;
const TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
struct GroupEfficiency {
    ema: f64,
    target: usize,
}

/// Per-group target size
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizerSnapshot {
    /// Group key
    pub group: String,
    /// Smoothed members per millisecond
    pub efficiency: f64,
    /// Current target size
    pub target: usize,
}

/// Moves each group's target size toward better efficiency
#[derive(Debug, Clone)]
pub struct AdaptiveSizer {
    groups: HashMap<String, GroupEfficiency>,
    min_size: usize,
    max_size: usize,
    enabled: bool,
}

impl AdaptiveSizer {
    /// Create with bounds; a disabled sizer always answers `max_size`
    #[must_use]
    pub fn new(min_size: usize, max_size: usize, enabled: bool) -> Self {
        let min_size = min_size.max(1);
        Self {
            groups: HashMap::new(),
            min_size,
            max_size: max_size.max(min_size),
            enabled,
        }
    }

    /// Target size for `group`
    #[must_use]
    pub fn target(&self, group: &str) -> usize {
        if !self.enabled {
            return self.max_size;
        }
        self.groups
            .get(group)
            .map_or(self.max_size, |g| g.target)
            .clamp(self.min_size, self.max_size)
    }

    /// Record one batch execution
    pub fn record(&mut self, group: &str, size: usize, elapsed: Duration) {
        if !self.enabled || size == 0 {
            return;
        }
        let millis = (elapsed.as_secs_f64() * 1_000.0).max(1.0);
        let efficiency = size as f64 / millis;
        let (min_size, max_size) = (self.min_size, self.max_size);

        match self.groups.get_mut(group) {
            None => {
                self.groups.insert(
                    group.to_string(),
                    GroupEfficiency {
                        ema: efficiency,
                        target: max_size,
                    },
                );
            }
            Some(state) => {
                let previous = state.ema;
                let next = ALPHA * efficiency + (1.0 - ALPHA) * previous;
                if next > previous * (1.0 + TOLERANCE) {
                    state.target = (state.target + 1).min(max_size);
                } else if next < previous * (1.0 - TOLERANCE) {
                    state.target = state.target.saturating_sub(1).max(min_size);
                }
                state.ema = next;
            }
        }
    }

    /// Change bounds and switch
    pub fn reconfigure(&mut self, min_size: usize, max_size: usize, enabled: bool) {
        self.min_size = min_size.max(1);
        self.max_size = max_size.max(self.min_size);
        self.enabled = enabled;
        for state in self.groups.values_mut() {
            state.target = state.target.clamp(self.min_size, self.max_size);
        }
    }

    /// Per-group view, sorted by group
    #[must_use]
    pub fn snapshot(&self) -> Vec<SizerSnapshot> {
        let mut out: Vec<SizerSnapshot> = self
            .groups
            .iter()
            .map(|(group, state)| SizerSnapshot {
                group: group.clone(),
                efficiency: state.ema,
                target: state.target,
            })
            .collect();
        out.sort_by(|a, b| a.group.cmp(&b.group));
        out
    }

    /// Forget history
    pub fn reset(&mut self) {
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_max() {
        let sizer = AdaptiveSizer::new(2, 10, true);
        assert_eq!(sizer.target("g"), 10);
    }

    #[test]
    fn test_regression_shrinks_improvement_grows() {
        let mut sizer = AdaptiveSizer::new(2, 10, true);
        sizer.record("g", 10, Duration::from_millis(10));
        sizer.record("g", 10, Duration::from_millis(100));
        assert_eq!(sizer.target("g"), 9);
        sizer.record("g", 10, Duration::from_millis(100));
        assert_eq!(sizer.target("g"), 8);
        sizer.record("g", 10, Duration::from_millis(1));
        assert_eq!(sizer.target("g"), 9);
    }

    #[test]
    fn test_stable_efficiency_holds_target() {
        let mut sizer = AdaptiveSizer::new(2, 10, true);
        for _ in 0..5 {
            sizer.record("g", 5, Duration::from_millis(5));
        }
        assert_eq!(sizer.target("g"), 10);
    }

    #[test]
    fn test_target_respects_bounds() {
        let mut sizer = AdaptiveSizer::new(3, 4, true);
        sizer.record("g", 4, Duration::from_millis(1));
        for _ in 0..10 {
            sizer.record("g", 4, Duration::from_secs(10));
        }
        assert_eq!(sizer.target("g"), 3);
        sizer.reconfigure(5, 8, true);
        assert_eq!(sizer.target("g"), 5);
    }

    #[test]
    fn test_disabled_uses_max() {
        let mut sizer = AdaptiveSizer::new(2, 10, false);
        sizer.record("g", 10, Duration::from_secs(1));
        assert_eq!(sizer.target("g"), 10);
        assert!(sizer.snapshot().is_empty());
    }
}
