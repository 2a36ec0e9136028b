//! Sliding-window request counter.

use bulwark_core::Timestamp;
use std::collections::VecDeque;
use std::time::Duration;

/// Caps the number of admissions within a trailing window
///
/// Only timestamps younger than `window` are retained.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindow {
    timestamps: VecDeque<Timestamp>,
    window: Duration,
    max_count: u32,
}

impl SlidingWindow {
    /// Create an empty window
    #[must_use]
    pub fn new(window: Duration, max_count: u32) -> Self {
        Self {
            timestamps: VecDeque::new(),
            window,
            max_count,
        }
    }

    /// Drop timestamps that fell out of the window
    pub fn prune(&mut self, now: Timestamp) {
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether one more admission fits, without recording it
    #[must_use]
    pub fn has_room(&mut self, now: Timestamp) -> bool {
        self.prune(now);
        self.timestamps.len() < self.max_count as usize
    }

    /// Record an admission
    pub fn record(&mut self, now: Timestamp) {
        self.timestamps.push_back(now);
    }

    /// Record an admission if it fits
    pub fn try_record(&mut self, now: Timestamp) -> bool {
        if self.has_room(now) {
            self.record(now);
            true
        } else {
            false
        }
    }

    /// Admissions currently inside the window
    #[must_use]
    pub fn count(&mut self, now: Timestamp) -> usize {
        self.prune(now);
        self.timestamps.len()
    }

    /// Wait until the oldest admission leaves the window
    #[must_use]
    pub fn retry_after(&mut self, now: Timestamp) -> Duration {
        if self.has_room(now) {
            return Duration::ZERO;
        }
        self.timestamps
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(self.window)
    }

    /// Change span and limit
    pub fn reconfigure(&mut self, window: Duration, max_count: u32) {
        self.window = window;
        self.max_count = max_count;
    }

    /// Forget all admissions
    pub fn clear(&mut self) {
        self.timestamps.clear();
    }
}
