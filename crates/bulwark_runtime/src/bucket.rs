//! Token bucket.

use bulwark_core::Timestamp;
use std::time::Duration;

/// Token bucket with continuous refill
///
/// The token count always stays within `[0, capacity]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Timestamp,
}

impl TokenBucket {
    /// Create a full bucket
    #[must_use]
    pub fn new(capacity: u32, refill_rate: f64, now: Timestamp) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(0.0),
            last_refill: now,
        }
    }

    /// Add the tokens earned since the last refill
    pub fn refill(&mut self, now: Timestamp) {
        let elapsed_ms = now.duration_since(self.last_refill).as_millis() as f64;
        self.tokens = (self.tokens + elapsed_ms * self.refill_rate / 1_000.0).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Whether a token is available, without taking it
    #[must_use]
    pub fn has_token(&mut self, now: Timestamp) -> bool {
        self.refill(now);
        self.tokens >= 1.0
    }

    /// Take one token if available
    pub fn try_consume(&mut self, now: Timestamp) -> bool {
        if self.has_token(now) {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until one token is available
    #[must_use]
    pub fn time_until_available(&mut self, now: Timestamp) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else if self.refill_rate <= 0.0 {
            Duration::MAX
        } else {
            let needed = 1.0 - self.tokens;
            Duration::from_millis((needed / self.refill_rate * 1_000.0).ceil() as u64)
        }
    }

    /// Change capacity and rate, keeping the current fill clamped
    pub fn reconfigure(&mut self, capacity: u32, refill_rate: f64, now: Timestamp) {
        self.refill(now);
        self.capacity = f64::from(capacity);
        self.refill_rate = refill_rate.max(0.0);
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Refill to capacity
    pub fn fill(&mut self, now: Timestamp) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }

    /// Tokens currently held
    #[must_use]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Capacity
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
