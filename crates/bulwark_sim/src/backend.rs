//! Failure-injecting backend.
//!
//! The backend answers after a seeded latency draw and fails either at
//! random (with `failure_probability`) or unconditionally inside an
//! outage window. Outage failures carry a network error code so the
//! default classifier treats them as transient.

use crate::seed::SimSeed;
use bulwark_core::{CoordError, CoordResult, SharedClock, Timestamp};
use futures::future::BoxFuture;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Window of simulated time in which every call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outage {
    /// First failing millisecond
    pub start_ms: u64,
    /// First millisecond after the outage
    pub end_ms: u64,
}

impl Outage {
    /// Outage covering `[start_ms, end_ms)`
    #[must_use]
    pub const fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    /// Whether `at` falls inside the outage
    #[must_use]
    pub fn contains(&self, at: Timestamp) -> bool {
        (self.start_ms..self.end_ms).contains(&at.as_millis())
    }
}

/// How the backend misbehaves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendProfile {
    /// Probability that a call fails outside an outage
    pub failure_probability: f64,
    /// Lower bound of the latency draw
    pub min_latency_ms: u64,
    /// Upper bound of the latency draw (inclusive)
    pub max_latency_ms: u64,
    /// Hard outages
    pub outages: Vec<Outage>,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            failure_probability: 0.05,
            min_latency_ms: 5,
            max_latency_ms: 40,
            outages: Vec::new(),
        }
    }
}

impl BackendProfile {
    /// Backend that never fails
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            failure_probability: 0.0,
            ..Self::default()
        }
    }

    /// Set failure probability
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f64) -> Self {
        self.failure_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Set the latency range
    #[must_use]
    pub fn with_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.min_latency_ms = min_ms.min(max_ms);
        self.max_latency_ms = max_ms.max(min_ms);
        self
    }

    /// Add an outage window
    #[must_use]
    pub fn with_outage(mut self, outage: Outage) -> Self {
        self.outages.push(outage);
        self
    }
}

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    /// Single calls received
    pub calls: u64,
    /// Batch calls received
    pub batch_calls: u64,
    /// Items carried by batch calls
    pub batch_items: u64,
    /// Random failures injected
    pub injected_failures: u64,
    /// Calls refused during an outage
    pub outage_failures: u64,
}

/// Simulated backend
#[derive(Debug)]
pub struct SimBackend {
    profile: BackendProfile,
    clock: SharedClock,
    rng: Mutex<ChaCha8Rng>,
    stats: Mutex<BackendStats>,
}

enum Verdict {
    Outage,
    Fail(Duration),
    Ok(Duration),
}

impl SimBackend {
    /// Create a backend drawing from `seed`
    #[must_use]
    pub fn new(profile: BackendProfile, seed: &SimSeed, clock: SharedClock) -> Self {
        Self {
            profile,
            clock,
            rng: Mutex::new(seed.rng()),
            stats: Mutex::new(BackendStats::default()),
        }
    }

    /// Profile in use
    #[must_use]
    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> BackendStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn verdict(&self, items: u64, batch: bool) -> Verdict {
        let now = self.clock.now();
        let outage = self.profile.outages.iter().any(|o| o.contains(now));

        let (latency, fail) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            let latency = rng.gen_range(self.profile.min_latency_ms..=self.profile.max_latency_ms);
            let fail = rng.r#gen::<f64>() < self.profile.failure_probability;
            (Duration::from_millis(latency), fail)
        };

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        if batch {
            stats.batch_calls += 1;
            stats.batch_items += items;
        } else {
            stats.calls += 1;
        }
        if outage {
            stats.outage_failures += 1;
            Verdict::Outage
        } else if fail {
            stats.injected_failures += 1;
            Verdict::Fail(latency)
        } else {
            Verdict::Ok(latency)
        }
    }

    fn outage_error() -> CoordError {
        CoordError::backend("backend unavailable").with_code("connection_refused")
    }

    fn injected_error() -> CoordError {
        CoordError::backend("injected failure").with_code("unavailable")
    }

    /// Fetch `key`
    ///
    /// The value is `"{key}@{ms}"` where `ms` is the simulated time the
    /// call started.
    pub fn call(self: &Arc<Self>, key: String) -> BoxFuture<'static, CoordResult<String>> {
        let backend = Arc::clone(self);
        Box::pin(async move {
            let started = backend.clock.now().as_millis();
            match backend.verdict(1, false) {
                Verdict::Outage => Err(Self::outage_error()),
                Verdict::Fail(latency) => {
                    backend.clock.sleep(latency).await;
                    Err(Self::injected_error())
                }
                Verdict::Ok(latency) => {
                    backend.clock.sleep(latency).await;
                    Ok(format!("{key}@{started}"))
                }
            }
        })
    }

    /// Fetch several keys in one call
    ///
    /// Each parameter must be a JSON string. A non-string parameter fails
    /// only its own item.
    pub fn call_batch(
        self: &Arc<Self>,
        params: Vec<Value>,
    ) -> BoxFuture<'static, CoordResult<Vec<CoordResult<String>>>> {
        let backend = Arc::clone(self);
        Box::pin(async move {
            let started = backend.clock.now().as_millis();
            match backend.verdict(params.len() as u64, true) {
                Verdict::Outage => Err(Self::outage_error()),
                Verdict::Fail(latency) => {
                    backend.clock.sleep(latency).await;
                    Err(Self::injected_error())
                }
                Verdict::Ok(latency) => {
                    backend.clock.sleep(latency).await;
                    Ok(params
                        .into_iter()
                        .map(|param| match param {
                            Value::String(key) => Ok(format!("{key}@{started}")),
                            other => Err(CoordError::validation(
                                "params",
                                format!("expected a string key, got {other}"),
                            )),
                        })
                        .collect())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::ManualClock;
    use futures::FutureExt;

    fn backend(profile: BackendProfile, clock: &ManualClock) -> Arc<SimBackend> {
        Arc::new(SimBackend::new(
            profile,
            &SimSeed::from_literal(1),
            clock.shared(),
        ))
    }

    #[test]
    fn test_outage_contains() {
        let outage = Outage::new(100, 200);
        assert!(!outage.contains(Timestamp::from_millis(99)));
        assert!(outage.contains(Timestamp::from_millis(100)));
        assert!(outage.contains(Timestamp::from_millis(199)));
        assert!(!outage.contains(Timestamp::from_millis(200)));
    }

    #[test]
    fn test_profile_builders_clamp() {
        let profile = BackendProfile::healthy()
            .with_failure_probability(3.0)
            .with_latency(50, 10);
        assert_eq!(profile.failure_probability, 1.0);
        assert_eq!((profile.min_latency_ms, profile.max_latency_ms), (10, 50));
    }

    #[tokio::test]
    async fn test_healthy_call_waits_for_latency() {
        let clock = ManualClock::new();
        let backend = backend(BackendProfile::healthy().with_latency(10, 10), &clock);

        let mut call = backend.call("user:1".to_string());
        assert!((&mut call).now_or_never().is_none());
        clock.advance(Duration::from_millis(10));
        assert_eq!(call.await.ok(), Some("user:1@0".to_string()));
        assert_eq!(backend.stats().calls, 1);
    }

    #[tokio::test]
    async fn test_outage_fails_fast_with_network_code() {
        let clock = ManualClock::new();
        let backend = backend(BackendProfile::healthy().with_outage(Outage::new(0, 50)), &clock);

        let err = backend.call("k".to_string()).await.err();
        assert!(matches!(
            err,
            Some(CoordError::Backend { code: Some(ref c), retryable: true, .. }) if c == "connection_refused"
        ));
        assert_eq!(backend.stats().outage_failures, 1);
    }

    #[tokio::test]
    async fn test_certain_failure_is_injected() {
        let clock = ManualClock::new();
        let backend = backend(
            BackendProfile::healthy()
                .with_failure_probability(1.0)
                .with_latency(0, 0),
            &clock,
        );
        assert!(backend.call("k".to_string()).await.is_err());
        assert_eq!(backend.stats().injected_failures, 1);
    }

    #[tokio::test]
    async fn test_batch_maps_items_in_order() {
        let clock = ManualClock::new();
        let backend = backend(BackendProfile::healthy().with_latency(0, 0), &clock);

        let results = backend
            .call_batch(vec![Value::from("a"), Value::from(1), Value::from("b")])
            .await
            .unwrap_or_default();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_deref().ok(), Some("a@0"));
        assert!(results[1].is_err());
        assert_eq!(results[2].as_deref().ok(), Some("b@0"));

        let stats = backend.stats();
        assert_eq!((stats.batch_calls, stats.batch_items, stats.calls), (1, 3, 0));
    }

    #[test]
    fn test_same_seed_same_draws() {
        let clock = ManualClock::new();
        let profile = BackendProfile::default().with_failure_probability(0.5);
        let a = backend(profile.clone(), &clock);
        let b = backend(profile, &clock);
        for _ in 0..20 {
            let fa = matches!(a.verdict(1, false), Verdict::Ok(_));
            let fb = matches!(b.verdict(1, false), Verdict::Ok(_));
            assert_eq!(fa, fb);
        }
        assert_eq!(a.stats(), b.stats());
    }
}
