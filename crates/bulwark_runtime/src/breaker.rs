//! Per-resource circuit breakers.
//!
//! Transitions:
//! - `closed -> open` when consecutive failures reach the threshold
//! - `open -> half_open` once the cooldown has elapsed (evaluated lazily)
//! - `half_open -> closed` on a probe success
//! - `half_open -> open` on a probe failure, with the cooldown multiplied
//!   and capped
//!
//! Listeners run synchronously after the breaker lock is released.

use bulwark_core::{
    BreakerConfig, CircuitState, CoordError, SharedClock, TelemetryEvent, TelemetrySink,
    Timestamp, duration_millis, emit_safely,
};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// A single state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    /// Guarded resource
    pub resource: String,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Transition instant
    pub at: Timestamp,
}

/// State change listener
pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    /// Guarded resource
    pub resource: String,
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Most recent failure
    pub last_failure_at: Option<Timestamp>,
    /// Most recent success
    pub last_success_at: Option<Timestamp>,
    /// Current cooldown in milliseconds
    pub reset_timeout_ms: u64,
    /// When a probe will next be admitted, while open
    pub next_retry_at: Option<Timestamp>,
    /// Probes admitted and not yet resolved
    pub half_open_probes_in_flight: u32,
    /// Calls refused since creation
    pub rejected: u64,
    /// Failures recorded since creation
    pub total_failures: u64,
    /// Successes recorded since creation
    pub total_successes: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Timestamp>,
    last_success_at: Option<Timestamp>,
    opened_at: Option<Timestamp>,
    reset_timeout: Duration,
    probes_in_flight: u32,
    rejected: u64,
    total_failures: u64,
    total_successes: u64,
}

impl BreakerState {
    fn new(reset_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            reset_timeout,
            probes_in_flight: 0,
            rejected: 0,
            total_failures: 0,
            total_successes: 0,
        }
    }

    fn next_retry_at(&self) -> Option<Timestamp> {
        match self.state {
            CircuitState::Open => self
                .opened_at
                .map(|opened| opened.saturating_add(self.reset_timeout)),
            _ => None,
        }
    }
}

/// Circuit breaker guarding one resource
pub struct CircuitBreaker {
    resource: String,
    config: RwLock<BreakerConfig>,
    clock: SharedClock,
    state: Mutex<BreakerState>,
    listeners: RwLock<Vec<StateListener>>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    #[must_use]
    pub fn new(resource: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            resource: resource.into(),
            state: Mutex::new(BreakerState::new(config.reset_timeout)),
            config: RwLock::new(config),
            clock,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Guarded resource
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Register a transition listener
    pub fn on_state_change(&self, listener: StateListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Current state, after any due `open -> half_open` transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let (state, change) = {
            let mut guard = self.lock();
            let change = self.maybe_half_open(&mut guard);
            (guard.state, change)
        };
        self.notify(change);
        state
    }

    /// Whether a call may go ahead now
    ///
    /// In `half_open` each `true` answer claims one of the probe slots.
    #[must_use]
    pub fn can_proceed(&self) -> bool {
        self.check().is_ok()
    }

    /// Like [`can_proceed`](Self::can_proceed), but says when to come back
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` carrying the next probe time
    pub fn check(&self) -> Result<(), CoordError> {
        let max_probes = self.config().half_open_max_attempts;
        let (result, change) = {
            let mut guard = self.lock();
            let change = self.maybe_half_open(&mut guard);
            let now = self.clock.now();
            let result = match guard.state {
                CircuitState::Closed => Ok(()),
                CircuitState::HalfOpen if guard.probes_in_flight < max_probes => {
                    guard.probes_in_flight += 1;
                    Ok(())
                }
                CircuitState::HalfOpen => {
                    guard.rejected += 1;
                    Err(now)
                }
                CircuitState::Open => {
                    guard.rejected += 1;
                    Err(guard.next_retry_at().unwrap_or(now))
                }
            };
            (result, change)
        };
        self.notify(change);
        result.map_err(|next_retry_at| CoordError::CircuitOpen {
            resource: self.resource.clone(),
            next_retry_at,
        })
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let base = self.config().reset_timeout;
        let change = {
            let mut guard = self.lock();
            let now = self.clock.now();
            guard.last_success_at = Some(now);
            guard.total_successes += 1;
            match guard.state {
                CircuitState::Closed => {
                    guard.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    guard.consecutive_failures = 0;
                    guard.reset_timeout = base;
                    self.transition(&mut guard, CircuitState::Closed, now)
                }
                CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    /// Record a failed call
    pub fn record_failure(&self, err: &CoordError) {
        let config = self.config();
        let change = {
            let mut guard = self.lock();
            let now = self.clock.now();
            guard.last_failure_at = Some(now);
            guard.total_failures += 1;
            guard.consecutive_failures = guard.consecutive_failures.saturating_add(1);
            match guard.state {
                CircuitState::Closed if guard.consecutive_failures >= config.failure_threshold => {
                    tracing::debug!(resource = %self.resource, error = %err, "failure threshold reached");
                    self.transition(&mut guard, CircuitState::Open, now)
                }
                CircuitState::HalfOpen => {
                    let grown = guard.reset_timeout.mul_f64(config.backoff_multiplier);
                    guard.reset_timeout = grown.min(config.max_reset_timeout);
                    tracing::debug!(
                        resource = %self.resource,
                        error = %err,
                        reset_timeout_ms = duration_millis(guard.reset_timeout),
                        "probe failed"
                    );
                    self.transition(&mut guard, CircuitState::Open, now)
                }
                _ => None,
            }
        };
        self.notify(change);
    }

    /// Force the breaker open now
    pub fn force_open(&self) {
        let change = {
            let mut guard = self.lock();
            let now = self.clock.now();
            if guard.state == CircuitState::Open {
                guard.opened_at = Some(now);
                None
            } else {
                self.transition(&mut guard, CircuitState::Open, now)
            }
        };
        self.notify(change);
    }

    /// Return to `closed` with cleared counters and the base cooldown
    pub fn reset(&self) {
        let base = self.config().reset_timeout;
        let change = {
            let mut guard = self.lock();
            let now = self.clock.now();
            guard.consecutive_failures = 0;
            guard.reset_timeout = base;
            if guard.state == CircuitState::Closed {
                None
            } else {
                self.transition(&mut guard, CircuitState::Closed, now)
            }
        };
        self.notify(change);
    }

    /// Apply new settings
    pub fn reconfigure(&self, config: BreakerConfig) {
        {
            let mut guard = self.lock();
            guard.reset_timeout = if guard.state == CircuitState::Closed {
                config.reset_timeout
            } else {
                guard
                    .reset_timeout
                    .clamp(config.reset_timeout, config.max_reset_timeout)
            };
        }
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Point-in-time status
    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        let (status, change) = {
            let mut guard = self.lock();
            let change = self.maybe_half_open(&mut guard);
            let status = BreakerStatus {
                resource: self.resource.clone(),
                state: guard.state,
                consecutive_failures: guard.consecutive_failures,
                last_failure_at: guard.last_failure_at,
                last_success_at: guard.last_success_at,
                reset_timeout_ms: duration_millis(guard.reset_timeout),
                next_retry_at: guard.next_retry_at(),
                half_open_probes_in_flight: guard.probes_in_flight,
                rejected: guard.rejected,
                total_failures: guard.total_failures,
                total_successes: guard.total_successes,
            };
            (status, change)
        };
        self.notify(change);
        status
    }

    fn config(&self) -> BreakerConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn maybe_half_open(&self, guard: &mut BreakerState) -> Option<StateChange> {
        let now = self.clock.now();
        match guard.next_retry_at() {
            Some(due) if now >= due => self.transition(guard, CircuitState::HalfOpen, now),
            _ => None,
        }
    }

    fn transition(
        &self,
        guard: &mut BreakerState,
        to: CircuitState,
        now: Timestamp,
    ) -> Option<StateChange> {
        let from = guard.state;
        if from == to {
            return None;
        }
        guard.state = to;
        guard.probes_in_flight = 0;
        match to {
            CircuitState::Open => guard.opened_at = Some(now),
            CircuitState::Closed => {
                guard.opened_at = None;
                guard.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {}
        }
        Some(StateChange {
            resource: self.resource.clone(),
            from,
            to,
            at: now,
        })
    }

    fn notify(&self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };
        tracing::info!(
            resource = %change.resource,
            from = %change.from,
            to = %change.to,
            "circuit breaker transition"
        );
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&change))).is_err() {
                tracing::warn!(resource = %change.resource, "state change listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("resource", &self.resource)
            .field("state", &self.lock().state)
            .finish_non_exhaustive()
    }
}

/// One breaker per resource key, created on first use
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: RwLock<BreakerConfig>,
    clock: SharedClock,
    listeners: Arc<RwLock<Vec<StateListener>>>,
    sink: Arc<dyn TelemetrySink>,
}

impl BreakerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: BreakerConfig, clock: SharedClock, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            clock,
            listeners: Arc::new(RwLock::new(Vec::new())),
            sink,
        }
    }

    /// Breaker for `resource`, created if missing
    #[must_use]
    pub fn get(&self, resource: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
        {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(resource.to_string()).or_insert_with(|| {
            let config = self
                .config
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let breaker = CircuitBreaker::new(resource, config, Arc::clone(&self.clock));
            let listeners = Arc::clone(&self.listeners);
            let sink = Arc::clone(&self.sink);
            breaker.on_state_change(Arc::new(move |change: &StateChange| {
                emit_safely(
                    sink.as_ref(),
                    &TelemetryEvent::BreakerTransition {
                        resource: change.resource.clone(),
                        from: change.from,
                        to: change.to,
                        at: change.at,
                    },
                );
                let registered = listeners
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for listener in registered {
                    if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                        tracing::warn!(resource = %change.resource, "registry listener panicked");
                    }
                }
            }));
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    /// Listen to transitions of every breaker, present and future
    pub fn on_state_change(&self, listener: StateListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Status of one resource, if its breaker exists
    #[must_use]
    pub fn status(&self, resource: &str) -> Option<BreakerStatus> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned()
            .map(|breaker| breaker.status())
    }

    /// Status of every breaker, sorted by resource
    #[must_use]
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut statuses: Vec<BreakerStatus> = breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.resource.cmp(&b.resource));
        statuses
    }

    /// Force `resource` open
    pub fn force_open(&self, resource: &str) {
        self.get(resource).force_open();
    }

    /// Close every breaker
    pub fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset();
        }
    }

    /// Apply new settings to every breaker, present and future
    pub fn reconfigure(&self, config: BreakerConfig) {
        for breaker in self.all() {
            breaker.reconfigure(config.clone());
        }
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{ManualClock, NullSink, RecordingSink};

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(10),
            half_open_max_attempts: 1,
            backoff_multiplier: 1.5,
            max_reset_timeout: Duration::from_secs(20),
        }
    }

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new("orders", config(), clock.shared())
    }

    fn fail(b: &CircuitBreaker, n: u32) {
        for _ in 0..n {
            b.record_failure(&CoordError::backend("boom"));
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let clock = ManualClock::new();
        let b = breaker(&clock);
        fail(&b, 2);
        assert!(b.can_proceed());
        fail(&b, 1);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_proceed());
    }

    #[test]
    fn test_success_clears_consecutive_failures() {
        let clock = ManualClock::new();
        let b = breaker(&clock);
        fail(&b, 2);
        b.record_success();
        fail(&b, 2);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.status().consecutive_failures, 2);
    }

    #[test]
    fn test_circuit_open_carries_next_retry() {
        let clock = ManualClock::starting_at(1_000);
        let b = breaker(&clock);
        fail(&b, 3);
        match b.check() {
            Err(CoordError::CircuitOpen { next_retry_at, .. }) => {
                assert_eq!(next_retry_at, Timestamp::from_millis(11_000));
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let clock = ManualClock::new();
        let b = breaker(&clock);
        fail(&b, 3);
        clock.advance(Duration::from_millis(9_999));
        assert!(!b.can_proceed());
        clock.advance(Duration::from_millis(1));
        assert!(b.can_proceed());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(!b.can_proceed());
    }

    #[test]
    fn test_probe_success_closes() {
        let clock = ManualClock::new();
        let b = breaker(&clock);
        fail(&b, 3);
        clock.advance(Duration::from_secs(10));
        assert!(b.can_proceed());
        b.record_success();
        let status = b.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
        assert!(b.can_proceed());
    }

    #[test]
    fn test_probe_failure_extends_cooldown_with_cap() {
        let clock = ManualClock::new();
        let b = breaker(&clock);
        fail(&b, 3);

        clock.advance(Duration::from_secs(10));
        assert!(b.can_proceed());
        fail(&b, 1);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.status().reset_timeout_ms, 15_000);

        clock.advance(Duration::from_millis(14_999));
        assert!(!b.can_proceed());
        clock.advance(Duration::from_millis(1));
        assert!(b.can_proceed());
        fail(&b, 1);
        assert_eq!(b.status().reset_timeout_ms, 20_000);

        clock.advance(Duration::from_secs(20));
        assert!(b.can_proceed());
        fail(&b, 1);
        assert_eq!(b.status().reset_timeout_ms, 20_000);

        clock.advance(Duration::from_secs(20));
        assert!(b.can_proceed());
        b.record_success();
        assert_eq!(b.status().reset_timeout_ms, 10_000);
    }

    #[test]
    fn test_listeners_see_every_transition() {
        let clock = ManualClock::new();
        let b = breaker(&clock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        b.on_state_change(Arc::new(move |change: &StateChange| {
            sink.lock().unwrap().push((change.from, change.to));
        }));

        fail(&b, 3);
        clock.advance(Duration::from_secs(10));
        let _ = b.state();
        let _ = b.can_proceed();
        b.record_success();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_listener_may_query_breaker() {
        let clock = ManualClock::new();
        let b = Arc::new(breaker(&clock));
        let inner = Arc::clone(&b);
        b.on_state_change(Arc::new(move |_change: &StateChange| {
            let _ = inner.status();
        }));
        fail(&b, 3);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_force_open_and_reset() {
        let clock = ManualClock::new();
        let b = breaker(&clock);
        b.force_open();
        assert!(!b.can_proceed());
        b.reset();
        assert!(b.can_proceed());
        assert_eq!(b.status().rejected, 1);
    }

    #[test]
    fn test_registry_creates_lazily_and_forwards() {
        let clock = ManualClock::new();
        let sink = Arc::new(RecordingSink::new());
        let registry = BreakerRegistry::new(config(), clock.shared(), sink.clone());
        let opened = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&opened);
        registry.on_state_change(Arc::new(move |change: &StateChange| {
            record.lock().unwrap().push(change.resource.clone());
        }));

        assert!(registry.status("a").is_none());
        let a = registry.get("a");
        assert!(Arc::ptr_eq(&a, &registry.get("a")));
        registry.force_open("b");

        assert_eq!(opened.lock().unwrap().as_slice(), ["b".to_string()]);
        assert_eq!(sink.count("breaker_transition"), 1);
        assert_eq!(registry.statuses().len(), 2);

        registry.reset_all();
        assert_eq!(registry.status("b").map(|s| s.state), Some(CircuitState::Closed));
    }

    #[test]
    fn test_registry_listener_panic_spares_later_listeners() {
        let clock = ManualClock::new();
        let registry = BreakerRegistry::new(config(), clock.shared(), Arc::new(NullSink));
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry.on_state_change(Arc::new(|change: &StateChange| {
            if change.to != change.from {
                panic!("listener bug");
            }
        }));
        let record = Arc::clone(&seen);
        registry.on_state_change(Arc::new(move |change: &StateChange| {
            record.lock().unwrap().push(change.to);
        }));

        registry.force_open("orders");
        registry.reset_all();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[CircuitState::Open, CircuitState::Closed]
        );
    }

    #[test]
    fn test_registry_reconfigure_applies_to_new_breakers() {
        let clock = ManualClock::new();
        let registry = BreakerRegistry::new(config(), clock.shared(), Arc::new(NullSink));
        registry.reconfigure(BreakerConfig {
            failure_threshold: 1,
            ..config()
        });
        let b = registry.get("fresh");
        b.record_failure(&CoordError::backend("x"));
        assert_eq!(b.state(), CircuitState::Open);
    }
}
