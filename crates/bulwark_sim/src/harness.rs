//! Simulation harness.
//!
//! Plans a seeded workload, drives it through a `Coordinator<String>` on a
//! [`ManualClock`] and tallies the outcomes. Time only moves when the
//! harness advances the clock, so a run over minutes of simulated traffic
//! finishes in milliseconds. Run it on a current-thread runtime for a
//! replayable task order.

use crate::backend::{BackendProfile, BackendStats, SimBackend};
use crate::seed::SimSeed;
use bulwark_core::{
    BatchSpec, CachePolicy, Clock, CoordError, CoordinatorConfig, ManualClock, Priority,
    PriorityTable, RequestDescriptor, SeededRandom, TracingSink,
};
use bulwark_runtime::{Coordinator, Execution, MetricsSnapshot, batch_handler_fn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const BATCH_CLASS: &str = "list";
const OPERATION: &str = "fetch";
const YIELDS_PER_TICK: usize = 32;

/// Simulation error
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// The coordinator rejected its configuration
    #[error("Coordinator setup failed: {0}")]
    Coordinator(#[from] CoordError),

    /// Requests were still pending when the time budget ran out
    #[error("Simulation stalled at {at_ms}ms with {pending} requests pending")]
    Stalled {
        /// Simulated time reached
        at_ms: u64,
        /// Requests that never completed
        pending: usize,
    },
}

/// Shape of the generated traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workload {
    /// Requests to issue
    pub requests: usize,
    /// Mean gap between arrivals
    pub inter_arrival_ms: u64,
    /// Distinct keys per resource class
    pub key_space: usize,
    /// Resource classes to draw from, uniformly
    pub classes: Vec<String>,
    /// Share of requests with cache read-through
    pub cache_fraction: f64,
    /// Share of batch-class requests that join a batch
    pub batch_fraction: f64,
    /// Accept stale values on failure
    pub allow_stale: bool,
    /// Sleep through throttling
    pub auto_wait: bool,
    /// Per-request deadline
    pub timeout_ms: Option<u64>,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            requests: 500,
            inter_arrival_ms: 5,
            key_space: 20,
            classes: ["auth", "profile", "query", "list", "analytics", "prefetch"]
                .into_iter()
                .map(String::from)
                .collect(),
            cache_fraction: 0.5,
            batch_fraction: 0.8,
            allow_stale: true,
            auto_wait: false,
            timeout_ms: Some(2_000),
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Root seed
    pub seed: SimSeed,
    /// Generated traffic
    pub workload: Workload,
    /// Backend behavior
    pub backend: BackendProfile,
    /// Coordinator under test
    pub coordinator: CoordinatorConfig,
    /// Clock step per harness tick
    pub tick_ms: u64,
    /// Simulated time allowed after the last arrival
    pub drain_budget_ms: u64,
}

impl SimConfig {
    /// Default run for `seed`
    #[must_use]
    pub fn new(seed: SimSeed) -> Self {
        Self {
            seed,
            workload: Workload::default(),
            backend: BackendProfile::default(),
            coordinator: CoordinatorConfig::default(),
            tick_ms: 1,
            drain_budget_ms: 600_000,
        }
    }

    /// Set the request count
    #[must_use]
    pub fn with_requests(mut self, requests: usize) -> Self {
        self.workload.requests = requests;
        self
    }

    /// Set the workload
    #[must_use]
    pub fn with_workload(mut self, workload: Workload) -> Self {
        self.workload = workload;
        self
    }

    /// Set the backend profile
    #[must_use]
    pub fn with_backend(mut self, backend: BackendProfile) -> Self {
        self.backend = backend;
        self
    }

    /// Set the coordinator configuration
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(SimSeed::default())
    }
}

/// Outcomes of one priority class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityOutcome {
    /// Requests issued
    pub requests: u64,
    /// Requests that returned a value
    pub succeeded: u64,
    /// Requests that returned an error
    pub failed: u64,
    /// Successes answered from the cache
    pub from_cache: u64,
    /// Successes answered with a stale value
    pub stale: u64,
    /// Successes attached to another caller's execution
    pub deduplicated: u64,
    /// Successes served by a batch call
    pub batched: u64,
    /// Successes that waited through throttling
    pub throttled: u64,
    /// Sum of execution time of successes
    pub total_latency_ms: u64,
}

impl PriorityOutcome {
    /// Mean execution time of successes
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        if self.succeeded == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / self.succeeded as f64
    }

    fn record(&mut self, result: &Result<Execution<String>, CoordError>) {
        match result {
            Ok(execution) => {
                let meta = &execution.metadata;
                self.succeeded += 1;
                self.from_cache += u64::from(meta.from_cache);
                self.stale += u64::from(meta.stale);
                self.deduplicated += u64::from(meta.was_deduplicated);
                self.batched += u64::from(meta.was_batched);
                self.throttled += u64::from(meta.was_throttled);
                self.total_latency_ms += meta.execution_time.as_millis() as u64;
            }
            Err(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    by_priority: BTreeMap<Priority, PriorityOutcome>,
    errors: BTreeMap<String, u64>,
}

/// Result of a run
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Root seed
    pub seed: u64,
    /// Requests issued
    pub requests: usize,
    /// Requests that returned a value
    pub succeeded: u64,
    /// Requests that returned an error
    pub failed: u64,
    /// Simulated time until the last request finished
    pub virtual_elapsed_ms: u64,
    /// Outcomes by priority, most urgent first
    pub by_priority: BTreeMap<Priority, PriorityOutcome>,
    /// Failures by root error kind
    pub errors: BTreeMap<String, u64>,
    /// Backend counters
    pub backend: BackendStats,
    /// Coordinator snapshot at the end of the run
    pub metrics: MetricsSnapshot,
}

impl SimReport {
    /// Share of requests that succeeded
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.requests as f64
    }

    /// Pretty JSON rendering
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Planned {
    arrival_ms: u64,
    class: String,
    key: String,
    cached: bool,
    batched: bool,
}

/// Drives a coordinator through a seeded workload
#[derive(Debug, Clone, Default)]
pub struct SimHarness {
    config: SimConfig,
}

impl SimHarness {
    /// Create a harness
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn plan(&self) -> Vec<Planned> {
        let workload = &self.config.workload;
        let mut rng = self.config.seed.derive("workload").rng();
        let mut arrival_ms = 0u64;
        let mut plan = Vec::with_capacity(workload.requests);

        for _ in 0..workload.requests {
            let class = if workload.classes.is_empty() {
                "query".to_string()
            } else {
                workload.classes[rng.gen_range(0..workload.classes.len())].clone()
            };
            let key = format!("{class}:{}", rng.gen_range(0..workload.key_space.max(1)));
            let cached = rng.r#gen::<f64>() < workload.cache_fraction;
            let batched = class == BATCH_CLASS && rng.r#gen::<f64>() < workload.batch_fraction;
            plan.push(Planned {
                arrival_ms,
                class,
                key,
                cached,
                batched,
            });
            if workload.inter_arrival_ms > 0 {
                arrival_ms += rng.gen_range(0..=workload.inter_arrival_ms * 2);
            }
        }
        plan
    }

    fn descriptor(
        &self,
        planned: &Planned,
        backend: &Arc<SimBackend>,
    ) -> RequestDescriptor<String> {
        let workload = &self.config.workload;
        let work_backend = Arc::clone(backend);
        let work_key = planned.key.clone();
        let mut descriptor = RequestDescriptor::new(planned.class.as_str(), OPERATION, move || {
            work_backend.call(work_key.clone())
        });

        if planned.batched {
            descriptor = descriptor.with_batch(BatchSpec::new(
                "by_key",
                serde_json::Value::String(planned.key.clone()),
            ));
        } else {
            descriptor = descriptor.with_dedup_key(planned.key.clone());
        }
        if planned.cached {
            descriptor = descriptor.with_cache(
                CachePolicy::new(planned.class.as_str(), planned.key.as_str()).read_through(),
            );
        }
        if workload.allow_stale {
            descriptor = descriptor.with_stale_fallback();
        }
        if workload.auto_wait {
            descriptor = descriptor.with_auto_wait();
        }
        if let Some(ms) = workload.timeout_ms {
            descriptor = descriptor.with_timeout(Duration::from_millis(ms));
        }
        descriptor
    }

    /// Run the simulation to completion
    ///
    /// # Errors
    ///
    /// Returns `Coordinator` if the coordinator configuration is invalid
    /// and `Stalled` if requests are still pending once the drain budget
    /// is spent.
    pub async fn run(&self) -> Result<SimReport, SimError> {
        let config = &self.config;
        let clock = ManualClock::new();
        let backend = Arc::new(SimBackend::new(
            config.backend.clone(),
            &config.seed.derive("backend"),
            clock.shared(),
        ));
        let coordinator = Coordinator::<String>::builder(config.coordinator.clone())
            .with_clock(clock.shared())
            .with_random(Box::new(SeededRandom::new(config.seed.derive("throttle").seed)))
            .with_sink(Arc::new(TracingSink))
            .build()?;

        let batch_backend = Arc::clone(&backend);
        coordinator.register_batch_handler(
            BATCH_CLASS,
            OPERATION,
            batch_handler_fn(move |params| batch_backend.call_batch(params)),
        );

        let plan = self.plan();
        let last_arrival = plan.last().map_or(0, |p| p.arrival_ms);
        info!(
            seed = config.seed.seed,
            requests = plan.len(),
            last_arrival_ms = last_arrival,
            "Starting simulation"
        );

        let priorities = PriorityTable::default();
        let tally = Arc::new(Mutex::new(Tally::default()));
        let mut handles = Vec::with_capacity(plan.len());
        for planned in &plan {
            let descriptor = self.descriptor(planned, &backend);
            let coordinator = coordinator.clone();
            let tally = Arc::clone(&tally);
            let arrival = clock.sleep(Duration::from_millis(planned.arrival_ms));
            let priority = descriptor.priority(&priorities);
            handles.push(tokio::spawn(async move {
                arrival.await;
                let result = coordinator.execute(descriptor).await;
                if let Err(err) = &result {
                    debug!(priority = %priority, error = %err, "Simulated request failed");
                }
                let mut tally = tally.lock().unwrap_or_else(PoisonError::into_inner);
                let outcome = tally.by_priority.entry(priority).or_default();
                outcome.requests += 1;
                outcome.record(&result);
                if let Err(err) = &result {
                    *tally
                        .errors
                        .entry(err.root_cause().kind().to_string())
                        .or_default() += 1;
                }
            }));
        }

        let budget = last_arrival.saturating_add(config.drain_budget_ms);
        let tick = Duration::from_millis(config.tick_ms.max(1));
        loop {
            for _ in 0..YIELDS_PER_TICK {
                tokio::task::yield_now().await;
            }
            let pending = handles.iter().filter(|h| !h.is_finished()).count();
            if pending == 0 {
                break;
            }
            let now = clock.now().as_millis();
            if now >= budget {
                warn!(at_ms = now, pending, "Simulation stalled");
                for handle in &handles {
                    handle.abort();
                }
                return Err(SimError::Stalled { at_ms: now, pending });
            }
            clock.advance(tick);
        }

        let virtual_elapsed_ms = clock.now().as_millis();
        let tally = std::mem::take(&mut *tally.lock().unwrap_or_else(PoisonError::into_inner));
        let succeeded = tally.by_priority.values().map(|o| o.succeeded).sum();
        let failed = tally.by_priority.values().map(|o| o.failed).sum();
        let report = SimReport {
            seed: config.seed.seed,
            requests: plan.len(),
            succeeded,
            failed,
            virtual_elapsed_ms,
            by_priority: tally.by_priority,
            errors: tally.errors,
            backend: backend.stats(),
            metrics: coordinator.metrics(),
        };
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            elapsed_ms = virtual_elapsed_ms,
            "Simulation finished"
        );
        Ok(report)
    }
}
