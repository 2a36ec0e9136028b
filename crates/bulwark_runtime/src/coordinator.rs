//! The coordination facade.
//!
//! `execute` runs one request through the whole pipeline:
//! 1. priority from the table (or the descriptor's override)
//! 2. throttle gate, optionally sleeping through rejections
//! 3. cache read-through
//! 4. forced-fallback check
//! 5. collapse through the deduplicator or a batch group
//! 6. scheduler slot, circuit breaker and retry around the backend call
//! 7. cache write-through, or stale fallback on a qualifying failure
//!
//! Backend executions run on spawned tasks, so a caller that times out or
//! goes away only fails its own future.

use crate::batch::{BatchCoordinator, BatchHandler, BatchRunner, GroupKey};
use crate::breaker::{BreakerRegistry, BreakerStatus, StateListener};
use crate::dedup::Deduplicator;
use crate::load::LoadSample;
use crate::monitor::{MetricsSnapshot, RequestMetrics};
use crate::retry::RetryPolicy;
use crate::scheduler::{PriorityScheduler, Urgency};
use crate::throttle::Throttler;
use bulwark_core::{
    CachePolicy, ConfigPatch, CoordError, CoordResult, CoordinatorConfig, DefaultClassifier,
    ErrorClassifier, Priority, PriorityTable, RandomSource, RequestDescriptor, RequestId,
    SeededRandom, SharedClock, SystemClock, TelemetryEvent, TelemetrySink, Timestamp,
    TracingSink, Work, duration_millis, emit_safely,
};
use bulwark_storage::{CacheKey, PersistentStore, TwoTierCache};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

const STALE_SUFFIX: &str = "::stale";

/// How a result was produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionMetadata {
    /// Time from acceptance to result
    pub execution_time: Duration,
    /// Served by a batch call
    pub was_batched: bool,
    /// Rejected by the throttler at least once before being admitted
    pub was_throttled: bool,
    /// Attached to another caller's execution
    pub was_deduplicated: bool,
    /// Served from the cache
    pub from_cache: bool,
    /// Value is a stale fallback after a failure
    pub stale: bool,
    /// Effective priority
    pub priority: Priority,
    /// Backend attempts made (0 when served from the cache)
    pub attempts: u32,
}

/// Result of [`Coordinator::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution<T> {
    /// The value
    pub value: T,
    /// How it was produced
    pub metadata: ExecutionMetadata,
}

#[derive(Clone)]
struct Attempted<T> {
    value: T,
    attempts: u32,
    batched: bool,
}

struct Collapsed<T> {
    attempted: Attempted<T>,
    deduplicated: bool,
}

struct Inner<T> {
    config: RwLock<CoordinatorConfig>,
    clock: SharedClock,
    classifier: Arc<dyn ErrorClassifier>,
    sink: Arc<dyn TelemetrySink>,
    priorities: PriorityTable,
    breakers: BreakerRegistry,
    throttler: Throttler,
    scheduler: PriorityScheduler,
    dedup: Deduplicator<Attempted<T>>,
    batches: BatchCoordinator<T>,
    cache: TwoTierCache<T>,
    retry: RwLock<RetryPolicy>,
    metrics: Mutex<RequestMetrics>,
    fallback: AtomicBool,
}

/// Builds a [`Coordinator`] from configuration and injected collaborators
pub struct CoordinatorBuilder<T> {
    config: CoordinatorConfig,
    clock: Option<SharedClock>,
    classifier: Arc<dyn ErrorClassifier>,
    sink: Arc<dyn TelemetrySink>,
    random: Option<Box<dyn RandomSource>>,
    priorities: PriorityTable,
    store: Option<Arc<dyn PersistentStore>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CoordinatorBuilder<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start from `config`
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            clock: None,
            classifier: Arc::new(DefaultClassifier),
            sink: Arc::new(TracingSink),
            random: None,
            priorities: PriorityTable::default(),
            store: None,
            _marker: PhantomData,
        }
    }

    /// Use `clock` for every timer and timestamp
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `classifier` for retry and fallback decisions
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Send telemetry to `sink`
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Draw adaptive throttle decisions from `random`
    #[must_use]
    pub fn with_random(mut self, random: Box<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    /// Replace the priority table
    #[must_use]
    pub fn with_priority_table(mut self, priorities: PriorityTable) -> Self {
        self.priorities = priorities;
        self
    }

    /// Back the cache with a persistent tier
    #[must_use]
    pub fn with_persistent_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the coordinator
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the configuration is invalid
    pub fn build(self) -> CoordResult<Coordinator<T>> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let random = self
            .random
            .unwrap_or_else(|| Box::new(SeededRandom::default()));
        let sink = self.sink;

        let mut cache = TwoTierCache::new(&config.cache(), Arc::clone(&clock))
            .with_sink(Arc::clone(&sink));
        if let Some(store) = self.store {
            cache = cache.with_persistent(store);
        }

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<T>>| Inner {
            breakers: BreakerRegistry::new(config.breaker(), Arc::clone(&clock), Arc::clone(&sink)),
            throttler: Throttler::with_random(config.throttle(), Arc::clone(&clock), random),
            scheduler: PriorityScheduler::new(config.max_concurrent, Arc::clone(&clock)),
            dedup: Deduplicator::new(config.dedup_grace, Arc::clone(&clock)),
            batches: BatchCoordinator::new(
                config.batch(),
                Arc::clone(&clock),
                Arc::new(GuardedRunner {
                    inner: weak.clone(),
                }),
                Arc::clone(&sink),
            ),
            cache,
            retry: RwLock::new(RetryPolicy::new(config.retry.clone())),
            metrics: Mutex::new(RequestMetrics::new()),
            fallback: AtomicBool::new(false),
            classifier: self.classifier,
            priorities: self.priorities,
            sink,
            clock,
            config: RwLock::new(config),
        });
        Ok(Coordinator { inner })
    }
}

/// Resilient execution front door
pub struct Coordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Coordinator<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Builder starting from `config`
    #[must_use]
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder<T> {
        CoordinatorBuilder::new(config)
    }

    /// Coordinator with default collaborators
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the configuration is invalid
    pub fn new(config: CoordinatorConfig) -> CoordResult<Self> {
        CoordinatorBuilder::new(config).build()
    }

    /// Run one request through the pipeline
    ///
    /// # Errors
    ///
    /// Returns the first unrecoverable failure: `RateLimited`,
    /// `CircuitOpen`, `Timeout`, a backend error or one of the propagation
    /// wrappers. A stale cached value replaces the error when the caller
    /// allowed it and the classifier agrees.
    pub async fn execute(&self, descriptor: RequestDescriptor<T>) -> CoordResult<Execution<T>> {
        let started = self.inner.clock.now();
        let descriptor = descriptor.stamped(started);
        let priority = descriptor.priority(&self.inner.priorities);
        self.inner.observe_load();

        let outcome = self.inner.run(&descriptor, priority, started).await;
        self.inner.finish(&descriptor, priority, &outcome);
        outcome
    }

    /// Snapshot of every counter plus advisory recommendations
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            requests: inner
                .metrics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            load: inner.throttler.load(),
            fallback_active: self.is_fallback(),
            throttle: inner.throttler.stats(),
            scheduler: inner.scheduler.stats(),
            dedup: inner.dedup.stats(),
            batch: inner.batches.stats(),
            cache: inner.cache.stats(),
            breakers: inner.breakers.statuses(),
            recommendations: Vec::new(),
        }
        .with_recommendations()
    }

    /// Breaker status of `resource`, if it has been used
    #[must_use]
    pub fn status(&self, resource: &str) -> Option<BreakerStatus> {
        self.inner.breakers.status(resource)
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> CoordinatorConfig {
        self.inner.config()
    }

    /// Apply a partial configuration update to every component
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the patched configuration is invalid; nothing
    /// is changed in that case
    pub fn configure(&self, patch: &ConfigPatch) -> CoordResult<()> {
        let mut config = self.inner.config.write().unwrap_or_else(PoisonError::into_inner);
        let next = config.patched(patch)?;
        let inner = &self.inner;
        if patch.touches_throttle() {
            inner.throttler.reconfigure(next.throttle());
        }
        inner.scheduler.set_max_concurrent(next.max_concurrent);
        inner.batches.reconfigure(next.batch());
        inner.cache.reconfigure(&next.cache());
        inner.breakers.reconfigure(next.breaker());
        inner.dedup.set_grace(next.dedup_grace);
        *inner.retry.write().unwrap_or_else(PoisonError::into_inner) =
            RetryPolicy::new(next.retry.clone());
        tracing::info!(?patch, "configuration updated");
        *config = next;
        Ok(())
    }

    /// Return every component to its initial state
    ///
    /// Queued callers, dedup waiters and pending batch members fail;
    /// breakers close; the cache and counters are cleared; fallback mode
    /// ends.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.throttler.reset();
        inner.scheduler.reset();
        inner.dedup.reset();
        inner.batches.reset();
        inner.breakers.reset_all();
        inner.cache.clear();
        inner.cache.reset_stats();
        inner
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        inner.fallback.store(false, Ordering::SeqCst);
        tracing::info!("coordinator reset");
    }

    /// Force the breaker of `resource` open
    pub fn force_open(&self, resource: &str) {
        self.inner.breakers.force_open(resource);
    }

    /// Stop calling the backend; requests fail fast with `CircuitOpen` and
    /// may be answered from the cache
    pub fn force_fallback(&self) {
        self.inner.fallback.store(true, Ordering::SeqCst);
        tracing::info!("fallback mode forced");
    }

    /// Leave fallback mode and close every breaker
    pub fn reset_to_primary(&self) {
        self.inner.fallback.store(false, Ordering::SeqCst);
        self.inner.breakers.reset_all();
        tracing::info!("back on primary");
    }

    /// Whether fallback mode is forced
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.inner.fallback.load(Ordering::SeqCst)
    }

    /// Listen to breaker transitions of every resource
    pub fn on_state_change(&self, listener: StateListener) {
        self.inner.breakers.on_state_change(listener);
    }

    /// Register the batch handler for `(resource_key, operation)`
    pub fn register_batch_handler(
        &self,
        resource_key: impl Into<String>,
        operation: impl Into<String>,
        handler: Arc<dyn BatchHandler<T>>,
    ) {
        self.inner
            .batches
            .register_handler(resource_key, operation, handler);
    }

    /// The result cache
    #[must_use]
    pub fn cache(&self) -> &TwoTierCache<T> {
        &self.inner.cache
    }
}

impl<T> Inner<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn config(&self) -> CoordinatorConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn observe_load(&self) {
        let avg_latency = self
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .avg_latency();
        let stats = self.scheduler.stats();
        self.throttler.observe_load(&LoadSample {
            active: stats.active,
            max_concurrent: stats.max_concurrent,
            queue_depth: stats.queued.total(),
            avg_latency,
        });
    }

    async fn run(
        self: &Arc<Self>,
        descriptor: &RequestDescriptor<T>,
        priority: Priority,
        started: Timestamp,
    ) -> CoordResult<Execution<T>> {
        let options = descriptor.options();
        let mut metadata = ExecutionMetadata {
            execution_time: Duration::ZERO,
            was_batched: false,
            was_throttled: false,
            was_deduplicated: false,
            from_cache: false,
            stale: false,
            priority,
            attempts: 0,
        };
        match self.admit(descriptor, priority).await {
            Ok(was_throttled) => metadata.was_throttled = was_throttled,
            Err(err) => {
                metadata.was_throttled = true;
                return self.stale_or(descriptor, err, metadata, started);
            }
        }

        if let Some(policy) = options.cache.as_ref().filter(|p| p.read_through) {
            if let Some(value) = self.cache.get(&primary_key(policy)) {
                tracing::debug!(request = %descriptor.id(), namespace = %policy.namespace, "served from cache");
                metadata.from_cache = true;
                metadata.execution_time = self.clock.now().duration_since(started);
                return Ok(Execution { value, metadata });
            }
        }

        let outcome = if self.fallback.load(Ordering::SeqCst) {
            Err(CoordError::CircuitOpen {
                resource: descriptor.resource_key().to_string(),
                next_retry_at: self.clock.now(),
            })
        } else {
            self.collapse_within_deadline(descriptor, priority).await
        };

        match outcome {
            Ok(collapsed) => {
                let Collapsed {
                    attempted,
                    deduplicated,
                } = collapsed;
                if let Some(policy) = &options.cache {
                    if !deduplicated {
                        self.write_through(policy, &attempted.value);
                    }
                }
                metadata.was_batched = attempted.batched;
                metadata.was_deduplicated = deduplicated;
                metadata.attempts = attempted.attempts;
                metadata.execution_time = self.clock.now().duration_since(started);
                Ok(Execution {
                    value: attempted.value,
                    metadata,
                })
            }
            Err(err) => self.stale_or(descriptor, err, metadata, started),
        }
    }

    /// The stale cached value in place of `err`, when allowed
    fn stale_or(
        &self,
        descriptor: &RequestDescriptor<T>,
        err: CoordError,
        mut metadata: ExecutionMetadata,
        started: Timestamp,
    ) -> CoordResult<Execution<T>> {
        match self.stale_fallback(descriptor, &err) {
            Some(value) => {
                metadata.from_cache = true;
                metadata.stale = true;
                metadata.execution_time = self.clock.now().duration_since(started);
                Ok(Execution { value, metadata })
            }
            None => Err(err),
        }
    }

    /// Returns whether the request was throttled before being admitted
    async fn admit(
        &self,
        descriptor: &RequestDescriptor<T>,
        priority: Priority,
    ) -> CoordResult<bool> {
        let max_waits = self.config().auto_wait_max_attempts;
        let auto_wait = descriptor.options().auto_wait;
        let mut waits = 0u32;
        let mut was_throttled = false;

        loop {
            let decision =
                self.throttler
                    .should_throttle(descriptor.id(), priority, descriptor.resource_key());
            if !decision.throttled {
                return Ok(was_throttled);
            }
            was_throttled = true;
            let retry_after = decision.retry_after.unwrap_or(Duration::ZERO);
            let reason = decision
                .reason
                .map_or("unknown", |r| r.as_str())
                .to_string();
            emit_safely(
                self.sink.as_ref(),
                &TelemetryEvent::Throttled {
                    request: descriptor.id(),
                    resource: descriptor.resource_key().to_string(),
                    priority,
                    reason: reason.clone(),
                    retry_after_ms: duration_millis(retry_after),
                },
            );

            if auto_wait && waits < max_waits && retry_after != Duration::MAX {
                waits += 1;
                tracing::debug!(
                    request = %descriptor.id(),
                    wait_ms = duration_millis(retry_after),
                    attempt = waits,
                    "waiting out throttle"
                );
                self.clock
                    .sleep(retry_after.max(Duration::from_millis(1)))
                    .await;
                continue;
            }
            return Err(CoordError::RateLimited {
                retry_after,
                reason,
            });
        }
    }

    async fn collapse_within_deadline(
        self: &Arc<Self>,
        descriptor: &RequestDescriptor<T>,
        priority: Priority,
    ) -> CoordResult<Collapsed<T>> {
        let collapse = self.collapse(descriptor, priority);
        match descriptor.options().timeout {
            Some(after) => {
                let deadline = self.clock.sleep(after);
                tokio::select! {
                    outcome = collapse => outcome,
                    () = deadline => {
                        tracing::debug!(request = %descriptor.id(), after_ms = duration_millis(after), "caller deadline elapsed");
                        Err(CoordError::Timeout {
                            operation: descriptor.operation().to_string(),
                            after,
                        })
                    }
                }
            }
            None => collapse.await,
        }
    }

    /// A dedup waiter more urgent than its leader raises the leader's
    /// queued scheduler slot; a leader already inside a batch group keeps
    /// the group's priority.
    async fn collapse(
        self: &Arc<Self>,
        descriptor: &RequestDescriptor<T>,
        priority: Priority,
    ) -> CoordResult<Collapsed<T>> {
        let urgency = Urgency::new(priority);
        let backend = self.backend(descriptor, urgency.clone());
        match &descriptor.options().dedup_key {
            Some(key) => {
                let shared = self
                    .dedup
                    .deduplicate_raising(key, &urgency, move || backend)
                    .await;
                shared.result.map(|attempted| Collapsed {
                    attempted,
                    deduplicated: shared.coalesced,
                })
            }
            None => backend.await.map(|attempted| Collapsed {
                attempted,
                deduplicated: false,
            }),
        }
    }

    fn backend(
        self: &Arc<Self>,
        descriptor: &RequestDescriptor<T>,
        urgency: Urgency,
    ) -> BoxFuture<'static, CoordResult<Attempted<T>>> {
        let inner = Arc::clone(self);
        let resource = descriptor.resource_key().to_string();
        let work = descriptor.work();
        match &descriptor.options().batch {
            Some(spec) => {
                let key = GroupKey::new(
                    resource,
                    descriptor.operation(),
                    spec.filter_signature.clone(),
                );
                let params: Value = spec.params.clone();
                Box::pin(async move {
                    let batched = inner
                        .batches
                        .submit(key, urgency.priority(), params, work)
                        .await;
                    batched.result.map(|value| Attempted {
                        value,
                        attempts: 1,
                        batched: batched.was_batched,
                    })
                })
            }
            None => {
                let request = descriptor.id();
                Box::pin(async move {
                    tokio::spawn(inner.guarded(Some(request), resource, urgency, work))
                        .await
                        .unwrap_or_else(|_| Err(CoordError::Cancelled))
                })
            }
        }
    }

    /// Slot, breaker and retry around one backend execution
    async fn guarded(
        self: Arc<Self>,
        request: Option<RequestId>,
        resource: String,
        urgency: Urgency,
        work: Work<T>,
    ) -> CoordResult<Attempted<T>> {
        let _slot = self.scheduler.acquire_raisable(&urgency).await?;
        let breaker = self.breakers.get(&resource);
        breaker.check()?;
        let retry = self
            .retry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut attempt = 1u32;
        loop {
            let outcome = AssertUnwindSafe(async { work().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(CoordError::backend_fatal("backend call panicked")));
            let err = match outcome {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                        batched: false,
                    });
                }
                Err(err) => err,
            };

            let classification = self.classifier.classify(&err);
            if !retry.should_retry(attempt, &classification) {
                breaker.record_failure(&err);
                return Err(err);
            }

            let delay = retry.delay_for(attempt);
            self.metrics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retries += 1;
            tracing::debug!(%resource, attempt, delay_ms = duration_millis(delay), error = %err, "retrying");
            if let Some(request) = request {
                emit_safely(
                    self.sink.as_ref(),
                    &TelemetryEvent::Retrying {
                        request,
                        resource: resource.clone(),
                        attempt,
                        delay_ms: duration_millis(delay),
                    },
                );
            }
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }

    fn write_through(&self, policy: &CachePolicy, value: &T) {
        let ttl = policy.ttl.unwrap_or_else(|| self.cache.default_ttl());
        let max_staleness = self.config().max_staleness;
        self.cache.set(primary_key(policy), value.clone(), Some(ttl));
        if !max_staleness.is_zero() {
            self.cache.set(
                stale_key(policy),
                value.clone(),
                Some(ttl.saturating_add(max_staleness)),
            );
        }
    }

    fn stale_fallback(&self, descriptor: &RequestDescriptor<T>, err: &CoordError) -> Option<T> {
        let options = descriptor.options();
        if !options.allow_stale {
            return None;
        }
        let policy = options.cache.as_ref()?;
        if !self.classifier.classify(err).should_use_cache {
            return None;
        }
        let entry = self.cache.get_entry(&stale_key(policy))?;
        let age = entry.age(self.clock.now());
        tracing::debug!(
            request = %descriptor.id(),
            age_ms = duration_millis(age),
            error = %err,
            "serving stale value"
        );
        emit_safely(
            self.sink.as_ref(),
            &TelemetryEvent::StaleServed {
                request: descriptor.id(),
                resource: descriptor.resource_key().to_string(),
                age_ms: duration_millis(age),
            },
        );
        Some(entry.value().clone())
    }

    fn finish(
        &self,
        descriptor: &RequestDescriptor<T>,
        priority: Priority,
        outcome: &CoordResult<Execution<T>>,
    ) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        metrics.total += 1;
        let event = match outcome {
            Ok(execution) => {
                let meta = &execution.metadata;
                metrics.succeeded += 1;
                metrics.total_latency_ms += duration_millis(meta.execution_time);
                if meta.was_deduplicated {
                    metrics.deduplicated += 1;
                }
                if meta.was_batched {
                    metrics.batched += 1;
                }
                if meta.stale {
                    metrics.stale_served += 1;
                } else if meta.from_cache {
                    metrics.cache_hits += 1;
                }
                TelemetryEvent::RequestCompleted {
                    request: descriptor.id(),
                    resource: descriptor.resource_key().to_string(),
                    priority,
                    execution_time_ms: duration_millis(meta.execution_time),
                    was_batched: meta.was_batched,
                    was_deduplicated: meta.was_deduplicated,
                    from_cache: meta.from_cache,
                    attempts: meta.attempts,
                }
            }
            Err(err) => {
                metrics.failed += 1;
                match err.root_cause() {
                    CoordError::RateLimited { .. } => metrics.throttled += 1,
                    CoordError::Timeout { .. } => metrics.timed_out += 1,
                    CoordError::CircuitOpen { .. } => metrics.circuit_rejected += 1,
                    _ => {}
                }
                TelemetryEvent::RequestFailed {
                    request: descriptor.id(),
                    resource: descriptor.resource_key().to_string(),
                    priority,
                    error_kind: err.kind().to_string(),
                    message: err.to_string(),
                }
            }
        };
        drop(metrics);
        emit_safely(self.sink.as_ref(), &event);
    }
}

fn primary_key(policy: &CachePolicy) -> CacheKey {
    CacheKey::new(policy.namespace.clone(), policy.key.clone())
}

fn stale_key(policy: &CachePolicy) -> CacheKey {
    CacheKey::new(format!("{}{}", policy.namespace, STALE_SUFFIX), policy.key.clone())
}

/// Batch runner that takes a scheduler slot and consults the breaker
struct GuardedRunner<T> {
    inner: Weak<Inner<T>>,
}

impl<T> BatchRunner<T> for GuardedRunner<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn run_batch(
        &self,
        group: &GroupKey,
        priority: Priority,
        handler: Arc<dyn BatchHandler<T>>,
        params: Vec<Value>,
    ) -> BoxFuture<'static, CoordResult<Vec<CoordResult<T>>>> {
        let inner = self.inner.clone();
        let resource = group.resource_key.clone();
        Box::pin(async move {
            let inner = inner.upgrade().ok_or(CoordError::Cancelled)?;
            let _slot = inner.scheduler.acquire(priority).await?;
            let breaker = inner.breakers.get(&resource);
            breaker.check()?;
            let outcome = AssertUnwindSafe(async move { handler.execute_batch(params).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(CoordError::backend_fatal("batch handler panicked")));
            match &outcome {
                Ok(_) => breaker.record_success(),
                Err(err) => breaker.record_failure(err),
            }
            outcome
        })
    }

    fn run_single(
        &self,
        group: &GroupKey,
        priority: Priority,
        work: Work<T>,
    ) -> BoxFuture<'static, CoordResult<T>> {
        let inner = self.inner.clone();
        let resource = group.resource_key.clone();
        Box::pin(async move {
            let inner = inner.upgrade().ok_or(CoordError::Cancelled)?;
            inner
                .guarded(None, resource, Urgency::new(priority), work)
                .await
                .map(|attempted| attempted.value)
        })
    }
}
