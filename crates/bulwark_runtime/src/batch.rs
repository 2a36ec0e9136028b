//! Request batching.
//!
//! Requests sharing `(resource_key, operation, filter_signature)` join one
//! group. A group flushes when it reaches the target size, or when its
//! flush timer fires after `max_wait`; a group still below `min_size` at
//! that point runs its members one by one. Results are handed back by
//! position.

use crate::sizing::{AdaptiveSizer, SizerSnapshot};
use async_trait::async_trait;
use bulwark_core::{
    BatchConfig, CoordError, CoordResult, Priority, SharedClock, TelemetryEvent, TelemetrySink,
    Work, duration_millis, emit_safely,
};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::oneshot;

/// Executes many requests as one backend call
#[async_trait]
pub trait BatchHandler<T>: Send + Sync {
    /// Run one batch
    ///
    /// Must return exactly one result per parameter, in order. Per-item
    /// errors fail only their member.
    ///
    /// # Errors
    ///
    /// Returns error if the batch call as a whole failed
    async fn execute_batch(&self, params: Vec<Value>) -> CoordResult<Vec<CoordResult<T>>>;
}

/// [`BatchHandler`] backed by a closure
pub struct FnBatchHandler<T, F> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> BatchHandler<T> for FnBatchHandler<T, F>
where
    T: Send + 'static,
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = CoordResult<Vec<CoordResult<T>>>> + Send,
{
    async fn execute_batch(&self, params: Vec<Value>) -> CoordResult<Vec<CoordResult<T>>> {
        (self.f)(params).await
    }
}

/// Wrap a closure as a shared batch handler
pub fn batch_handler_fn<T, F, Fut>(f: F) -> Arc<dyn BatchHandler<T>>
where
    T: Send + 'static,
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CoordResult<Vec<CoordResult<T>>>> + Send + 'static,
{
    Arc::new(FnBatchHandler {
        f,
        _marker: PhantomData,
    })
}

/// Runs flushed groups; the coordinator wraps these with admission and
/// circuit breaking
pub trait BatchRunner<T>: Send + Sync {
    /// Issue one batch call
    fn run_batch(
        &self,
        group: &GroupKey,
        priority: Priority,
        handler: Arc<dyn BatchHandler<T>>,
        params: Vec<Value>,
    ) -> BoxFuture<'static, CoordResult<Vec<CoordResult<T>>>>;

    /// Run one member on its own
    fn run_single(
        &self,
        group: &GroupKey,
        priority: Priority,
        work: Work<T>,
    ) -> BoxFuture<'static, CoordResult<T>>;
}

/// Runner that calls handlers and work directly
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectRunner;

impl<T: Send + 'static> BatchRunner<T> for DirectRunner {
    fn run_batch(
        &self,
        _group: &GroupKey,
        _priority: Priority,
        handler: Arc<dyn BatchHandler<T>>,
        params: Vec<Value>,
    ) -> BoxFuture<'static, CoordResult<Vec<CoordResult<T>>>> {
        Box::pin(async move { handler.execute_batch(params).await })
    }

    fn run_single(
        &self,
        _group: &GroupKey,
        _priority: Priority,
        work: Work<T>,
    ) -> BoxFuture<'static, CoordResult<T>> {
        Box::pin(async move {
            AssertUnwindSafe(async { work().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(CoordError::backend_fatal("backend call panicked")))
        })
    }
}

/// Batch group identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// Resource key
    pub resource_key: String,
    /// Operation kind
    pub operation: String,
    /// Filter signature
    pub filter_signature: String,
}

impl GroupKey {
    /// Create a group key
    #[must_use]
    pub fn new(
        resource_key: impl Into<String>,
        operation: impl Into<String>,
        filter_signature: impl Into<String>,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            operation: operation.into(),
            filter_signature: filter_signature.into(),
        }
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}[{}]",
            self.resource_key, self.operation, self.filter_signature
        )
    }
}

/// Result for one member
#[derive(Debug, Clone, PartialEq)]
pub struct Batched<T> {
    /// Member outcome
    pub result: CoordResult<T>,
    /// Served by a batch call rather than individually
    pub was_batched: bool,
}

/// Batch statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    /// Batch calls issued
    pub batches_flushed: u64,
    /// Members served by batch calls
    pub members_batched: u64,
    /// Members run individually because their group stayed small
    pub individual_fallbacks: u64,
    /// Batch calls that failed as a whole
    pub failed_batches: u64,
    /// Groups waiting to flush
    pub pending_groups: usize,
    /// Members waiting to flush
    pub pending_members: usize,
    /// Per-group sizing state
    pub sizing: Vec<SizerSnapshot>,
}

impl BatchStats {
    /// Average members per batch call
    #[must_use]
    pub fn average_batch_size(&self) -> f64 {
        if self.batches_flushed == 0 {
            return 0.0;
        }
        self.members_batched as f64 / self.batches_flushed as f64
    }
}

struct Member<T> {
    params: Value,
    work: Work<T>,
    tx: oneshot::Sender<Batched<T>>,
}

struct Group<T> {
    generation: u64,
    priority: Priority,
    members: Vec<Member<T>>,
}

struct Groups<T> {
    open: IndexMap<GroupKey, Group<T>>,
    next_generation: u64,
}

type HandlerKey = (String, String);

struct BatchShared<T> {
    groups: Mutex<Groups<T>>,
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn BatchHandler<T>>>>,
    runner: Arc<dyn BatchRunner<T>>,
    config: RwLock<BatchConfig>,
    sizer: Mutex<AdaptiveSizer>,
    clock: SharedClock,
    sink: Arc<dyn TelemetrySink>,
    stats: Mutex<BatchStats>,
}

/// Groups compatible requests into batch calls
pub struct BatchCoordinator<T> {
    shared: Arc<BatchShared<T>>,
}

impl<T: Send + 'static> BatchCoordinator<T> {
    /// Create a coordinator flushing through `runner`
    #[must_use]
    pub fn new(
        config: BatchConfig,
        clock: SharedClock,
        runner: Arc<dyn BatchRunner<T>>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let sizer = AdaptiveSizer::new(config.min_size, config.max_size, config.adaptive_sizing);
        Self {
            shared: Arc::new(BatchShared {
                groups: Mutex::new(Groups {
                    open: IndexMap::new(),
                    next_generation: 1,
                }),
                handlers: RwLock::new(HashMap::new()),
                runner,
                config: RwLock::new(config),
                sizer: Mutex::new(sizer),
                clock,
                sink,
                stats: Mutex::new(BatchStats::default()),
            }),
        }
    }

    /// Register the handler for `(resource_key, operation)`
    pub fn register_handler(
        &self,
        resource_key: impl Into<String>,
        operation: impl Into<String>,
        handler: Arc<dyn BatchHandler<T>>,
    ) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((resource_key.into(), operation.into()), handler);
    }

    /// Whether a handler exists for `(resource_key, operation)`
    #[must_use]
    pub fn has_handler(&self, resource_key: &str, operation: &str) -> bool {
        self.shared.handler(resource_key, operation).is_some()
    }

    /// Join the group for `key` and wait for this member's result
    ///
    /// `work` runs only if the group ends up executing individually.
    pub async fn submit(
        &self,
        key: GroupKey,
        priority: Priority,
        params: Value,
        work: Work<T>,
    ) -> Batched<T> {
        if !self.has_handler(&key.resource_key, &key.operation) {
            return Batched {
                result: Err(CoordError::validation(
                    "batch",
                    format!(
                        "no batch handler registered for {}/{}",
                        key.resource_key, key.operation
                    ),
                )),
                was_batched: false,
            };
        }

        let (tx, rx) = oneshot::channel();
        let target = self
            .shared
            .sizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .target(&key.to_string());

        let (new_generation, ready) = {
            let mut groups = self.shared.groups.lock().unwrap_or_else(PoisonError::into_inner);
            let mut new_generation = None;
            if !groups.open.contains_key(&key) {
                let generation = groups.next_generation;
                groups.next_generation += 1;
                new_generation = Some(generation);
                groups.open.insert(
                    key.clone(),
                    Group {
                        generation,
                        priority,
                        members: Vec::new(),
                    },
                );
            }
            let full = match groups.open.get_mut(&key) {
                Some(group) => {
                    group.priority = group.priority.min(priority);
                    group.members.push(Member { params, work, tx });
                    group.members.len() >= target
                }
                None => false,
            };
            let ready = if full {
                groups.open.shift_remove(&key)
            } else {
                None
            };
            (new_generation, ready)
        };

        match ready {
            Some(group) => {
                tracing::debug!(group = %key, size = group.members.len(), "batch full");
                tokio::spawn(flush(Arc::clone(&self.shared), key.clone(), group));
            }
            None => {
                if let Some(generation) = new_generation {
                    let shared = Arc::clone(&self.shared);
                    let max_wait = shared
                        .config
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .max_wait;
                    let sleep = shared.clock.sleep(max_wait);
                    let key = key.clone();
                    tokio::spawn(async move {
                        sleep.await;
                        let due = {
                            let mut groups =
                                shared.groups.lock().unwrap_or_else(PoisonError::into_inner);
                            let current = groups
                                .open
                                .get(&key)
                                .is_some_and(|g| g.generation == generation);
                            if current {
                                groups.open.shift_remove(&key)
                            } else {
                                None
                            }
                        };
                        if let Some(group) = due {
                            flush(shared, key, group).await;
                        }
                    });
                }
            }
        }

        rx.await.unwrap_or_else(|_| Batched {
            result: Err(CoordError::BatchPropagated {
                group: key.to_string(),
                size: 0,
                source: Box::new(CoordError::Cancelled),
            }),
            was_batched: true,
        })
    }

    /// Drop every pending group; waiting members fail with `BatchPropagated`
    pub fn reset(&self) {
        self.shared
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .clear();
        self.shared
            .sizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    /// Apply new settings to future groups
    pub fn reconfigure(&self, config: BatchConfig) {
        self.shared
            .sizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reconfigure(config.min_size, config.max_size, config.adaptive_sizing);
        *self
            .shared
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> BatchStats {
        let (pending_groups, pending_members) = {
            let groups = self.shared.groups.lock().unwrap_or_else(PoisonError::into_inner);
            (
                groups.open.len(),
                groups.open.values().map(|g| g.members.len()).sum(),
            )
        };
        let sizing = self
            .shared
            .sizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        let mut stats = self
            .shared
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.pending_groups = pending_groups;
        stats.pending_members = pending_members;
        stats.sizing = sizing;
        stats
    }
}

impl<T> BatchShared<T> {
    fn handler(&self, resource_key: &str, operation: &str) -> Option<Arc<dyn BatchHandler<T>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(resource_key.to_string(), operation.to_string()))
            .cloned()
    }

    fn bump(&self, f: impl FnOnce(&mut BatchStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

async fn flush<T: Send + 'static>(shared: Arc<BatchShared<T>>, key: GroupKey, group: Group<T>) {
    let size = group.members.len();
    let priority = group.priority;
    let min_size = shared
        .config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .min_size;
    let started = shared.clock.now();

    if size < min_size {
        shared.bump(|s| s.individual_fallbacks += size as u64);
        let runs = group.members.into_iter().map(|member| {
            let run = shared.runner.run_single(&key, priority, member.work);
            async move {
                let result = run.await;
                let _ = member.tx.send(Batched {
                    result,
                    was_batched: false,
                });
            }
        });
        join_all(runs).await;
        report(&shared, &key, size, started, true);
        return;
    }

    let (params, senders): (Vec<Value>, Vec<oneshot::Sender<Batched<T>>>) = group
        .members
        .into_iter()
        .map(|member| (member.params, member.tx))
        .unzip();

    let outcome = match shared.handler(&key.resource_key, &key.operation) {
        Some(handler) => shared.runner.run_batch(&key, priority, handler, params).await,
        None => Err(CoordError::validation(
            "batch",
            format!("batch handler for {}/{} was removed", key.resource_key, key.operation),
        )),
    };
    let elapsed = shared.clock.now().duration_since(started);
    shared
        .sizer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record(&key.to_string(), size, elapsed);

    let (results, failed): (Vec<CoordResult<T>>, bool) = match outcome {
        Ok(results) if results.len() == size => (results, false),
        Ok(results) => {
            let err = CoordError::backend_fatal(format!(
                "batch handler returned {} results for {} members",
                results.len(),
                size
            ));
            (propagate(&key, size, &err), true)
        }
        Err(err) => (propagate(&key, size, &err), true),
    };

    shared.bump(|s| {
        s.batches_flushed += 1;
        s.members_batched += size as u64;
        if failed {
            s.failed_batches += 1;
        }
    });

    for (tx, result) in senders.into_iter().zip(results) {
        let _ = tx.send(Batched {
            result,
            was_batched: true,
        });
    }
    report(&shared, &key, size, started, false);
}

fn propagate<T>(key: &GroupKey, size: usize, err: &CoordError) -> Vec<CoordResult<T>> {
    tracing::debug!(group = %key, size, error = %err, "batch failed as a whole");
    (0..size)
        .map(|_| {
            Err(CoordError::BatchPropagated {
                group: key.to_string(),
                size,
                source: Box::new(err.clone()),
            })
        })
        .collect()
}

fn report<T>(
    shared: &BatchShared<T>,
    key: &GroupKey,
    size: usize,
    started: bulwark_core::Timestamp,
    individual: bool,
) {
    let execution_time_ms = duration_millis(shared.clock.now().duration_since(started));
    emit_safely(
        shared.sink.as_ref(),
        &TelemetryEvent::BatchFlushed {
            group: key.to_string(),
            size,
            execution_time_ms,
            individual,
        },
    );
}
