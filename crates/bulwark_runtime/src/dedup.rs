//! In-flight request deduplication.
//!
//! The first caller for a key becomes the leader: its work is spawned and
//! runs exactly once. Callers arriving while it runs attach as waiters and
//! their own work is never invoked. Everyone receives the identical outcome.
//! The settled outcome is kept for a short grace window so near-simultaneous
//! repeats are still coalesced. A waiter more urgent than the leader raises
//! the leader's scheduler priority to its own.

use crate::scheduler::Urgency;
use bulwark_core::{CoordError, CoordResult, SharedClock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;

/// Outcome of a deduplicated call
#[derive(Debug, Clone, PartialEq)]
pub struct Deduplicated<V> {
    /// Shared outcome
    pub result: CoordResult<V>,
    /// The caller attached to another caller's execution
    pub coalesced: bool,
}

/// Deduplicator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Executions started
    pub executions: u64,
    /// Callers served by someone else's execution
    pub coalesced: u64,
    /// Executions that ended without an outcome
    pub lost: u64,
    /// Keys currently executing
    pub in_flight: usize,
}

enum Slot<V> {
    Running {
        generation: u64,
        waiters: Vec<oneshot::Sender<CoordResult<V>>>,
        urgency: Option<Urgency>,
    },
    Settled {
        generation: u64,
        outcome: CoordResult<V>,
    },
}

struct Shared<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    grace: RwLock<Duration>,
    next_generation: AtomicU64,
    stats: Mutex<DedupStats>,
}

impl<V> Shared<V> {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, f: impl FnOnce(&mut DedupStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

enum Joined<V> {
    Leader(u64),
    Waiting,
    Settled(CoordResult<V>),
}

/// Coalesces concurrent identical operations
pub struct Deduplicator<V> {
    shared: Arc<Shared<V>>,
    clock: SharedClock,
}

impl<V: Clone + Send + 'static> Deduplicator<V> {
    /// Create with the given grace window
    #[must_use]
    pub fn new(grace: Duration, clock: SharedClock) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                grace: RwLock::new(grace),
                next_generation: AtomicU64::new(1),
                stats: Mutex::new(DedupStats::default()),
            }),
            clock,
        }
    }

    /// Run `work` once for all concurrent callers of `key`
    ///
    /// `work` is only called when this caller becomes the leader. Dropping
    /// the returned future abandons only this caller's interest.
    pub async fn deduplicate<F, Fut>(&self, key: &str, work: F) -> Deduplicated<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoordResult<V>> + Send + 'static,
    {
        self.join(key, None, work).await
    }

    /// Like [`Self::deduplicate`], with the execution admitted at `urgency`
    ///
    /// When this caller attaches as a waiter, the leader's urgency is
    /// raised to this caller's priority.
    pub async fn deduplicate_raising<F, Fut>(
        &self,
        key: &str,
        urgency: &Urgency,
        work: F,
    ) -> Deduplicated<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoordResult<V>> + Send + 'static,
    {
        self.join(key, Some(urgency), work).await
    }

    async fn join<F, Fut>(&self, key: &str, urgency: Option<&Urgency>, work: F) -> Deduplicated<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoordResult<V>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let joined = {
            let mut slots = self.shared.slots();
            match slots.get_mut(key) {
                Some(Slot::Running {
                    waiters,
                    urgency: leader,
                    ..
                }) => {
                    if let (Some(leader), Some(mine)) = (leader.as_ref(), urgency) {
                        leader.raise(mine.priority());
                    }
                    waiters.push(tx);
                    Joined::Waiting
                }
                Some(Slot::Settled { outcome, .. }) => Joined::Settled(outcome.clone()),
                None => {
                    let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
                    slots.insert(
                        key.to_string(),
                        Slot::Running {
                            generation,
                            waiters: vec![tx],
                            urgency: urgency.cloned(),
                        },
                    );
                    Joined::Leader(generation)
                }
            }
        };

        let coalesced = match joined {
            Joined::Settled(outcome) => {
                self.shared.bump(|s| s.coalesced += 1);
                return Deduplicated {
                    result: outcome,
                    coalesced: true,
                };
            }
            Joined::Waiting => {
                self.shared.bump(|s| s.coalesced += 1);
                tracing::debug!(%key, "attached to in-flight execution");
                true
            }
            Joined::Leader(generation) => {
                self.shared.bump(|s| s.executions += 1);
                let execution = work();
                let guard = Completion {
                    shared: Arc::clone(&self.shared),
                    clock: Arc::clone(&self.clock),
                    key: key.to_string(),
                    generation,
                    armed: true,
                };
                tokio::spawn(async move {
                    let outcome = execution.await;
                    guard.complete(outcome);
                });
                false
            }
        };

        let result = rx.await.unwrap_or_else(|_| {
            Err(CoordError::DedupPropagated {
                key: key.to_string(),
                source: Box::new(CoordError::Cancelled),
            })
        });
        Deduplicated { result, coalesced }
    }

    /// Drop every slot; current waiters fail with `DedupPropagated`
    pub fn reset(&self) {
        self.shared.slots().clear();
    }

    /// Change the grace window for future completions
    pub fn set_grace(&self, grace: Duration) {
        *self
            .shared
            .grace
            .write()
            .unwrap_or_else(PoisonError::into_inner) = grace;
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> DedupStats {
        let in_flight = self
            .shared
            .slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Running { .. }))
            .count();
        let mut stats = self
            .shared
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.in_flight = in_flight;
        stats
    }
}

struct Completion<V: Clone + Send + 'static> {
    shared: Arc<Shared<V>>,
    clock: SharedClock,
    key: String,
    generation: u64,
    armed: bool,
}

impl<V: Clone + Send + 'static> Completion<V> {
    fn complete(mut self, outcome: CoordResult<V>) {
        self.armed = false;
        let grace = *self
            .shared
            .grace
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let waiters = {
            let mut slots = self.shared.slots();
            let current = matches!(
                slots.get(&self.key),
                Some(Slot::Running { generation, .. }) if *generation == self.generation
            );
            if !current {
                return;
            }
            let waiters = match slots.remove(&self.key) {
                Some(Slot::Running { waiters, .. }) => waiters,
                _ => Vec::new(),
            };
            if !grace.is_zero() {
                slots.insert(
                    self.key.clone(),
                    Slot::Settled {
                        generation: self.generation,
                        outcome: outcome.clone(),
                    },
                );
            }
            waiters
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        if !grace.is_zero() {
            let shared = Arc::clone(&self.shared);
            let key = std::mem::take(&mut self.key);
            let generation = self.generation;
            let sleep = self.clock.sleep(grace);
            tokio::spawn(async move {
                sleep.await;
                let mut slots = shared.slots();
                if matches!(
                    slots.get(&key),
                    Some(Slot::Settled { generation: g, .. }) if *g == generation
                ) {
                    slots.remove(&key);
                }
            });
        }
    }
}

impl<V: Clone + Send + 'static> Drop for Completion<V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.shared.slots();
        if matches!(
            slots.get(&self.key),
            Some(Slot::Running { generation, .. }) if *generation == self.generation
        ) {
            slots.remove(&self.key);
            drop(slots);
            self.shared.bump(|s| s.lost += 1);
            tracing::warn!(key = %self.key, "deduplicated execution lost before completing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{Priority, SystemClock};
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn dedup(grace: Duration) -> Deduplicator<u32> {
        Deduplicator::new(grace, SystemClock::shared())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_execution() {
        let d = dedup(Duration::from_millis(50));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let callers = (0..8).map(|_| {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            let d = &d;
            async move {
                d.deduplicate("user:1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(7)
                })
                .await
            }
        });
        let all = futures::future::join(join_all(callers), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            gate.notify_waiters();
        });
        let (results, ()) = all.await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.result == Ok(7)));
        assert_eq!(results.iter().filter(|r| !r.coalesced).count(), 1);
        assert_eq!(d.stats().executions, 1);
        assert_eq!(d.stats().coalesced, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_fans_out_identically() {
        let d = dedup(Duration::ZERO);
        let gate = Arc::new(Notify::new());
        let g = Arc::clone(&gate);
        let first = d.deduplicate("k", move || async move {
            g.notified().await;
            Err(CoordError::backend("503"))
        });
        let second = d.deduplicate("k", || async { Ok(1) });
        let release = async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            gate.notify_waiters();
        };
        let (a, b, ()) = tokio::join!(first, second, release);
        assert_eq!(a.result, Err(CoordError::backend("503")));
        assert_eq!(a.result, b.result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_urgent_waiter_raises_leader() {
        let d = dedup(Duration::ZERO);
        let gate = Arc::new(Notify::new());
        let g = Arc::clone(&gate);
        let leader_urgency = Urgency::new(Priority::Low);
        let waiter_urgency = Urgency::new(Priority::Critical);

        let leader = d.deduplicate_raising("k", &leader_urgency, move || async move {
            g.notified().await;
            Ok(4)
        });
        let waiter = d.deduplicate_raising("k", &waiter_urgency, || async { Ok(0) });
        let release = async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(leader_urgency.priority(), Priority::Critical);
            gate.notify_waiters();
        };
        let (a, b, ()) = tokio::join!(leader, waiter, release);
        assert_eq!((a.result, b.result), (Ok(4), Ok(4)));
        assert!(b.coalesced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_serves_repeats_then_expires() {
        let d = dedup(Duration::from_millis(50));
        let calls = Arc::new(AtomicUsize::new(0));
        let run = |calls: Arc<AtomicUsize>| {
            move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) as u32) }
        };

        assert_eq!(d.deduplicate("k", run(Arc::clone(&calls))).await.result, Ok(0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let repeat = d.deduplicate("k", run(Arc::clone(&calls))).await;
        assert_eq!(repeat.result, Ok(0));
        assert!(repeat.coalesced);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(d.deduplicate("k", run(Arc::clone(&calls))).await.result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_does_not_cancel_execution() {
        let d = dedup(Duration::ZERO);
        let gate = Arc::new(Notify::new());
        let g = Arc::clone(&gate);
        let leader = tokio::time::timeout(
            Duration::from_millis(5),
            d.deduplicate("k", move || async move {
                g.notified().await;
                Ok(3)
            }),
        );
        let follower = d.deduplicate("k", || async { Ok(0) });
        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.notify_waiters();
        };
        let (leader, follower, ()) = tokio::join!(leader, follower, release);
        assert!(leader.is_err());
        assert_eq!(follower.result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_execution_propagates_to_waiters() {
        let d = dedup(Duration::ZERO);
        let out = d
            .deduplicate("k", || async {
                if true {
                    panic!("backend task exploded");
                }
                Ok(1)
            })
            .await;
        assert!(matches!(
            out.result,
            Err(CoordError::DedupPropagated { ref key, .. }) if key == "k"
        ));
        assert_eq!(d.stats().lost, 1);
        assert_eq!(d.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_fails_waiters() {
        let d = dedup(Duration::ZERO);
        let gate = Arc::new(Notify::new());
        let g = Arc::clone(&gate);
        let waiting = d.deduplicate("k", move || async move {
            g.notified().await;
            Ok(1)
        });
        let reset = async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(d.stats().in_flight, 1);
            d.reset();
            gate.notify_waiters();
        };
        let (out, ()) = tokio::join!(waiting, reset);
        assert!(matches!(out.result, Err(CoordError::DedupPropagated { .. })));
    }
}
