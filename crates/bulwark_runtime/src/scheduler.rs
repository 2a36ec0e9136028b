//! Priority admission for backend executions.
//!
//! The scheduler is a bounded semaphore with an ordered wait queue:
//! - Strict priority across classes, FIFO within a class (BTreeMap keyed
//!   by `(Priority, seq)`)
//! - A released slot is handed straight to the next waiter
//! - A queued waiter can be raised to a more urgent class through its
//!   [`Urgency`]; it keeps its arrival order
//! - No aging

use bulwark_core::{CoordError, CoordResult, Priority, SharedClock, Timestamp, duration_millis};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::oneshot;

/// Queue depth per class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    /// Critical waiters
    pub critical: usize,
    /// High waiters
    pub high: usize,
    /// Medium waiters
    pub medium: usize,
    /// Low waiters
    pub low: usize,
}

impl QueueDepths {
    /// All waiters
    #[must_use]
    pub const fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }

    fn slot(&mut self, priority: Priority) -> &mut usize {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    /// Slots in use
    pub active: usize,
    /// Concurrency cap
    pub max_concurrent: usize,
    /// Waiters per class
    pub queued: QueueDepths,
    /// Slots granted
    pub admitted: u64,
    /// Slots released
    pub completed: u64,
    /// Waiters rejected by a reset
    pub rejected: u64,
    /// Mean time spent queued by callers that had to wait, in milliseconds
    pub avg_queue_wait_ms: f64,
    /// Mean time a slot was held, in milliseconds
    pub avg_execution_ms: f64,
}

struct Waiter {
    tx: oneshot::Sender<()>,
    enqueued_at: Timestamp,
}

type QueueKey = (Priority, u64);

struct SchedState {
    max_concurrent: usize,
    active: usize,
    queue: BTreeMap<QueueKey, Waiter>,
    next_seq: u64,
    admitted: u64,
    completed: u64,
    rejected: u64,
    waited: u64,
    total_wait_ms: u64,
    total_exec_ms: u64,
}

impl SchedState {
    /// Give the caller's slot to the next live waiter
    fn hand_off(&mut self, now: Timestamp) -> bool {
        while let Some((_, waiter)) = self.queue.pop_first() {
            if waiter.tx.send(()).is_ok() {
                self.admitted += 1;
                self.waited += 1;
                self.total_wait_ms += duration_millis(now.duration_since(waiter.enqueued_at));
                return true;
            }
        }
        false
    }
}

struct SchedShared {
    state: Mutex<SchedState>,
    clock: SharedClock,
}

impl SchedShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, held_ms: u64) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.completed += 1;
        state.total_exec_ms += held_ms;
        if state.active > state.max_concurrent || !state.hand_off(now) {
            state.active = state.active.saturating_sub(1);
        }
    }
}

struct UrgencyState {
    priority: Priority,
    queued: Option<(Weak<SchedShared>, QueueKey)>,
}

/// Priority of one admission, raisable while it waits
///
/// Clones share the same state. Lock order is urgency, then scheduler.
#[derive(Clone)]
pub struct Urgency {
    state: Arc<Mutex<UrgencyState>>,
}

impl Urgency {
    /// Start at `priority`
    #[must_use]
    pub fn new(priority: Priority) -> Self {
        Self {
            state: Arc::new(Mutex::new(UrgencyState {
                priority,
                queued: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UrgencyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current priority
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.lock().priority
    }

    /// Raise to `priority` if that is more urgent
    ///
    /// A waiter already queued moves to the new class without losing its
    /// place relative to callers that arrived after it.
    pub fn raise(&self, priority: Priority) {
        let mut state = self.lock();
        if priority >= state.priority {
            return;
        }
        state.priority = priority;
        let Some((shared, key)) = state
            .queued
            .as_ref()
            .and_then(|(weak, key)| weak.upgrade().map(|shared| (shared, *key)))
        else {
            return;
        };
        let mut sched = shared.lock();
        if let Some(waiter) = sched.queue.remove(&key) {
            let raised = (priority, key.1);
            sched.queue.insert(raised, waiter);
            state.queued = Some((Arc::downgrade(&shared), raised));
            tracing::trace!(from = %key.0, to = %priority, seq = key.1, "queued waiter raised");
        }
    }
}

impl std::fmt::Debug for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Urgency")
            .field("priority", &self.priority())
            .finish_non_exhaustive()
    }
}

/// Bounded-concurrency admission in priority order
#[derive(Clone)]
pub struct PriorityScheduler {
    shared: Arc<SchedShared>,
}

impl PriorityScheduler {
    /// Create a scheduler with `max_concurrent` slots (at least one)
    #[must_use]
    pub fn new(max_concurrent: usize, clock: SharedClock) -> Self {
        Self {
            shared: Arc::new(SchedShared {
                state: Mutex::new(SchedState {
                    max_concurrent: max_concurrent.max(1),
                    active: 0,
                    queue: BTreeMap::new(),
                    next_seq: 0,
                    admitted: 0,
                    completed: 0,
                    rejected: 0,
                    waited: 0,
                    total_wait_ms: 0,
                    total_exec_ms: 0,
                }),
                clock,
            }),
        }
    }

    /// Wait for a slot
    ///
    /// Dropping the returned future while queued leaves the queue; a slot
    /// granted to an abandoned caller is released at once.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the scheduler was reset while waiting
    pub async fn acquire(&self, priority: Priority) -> CoordResult<SlotGuard> {
        self.acquire_raisable(&Urgency::new(priority)).await
    }

    /// Wait for a slot at `urgency`, which other callers may raise
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the scheduler was reset while waiting
    pub async fn acquire_raisable(&self, urgency: &Urgency) -> CoordResult<SlotGuard> {
        let now = self.shared.clock.now();
        let queued = {
            let mut ticket = urgency.lock();
            let priority = ticket.priority;
            let mut state = self.shared.lock();
            if state.active < state.max_concurrent && state.queue.is_empty() {
                state.active += 1;
                state.admitted += 1;
                None
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                let (tx, rx) = oneshot::channel();
                state.queue.insert(
                    (priority, seq),
                    Waiter {
                        tx,
                        enqueued_at: now,
                    },
                );
                ticket.queued = Some((Arc::downgrade(&self.shared), (priority, seq)));
                Some(((priority, seq), rx))
            }
        };

        let Some((key, rx)) = queued else {
            return Ok(self.guard());
        };

        tracing::trace!(priority = %key.0, seq = key.1, "queued for admission");
        let mut pending = PendingAdmission {
            shared: Arc::clone(&self.shared),
            urgency: urgency.clone(),
            armed: true,
            rx,
        };
        let granted = (&mut pending.rx).await;
        pending.disarm();
        match granted {
            Ok(()) => Ok(self.guard()),
            Err(_) => Err(CoordError::Cancelled),
        }
    }

    fn guard(&self) -> SlotGuard {
        SlotGuard {
            shared: Arc::clone(&self.shared),
            started: self.shared.clock.now(),
        }
    }

    /// Change the concurrency cap, admitting waiters if it grew
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let now = self.shared.clock.now();
        let mut state = self.shared.lock();
        state.max_concurrent = max_concurrent.max(1);
        while state.active < state.max_concurrent && state.hand_off(now) {
            state.active += 1;
        }
    }

    /// Reject every queued waiter with `Cancelled`
    ///
    /// Slots already granted stay valid until released.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        let rejected = state.queue.len() as u64;
        state.queue.clear();
        state.rejected += rejected;
        if rejected > 0 {
            tracing::debug!(rejected, "scheduler queue cleared");
        }
    }

    /// Slots in use
    #[must_use]
    pub fn active(&self) -> usize {
        self.shared.lock().active
    }

    /// Waiters in the queue
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Concurrency cap
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.shared.lock().max_concurrent
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        let mut queued = QueueDepths::default();
        for (priority, _) in state.queue.keys() {
            *queued.slot(*priority) += 1;
        }
        SchedulerStats {
            active: state.active,
            max_concurrent: state.max_concurrent,
            queued,
            admitted: state.admitted,
            completed: state.completed,
            rejected: state.rejected,
            avg_queue_wait_ms: mean(state.total_wait_ms, state.waited),
            avg_execution_ms: mean(state.total_exec_ms, state.completed),
        }
    }
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("PriorityScheduler")
            .field("active", &state.active)
            .field("max_concurrent", &state.max_concurrent)
            .field("queued", &state.queue.len())
            .finish()
    }
}

fn mean(total: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    total as f64 / count as f64
}

struct PendingAdmission {
    shared: Arc<SchedShared>,
    urgency: Urgency,
    armed: bool,
    rx: oneshot::Receiver<()>,
}

impl PendingAdmission {
    fn disarm(&mut self) {
        self.armed = false;
        self.urgency.lock().queued = None;
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut ticket = self.urgency.lock();
        let Some((_, key)) = ticket.queued.take() else {
            return;
        };
        let still_queued = self.shared.lock().queue.remove(&key).is_some();
        drop(ticket);
        if !still_queued && self.rx.try_recv().is_ok() {
            tracing::trace!(priority = %key.0, seq = key.1, "released slot of departed waiter");
            self.shared.release(0);
        }
    }
}

/// One admitted backend execution; dropping it frees the slot
pub struct SlotGuard {
    shared: Arc<SchedShared>,
    started: Timestamp,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("started", &self.started)
            .finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let held = self.shared.clock.now().duration_since(self.started);
        self.shared.release(duration_millis(held));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::SystemClock;
    use std::time::Duration;

    fn scheduler(max: usize) -> PriorityScheduler {
        PriorityScheduler::new(max, SystemClock::shared())
    }

    async fn settle(sched: &PriorityScheduler, queued: usize) {
        for _ in 0..100 {
            if sched.queued() == queued {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {}", queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_capacity() {
        let sched = scheduler(2);
        let a = sched.acquire(Priority::Medium).await.unwrap();
        let _b = sched.acquire(Priority::Medium).await.unwrap();
        assert_eq!(sched.active(), 2);

        let waiting = tokio::spawn({
            let sched = sched.clone();
            async move { sched.acquire(Priority::Low).await.map(|_| ()) }
        });
        settle(&sched, 1).await;
        assert_eq!(sched.stats().queued.low, 1);

        drop(a);
        waiting.await.unwrap().unwrap();
        assert_eq!(sched.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_preempts_queued_medium() {
        let sched = scheduler(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = sched.acquire(Priority::Medium).await.unwrap();

        let mut tasks = Vec::new();
        for (label, priority) in [
            ("m1", Priority::Medium),
            ("m2", Priority::Medium),
            ("m3", Priority::Medium),
            ("m4", Priority::Medium),
            ("m5", Priority::Medium),
            ("c", Priority::Critical),
        ] {
            let task_sched = sched.clone();
            let order = Arc::clone(&order);
            let queued_before = sched.queued();
            tasks.push(tokio::spawn(async move {
                let _slot = task_sched.acquire(priority).await.unwrap();
                order.lock().unwrap().push(label);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }));
            settle(&sched, queued_before + 1).await;
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(
            order.lock().unwrap().as_slice(),
            &["c", "m1", "m2", "m3", "m4", "m5"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_raised_waiter_moves_ahead_of_its_old_class() {
        let sched = scheduler(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = sched.acquire(Priority::Medium).await.unwrap();

        let urgency = Urgency::new(Priority::Low);
        let mut tasks = Vec::new();
        for (label, ticket) in [
            ("low", urgency.clone()),
            ("m1", Urgency::new(Priority::Medium)),
            ("m2", Urgency::new(Priority::Medium)),
        ] {
            let task_sched = sched.clone();
            let order = Arc::clone(&order);
            let queued_before = sched.queued();
            tasks.push(tokio::spawn(async move {
                let _slot = task_sched.acquire_raisable(&ticket).await.unwrap();
                order.lock().unwrap().push(label);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }));
            settle(&sched, queued_before + 1).await;
        }

        urgency.raise(Priority::High);
        urgency.raise(Priority::Low);
        assert_eq!(urgency.priority(), Priority::High);
        assert_eq!(sched.stats().queued.high, 1);
        assert_eq!(sched.stats().queued.low, 0);

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(order.lock().unwrap().as_slice(), &["low", "m1", "m2"]);
        assert_eq!(sched.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raised_waiter_that_gives_up_leaves_queue() {
        let sched = scheduler(1);
        let held = sched.acquire(Priority::Medium).await.unwrap();
        let urgency = Urgency::new(Priority::Low);
        let mut waiting = Box::pin(sched.acquire_raisable(&urgency));
        assert!(futures::poll!(&mut waiting).is_pending());

        urgency.raise(Priority::Critical);
        assert_eq!(sched.stats().queued.critical, 1);
        drop(waiting);
        assert_eq!(sched.queued(), 0);
        drop(held);
        assert_eq!(sched.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_leaves_queue() {
        let sched = scheduler(1);
        let held = sched.acquire(Priority::Medium).await.unwrap();
        let gave_up =
            tokio::time::timeout(Duration::from_millis(5), sched.acquire(Priority::High)).await;
        assert!(gave_up.is_err());
        assert_eq!(sched.queued(), 0);
        drop(held);
        assert_eq!(sched.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_to_departed_waiter_is_released() {
        let sched = scheduler(1);
        let held = sched.acquire(Priority::Medium).await.unwrap();
        let mut waiting = Box::pin(sched.acquire(Priority::Low));
        assert!(futures::poll!(&mut waiting).is_pending());
        assert_eq!(sched.queued(), 1);

        drop(held);
        assert_eq!(sched.active(), 1);
        drop(waiting);
        assert_eq!(sched.active(), 0);
        assert!(sched.acquire(Priority::Low).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raising_limit_admits_waiters() {
        let sched = scheduler(1);
        let _held = sched.acquire(Priority::Medium).await.unwrap();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let sched = sched.clone();
                tokio::spawn(async move { sched.acquire(Priority::Medium).await.is_ok() })
            })
            .collect();
        settle(&sched, 2).await;

        sched.set_max_concurrent(3);
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        assert_eq!(sched.active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lowering_limit_drains_without_handoff() {
        let sched = scheduler(2);
        let a = sched.acquire(Priority::Medium).await.unwrap();
        let b = sched.acquire(Priority::Medium).await.unwrap();
        sched.set_max_concurrent(1);
        let waiting = tokio::spawn({
            let sched = sched.clone();
            async move { sched.acquire(Priority::High).await.map(|_| ()) }
        });
        settle(&sched, 1).await;

        drop(a);
        assert_eq!(sched.active(), 1);
        assert_eq!(sched.queued(), 1);
        drop(b);
        waiting.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_rejects_waiters() {
        let sched = scheduler(1);
        let _held = sched.acquire(Priority::Medium).await.unwrap();
        let waiting = tokio::spawn({
            let sched = sched.clone();
            async move { sched.acquire(Priority::Low).await.map(|_| ()) }
        });
        settle(&sched, 1).await;
        sched.reset();
        assert_eq!(waiting.await.unwrap(), Err(CoordError::Cancelled));
        assert_eq!(sched.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_track_wait_and_execution() {
        let sched = scheduler(1);
        let held = sched.acquire(Priority::Medium).await.unwrap();
        let waiting = tokio::spawn({
            let sched = sched.clone();
            async move {
                let _slot = sched.acquire(Priority::Medium).await.unwrap();
            }
        });
        settle(&sched, 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        drop(held);
        waiting.await.unwrap();

        let stats = sched.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.completed, 2);
        assert!((stats.avg_queue_wait_ms - 40.0).abs() < 1e-9);
        assert!((stats.avg_execution_ms - 20.0).abs() < 1e-9);
    }
}
