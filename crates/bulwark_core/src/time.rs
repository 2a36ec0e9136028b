//! Time types and the clock abstraction.
//!
//! Every cooldown, flush window and refill reads time through [`Clock`].
//! [`SystemClock`] follows `tokio::time`, so a paused tokio runtime makes it
//! deterministic; [`ManualClock`] only moves when a test advances it.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Milliseconds elapsed since the origin of the clock that produced it
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The clock origin
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from raw milliseconds
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Get raw milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Add a duration, saturating at the maximum representable instant
    #[must_use]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// Time elapsed since `earlier` (zero if `earlier` is in the future)
    #[must_use]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Whole milliseconds of a duration, saturating at `u64::MAX`
#[must_use]
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Source of time and timers
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant
    fn now(&self) -> Timestamp;

    /// Future that resolves once `duration` has elapsed on this clock
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by `tokio::time`
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    /// Create a clock whose origin is now
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }

    /// Create a shared handle
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(duration_millis(self.origin.elapsed()))
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock that only moves when told to
///
/// Sleepers are woken by [`ManualClock::advance`] once their deadline is
/// reached. Clones share the same time line.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

#[derive(Debug, Default)]
struct ManualInner {
    now: AtomicU64,
    sleepers: Mutex<Vec<(u64, oneshot::Sender<()>)>>,
}

impl ManualClock {
    /// Create a clock at the origin
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock starting at `millis`
    #[must_use]
    pub fn starting_at(millis: u64) -> Self {
        let clock = Self::new();
        clock.inner.now.store(millis, Ordering::SeqCst);
        clock
    }

    /// Move time forward and wake every sleeper that became due
    pub fn advance(&self, duration: Duration) {
        let step = duration_millis(duration);
        let now = self.inner.now.fetch_add(step, Ordering::SeqCst).saturating_add(step);

        let due: Vec<oneshot::Sender<()>> = {
            let mut sleepers = self
                .inner
                .sleepers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let (due, pending): (Vec<_>, Vec<_>) =
                sleepers.drain(..).partition(|(deadline, _)| *deadline <= now);
            *sleepers = pending;
            due.into_iter().map(|(_, tx)| tx).collect()
        };

        for tx in due {
            let _ = tx.send(());
        }
    }

    /// Number of sleepers still waiting
    #[must_use]
    pub fn pending_sleepers(&self) -> usize {
        self.inner
            .sleepers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Create a shared handle to the same time line
    #[must_use]
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.inner.now.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            return Box::pin(async {});
        }
        let deadline = self.now().saturating_add(duration).as_millis();
        let (tx, rx) = oneshot::channel();
        self.inner
            .sleepers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((deadline, tx));
        Box::pin(async move {
            let _ = rx.await;
        })
    }
}
