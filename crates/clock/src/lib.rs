//! Abstract monotonic time for the openclaw control plane.
//!
//! No other component is allowed to read wall-clock time directly; every
//! timer, heartbeat interval, and timeout goes through a [`Clock`] so that
//! a deterministic [`MockClock`] can replace [`RealClock`] in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A callback registered with a [`Clock`]. Boxed so both sync closures and
/// cloned `Arc<dyn Fn>` handlers can be stored uniformly.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Opaque handle returned by [`Clock::schedule_timeout`] /
/// [`Clock::schedule_interval`], used only for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Abstract clock: monotonic time plus callback scheduling.
///
/// Implementations must guarantee that `now_ms()` is non-decreasing and
/// that callbacks registered for the same fire time run in insertion
/// order (ties broken by registration sequence).
pub trait Clock: Send + Sync {
    /// Current monotonic time in milliseconds.
    fn now_ms(&self) -> i64;

    /// Register a one-shot callback to fire after `delay_ms`.
    fn schedule_timeout(&self, delay_ms: u64, callback: Callback) -> TimerHandle;

    /// Register a periodic callback firing every `period_ms`, starting
    /// `period_ms` from now.
    fn schedule_interval(&self, period_ms: u64, callback: Callback) -> TimerHandle;

    /// Cancel a previously scheduled timeout or interval. Idempotent.
    fn cancel(&self, handle: TimerHandle);

    /// Resolve after `ms` of this clock's time has elapsed.
    fn sleep(&self, ms: u64) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Alias for [`Clock::sleep`], named to match the "completion" framing
    /// in the timing contract: `after(ms)` resolves once `ms` have passed.
    fn after(&self, ms: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.sleep(ms)
    }
}

fn sleep_via_schedule(clock: &dyn Clock, ms: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Mutex::new(Some(tx));
    clock.schedule_timeout(
        ms,
        Arc::new(move || {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        }),
    );
    Box::pin(async move {
        let _ = rx.await;
    })
}

/// Real clock: delegates to the OS monotonic clock and the tokio runtime.
pub struct RealClock {
    origin: std::time::Instant,
    next_id: AtomicU64,
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RealClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Clock for RealClock {
    fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    fn schedule_timeout(&self, delay_ms: u64, callback: Callback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        REAL_CANCEL_FLAGS.lock().insert(id, cancelled.clone());
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            if !cancelled.load(Ordering::Acquire) {
                callback();
            }
            REAL_CANCEL_FLAGS.lock().remove(&id);
        });
        TimerHandle(id)
    }

    fn schedule_interval(&self, period_ms: u64, callback: Callback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        REAL_CANCEL_FLAGS.lock().insert(id, cancelled.clone());
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(period_ms)).await;
                if cancelled.load(Ordering::Acquire) {
                    break;
                }
                callback();
            }
        });
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(flag) = REAL_CANCEL_FLAGS.lock().get(&handle.0) {
            flag.store(true, Ordering::Release);
        }
    }

    fn sleep(&self, ms: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(std::time::Duration::from_millis(ms)))
    }
}

// Cancellation flags for in-flight real-clock timers, keyed by handle id.
// A background tokio task owns the actual timer; cancellation just flips a
// flag the task checks before invoking its callback (or before the next
// iteration, for intervals).
static REAL_CANCEL_FLAGS: once_flag::Lazy<
    Mutex<std::collections::HashMap<u64, Arc<std::sync::atomic::AtomicBool>>>,
> = once_flag::Lazy::new(|| Mutex::new(std::collections::HashMap::new()));

/// Tiny inlined `once_cell`-style lazy static so this crate doesn't need an
/// extra dependency for a single global map.
mod once_flag {
    use std::sync::OnceLock;

    pub struct Lazy<T> {
        cell: OnceLock<T>,
        init: fn() -> T,
    }

    impl<T> Lazy<T> {
        pub const fn new(init: fn() -> T) -> Self {
            Self {
                cell: OnceLock::new(),
                init,
            }
        }
    }

    impl<T> std::ops::Deref for Lazy<T> {
        type Target = T;
        fn deref(&self) -> &T {
            self.cell.get_or_init(self.init)
        }
    }
}

struct PendingCallback {
    id: u64,
    fire_at_ms: i64,
    seq: u64,
    periodic_ms: Option<u64>,
    callback: Callback,
}

/// Deterministic mock clock for tests. `advance(ms)` fires every callback
/// whose fire time falls within `[current, current + ms]`, in non-decreasing
/// fire-time order with ties broken by registration order; periodic
/// callbacks reschedule themselves before the next callback is considered.
pub struct MockClock {
    current_ms: AtomicI64,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    pending: Mutex<Vec<PendingCallback>>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            current_ms: AtomicI64::new(0),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn new_at(start_ms: i64) -> Self {
        let clock = Self::new();
        clock.current_ms.store(start_ms, Ordering::Relaxed);
        clock
    }

    fn insert(&self, fire_at_ms: i64, periodic_ms: Option<u64>, callback: Callback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push(PendingCallback {
            id,
            fire_at_ms,
            seq,
            periodic_ms,
            callback,
        });
        TimerHandle(id)
    }

    /// Advance mock time by `ms`, firing due callbacks in order. Returns
    /// the number of callback invocations.
    pub fn advance(&self, ms: u64) -> usize {
        let target = self.current_ms.load(Ordering::Relaxed) + ms as i64;
        let mut fired = 0usize;

        loop {
            let due_id = {
                let pending = self.pending.lock();
                pending
                    .iter()
                    .filter(|p| p.fire_at_ms <= target)
                    .min_by_key(|p| (p.fire_at_ms, p.seq))
                    .map(|p| p.id)
            };
            let Some(id) = due_id else { break };

            let (callback, fire_at_ms, periodic_ms) = {
                let mut pending = self.pending.lock();
                let idx = pending.iter().position(|p| p.id == id).unwrap();
                let entry = pending.remove(idx);
                (entry.callback, entry.fire_at_ms, entry.periodic_ms)
            };

            self.current_ms.store(fire_at_ms, Ordering::Relaxed);
            callback();
            fired += 1;

            if let Some(period) = periodic_ms {
                self.insert(fire_at_ms + period as i64, Some(period), callback);
            }
        }

        self.current_ms.store(target, Ordering::Relaxed);
        fired
    }

    /// Number of timers (one-shot or interval) still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        self.current_ms.load(Ordering::Relaxed)
    }

    fn schedule_timeout(&self, delay_ms: u64, callback: Callback) -> TimerHandle {
        let fire_at = self.now_ms() + delay_ms as i64;
        self.insert(fire_at, None, callback)
    }

    fn schedule_interval(&self, period_ms: u64, callback: Callback) -> TimerHandle {
        let fire_at = self.now_ms() + period_ms as i64;
        self.insert(fire_at, Some(period_ms), callback)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.pending.lock().retain(|p| p.id != handle.0);
    }

    fn sleep(&self, ms: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        sleep_via_schedule(self, ms)
    }
}

/// A caller-supplied signal that cooperating work should stop.
///
/// Shared by the Priority Queue (max-wait-exceeded), the Process Runner
/// (caller abort unless backgrounded), and the Approval Workflow (timeout).
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Shared clock handle threaded through every component.
pub type SharedClock = Arc<dyn Clock>;

pub fn real_clock() -> SharedClock {
    Arc::new(RealClock::new())
}

pub fn mock_clock() -> Arc<MockClock> {
    Arc::new(MockClock::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn mock_clock_fires_in_fire_time_order_with_tie_break_by_insertion() {
        let clock = MockClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        clock.schedule_timeout(100, Arc::new(move || o1.lock().push("a")));
        let o2 = order.clone();
        clock.schedule_timeout(50, Arc::new(move || o2.lock().push("b")));
        let o3 = order.clone();
        clock.schedule_timeout(100, Arc::new(move || o3.lock().push("c")));

        clock.advance(200);
        assert_eq!(*order.lock(), vec!["b", "a", "c"]);
    }

    #[test]
    fn mock_clock_reschedules_periodic_callbacks() {
        let clock = MockClock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        clock.schedule_interval(10, Arc::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        let fired = clock.advance(35);
        assert_eq!(fired, 3);
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(clock.pending_count(), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_prevents_firing() {
        let clock = MockClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = clock.schedule_timeout(10, Arc::new(move || {
            f.fetch_add(1, Ordering::Relaxed);
        }));
        clock.cancel(handle);
        clock.cancel(handle);
        clock.advance(100);
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn real_clock_sleep_completes() {
        let clock = RealClock::new();
        let start = clock.now_ms();
        clock.sleep(5).await;
        assert!(clock.now_ms() >= start);
    }
}
