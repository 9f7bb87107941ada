//! Hierarchical timing wheel.
//!
//! A 3-level, 256-slot-per-level wheel (the coarsening scheme spec.md §4.2
//! recommends) keyed by caller-chosen opaque string ids. `scheduleTimeout`
//! with an id already pending replaces the prior callback; cancellation is
//! idempotent. The wheel is driven by a single internal tick timer
//! registered with the shared [`Clock`], so [`MockClock`]-driven tests get
//! deterministic, instantaneous ticking via `advance()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use openclaw_clock::{Callback, Clock, SharedClock, TimerHandle};
use parking_lot::Mutex;

const SLOTS: usize = 256;
const LEVELS: usize = 3;
const SLOT_MASK: u64 = (SLOTS - 1) as u64;
const SLOT_BITS: u32 = 8;
pub const DEFAULT_TICK_MS: u64 = 1;

struct Entry {
    id: String,
    seq: u64,
    deadline_tick: u64,
    period_ticks: Option<u64>,
    callback: Callback,
}

#[derive(Clone, Copy)]
struct Location {
    level: usize,
    slot: usize,
}

struct WheelState {
    current_tick: u64,
    next_seq: u64,
    levels: [Vec<Vec<Entry>>; LEVELS],
    index: HashMap<String, Location>,
}

impl WheelState {
    fn new() -> Self {
        Self {
            current_tick: 0,
            next_seq: 0,
            levels: std::array::from_fn(|_| (0..SLOTS).map(|_| Vec::new()).collect()),
            index: HashMap::new(),
        }
    }

    fn level_and_slot(current_tick: u64, deadline_tick: u64) -> (usize, usize) {
        let delay = deadline_tick.saturating_sub(current_tick);
        if delay < (1u64 << SLOT_BITS) {
            (0, (deadline_tick & SLOT_MASK) as usize)
        } else if delay < (1u64 << (2 * SLOT_BITS)) {
            (1, ((deadline_tick >> SLOT_BITS) & SLOT_MASK) as usize)
        } else {
            // Horizon beyond level 2 (~4.7M ticks, ~78 minutes at the
            // default 1ms tick) is clamped into the coarsest slot; no
            // caller in this system schedules anything near that far out
            // (the longest-lived timer is a heartbeat interval, itself
            // re-armed well before it would need this range).
            let clamped = deadline_tick.min(current_tick + (1u64 << (3 * SLOT_BITS)) - 1);
            (2, ((clamped >> (2 * SLOT_BITS)) & SLOT_MASK) as usize)
        }
    }

    fn remove_existing(&mut self, id: &str) {
        if let Some(loc) = self.index.remove(id) {
            self.levels[loc.level][loc.slot].retain(|e| e.id != id);
        }
    }

    fn insert(&mut self, id: String, deadline_tick: u64, period_ticks: Option<u64>, callback: Callback) {
        self.remove_existing(&id);
        let (level, slot) = Self::level_and_slot(self.current_tick, deadline_tick);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(id.clone(), Location { level, slot });
        self.levels[level][slot].push(Entry {
            id,
            seq,
            deadline_tick,
            period_ticks,
            callback,
        });
    }

    fn cancel(&mut self, id: &str) -> bool {
        if self.index.contains_key(id) {
            self.remove_existing(id);
            true
        } else {
            false
        }
    }

    fn has_timer(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn cascade(&mut self, level: usize, slot: usize) {
        let entries = std::mem::take(&mut self.levels[level][slot]);
        for entry in entries {
            self.index.remove(&entry.id);
            let (new_level, new_slot) = Self::level_and_slot(self.current_tick, entry.deadline_tick);
            self.index.insert(entry.id.clone(), Location { level: new_level, slot: new_slot });
            self.levels[new_level][new_slot].push(entry);
        }
    }

    /// Advance by one tick, returning callbacks due to fire this tick in
    /// non-decreasing fire-time order (ties broken by insertion order).
    /// Firing happens outside the lock in the caller, so callbacks may
    /// themselves call back into the wheel.
    fn tick(&mut self) -> Vec<(Callback, Option<(String, u64, u64)>)> {
        self.current_tick += 1;
        let t = self.current_tick;

        if t & ((1u64 << (2 * SLOT_BITS)) - 1) == 0 {
            self.cascade(2, ((t >> (2 * SLOT_BITS)) & SLOT_MASK) as usize);
        }
        if t & SLOT_MASK == 0 {
            self.cascade(1, ((t >> SLOT_BITS) & SLOT_MASK) as usize);
        }

        let slot = (t & SLOT_MASK) as usize;
        let (mut due, not_due): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.levels[0][slot])
            .into_iter()
            .partition(|e| e.deadline_tick == t);
        // Entries whose deadline isn't actually this tick (shouldn't
        // normally happen, but self-heals rather than dropping a timer)
        // get reinserted.
        for e in not_due {
            self.index.remove(&e.id);
            self.insert(e.id, e.deadline_tick, e.period_ticks, e.callback);
        }
        due.sort_by_key(|e| e.seq);

        let mut out = Vec::with_capacity(due.len());
        for entry in due {
            self.index.remove(&entry.id);
            let reschedule = entry
                .period_ticks
                .map(|p| (entry.id.clone(), t + p, p));
            out.push((entry.callback, reschedule));
        }
        out
    }
}

/// A hierarchical timing wheel driven by a shared [`Clock`].
pub struct TimingWheel {
    clock: SharedClock,
    tick_ms: u64,
    state: Arc<Mutex<WheelState>>,
    driver: Mutex<Option<TimerHandle>>,
    running: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl TimingWheel {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_tick_ms(clock, DEFAULT_TICK_MS)
    }

    pub fn with_tick_ms(clock: SharedClock, tick_ms: u64) -> Self {
        Self {
            clock,
            tick_ms: tick_ms.max(1),
            state: Arc::new(Mutex::new(WheelState::new())),
            driver: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn ms_to_ticks(&self, ms: u64) -> u64 {
        (ms + self.tick_ms - 1) / self.tick_ms
    }

    /// Start the internal tick driver. Calling `start()` twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(tick_ms = self.tick_ms, "timing wheel started");
        let state = self.state.clone();
        let running = self.running.clone();
        let generation = self.generation.clone();
        let my_generation = generation.load(Ordering::Acquire);
        let handle = self.clock.schedule_interval(
            self.tick_ms,
            Arc::new(move || {
                if !running.load(Ordering::Acquire) || generation.load(Ordering::Acquire) != my_generation {
                    return;
                }
                let fired = state.lock().tick();
                for (callback, reschedule) in fired {
                    if let Some((id, deadline_tick, period_ticks)) = reschedule {
                        state
                            .lock()
                            .insert(id, deadline_tick, Some(period_ticks), callback.clone());
                    }
                    callback();
                }
            }),
        );
        *self.driver.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(handle) = self.driver.lock().take() {
            self.clock.cancel(handle);
        }
    }

    /// At-most-one callback per `id`. Scheduling with an existing id
    /// replaces the prior callback. A zero (or sub-tick) delay is clamped
    /// to one tick so it fires on the next `tick()` rather than waiting a
    /// full wheel revolution for `current_tick` to wrap back to its slot.
    pub fn schedule_timeout(&self, id: impl Into<String>, delay_ms: u64, callback: Callback) {
        let deadline = self.ms_to_ticks(delay_ms).max(1);
        let mut state = self.state.lock();
        let current = state.current_tick;
        state.insert(id.into(), current + deadline, None, callback);
    }

    pub fn schedule_interval(&self, id: impl Into<String>, period_ms: u64, callback: Callback) {
        let period_ticks = self.ms_to_ticks(period_ms).max(1);
        let mut state = self.state.lock();
        let current = state.current_tick;
        state.insert(id.into(), current + period_ticks, Some(period_ticks), callback);
    }

    pub fn cancel_timeout(&self, id: &str) -> bool {
        self.state.lock().cancel(id)
    }

    pub fn cancel_interval(&self, id: &str) -> bool {
        self.state.lock().cancel(id)
    }

    pub fn has_timer(&self, id: &str) -> bool {
        self.state.lock().has_timer(id)
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_clock::MockClock;
    use std::sync::Mutex as StdMutex;

    fn wheel_on(clock: Arc<MockClock>) -> Arc<TimingWheel> {
        let clock_dyn: SharedClock = clock;
        Arc::new(TimingWheel::new(clock_dyn))
    }

    #[test]
    fn fires_once_and_frees_the_id() {
        let clock = openclaw_clock::mock_clock();
        let wheel = wheel_on(clock.clone());
        wheel.start();

        let fired = Arc::new(StdMutex::new(Vec::new()));
        let f = fired.clone();
        wheel.schedule_timeout("t1", 5, Arc::new(move || f.lock().unwrap().push("t1")));
        assert!(wheel.has_timer("t1"));

        clock.advance(10);
        assert_eq!(*fired.lock().unwrap(), vec!["t1"]);
        assert!(!wheel.has_timer("t1"));
    }

    #[test]
    fn zero_delay_fires_on_the_next_tick() {
        let clock = openclaw_clock::mock_clock();
        let wheel = wheel_on(clock.clone());
        wheel.start();

        let fired = Arc::new(StdMutex::new(false));
        let f = fired.clone();
        wheel.schedule_timeout("now", 0, Arc::new(move || *f.lock().unwrap() = true));

        clock.advance(1);
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn scheduling_same_id_replaces_prior_callback() {
        let clock = openclaw_clock::mock_clock();
        let wheel = wheel_on(clock.clone());
        wheel.start();

        let fired = Arc::new(StdMutex::new(Vec::new()));
        let f1 = fired.clone();
        wheel.schedule_timeout("dup", 100, Arc::new(move || f1.lock().unwrap().push("old")));
        let f2 = fired.clone();
        wheel.schedule_timeout("dup", 5, Arc::new(move || f2.lock().unwrap().push("new")));

        clock.advance(10);
        assert_eq!(*fired.lock().unwrap(), vec!["new"]);
        clock.advance(200);
        assert_eq!(*fired.lock().unwrap(), vec!["new"]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let clock = openclaw_clock::mock_clock();
        let wheel = wheel_on(clock.clone());
        wheel.start();
        wheel.schedule_timeout("c1", 5, Arc::new(|| {}));
        assert!(wheel.cancel_timeout("c1"));
        assert!(!wheel.cancel_timeout("c1"));
        assert!(!wheel.has_timer("c1"));
    }

    #[test]
    fn fires_in_nondecreasing_order_with_insertion_tiebreak() {
        let clock = openclaw_clock::mock_clock();
        let wheel = wheel_on(clock.clone());
        wheel.start();

        let order = Arc::new(StdMutex::new(Vec::new()));
        let o1 = order.clone();
        wheel.schedule_timeout("a", 20, Arc::new(move || o1.lock().unwrap().push("a")));
        let o2 = order.clone();
        wheel.schedule_timeout("b", 5, Arc::new(move || o2.lock().unwrap().push("b")));
        let o3 = order.clone();
        wheel.schedule_timeout("c", 20, Arc::new(move || o3.lock().unwrap().push("c")));

        clock.advance(25);
        assert_eq!(*order.lock().unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn interval_reschedules_across_many_ticks() {
        let clock = openclaw_clock::mock_clock();
        let wheel = wheel_on(clock.clone());
        wheel.start();

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        wheel.schedule_interval(
            "periodic",
            10,
            Arc::new(move || {
                c.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }),
        );

        clock.advance(55);
        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 5);
        assert!(wheel.has_timer("periodic"));
    }

    #[test]
    fn cascades_from_coarser_levels_correctly() {
        let clock = openclaw_clock::mock_clock();
        let wheel = wheel_on(clock.clone());
        wheel.start();

        let fired = Arc::new(StdMutex::new(false));
        let f = fired.clone();
        // Delay bigger than one level-0 revolution (256 ticks) forces this
        // entry into level 1, then it must cascade down correctly.
        wheel.schedule_timeout("far", 500, Arc::new(move || *f.lock().unwrap() = true));

        clock.advance(499);
        assert!(!*fired.lock().unwrap());
        clock.advance(5);
        assert!(*fired.lock().unwrap());
    }
}
