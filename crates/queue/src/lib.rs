//! 4-level strict-priority queue with aging, backpressure, and a side
//! index that keeps `remove(task_id)` O(1).
//!
//! Each lane is a `VecDeque` so `dequeue()` is a plain `pop_front` (FIFO
//! within a lane); out-of-band removal (max-wait-exceeded, cancellation)
//! uses `swap_remove_back`, which is O(1) but may reorder the two
//! remaining elements it touches — an accepted trade-off since that path
//! only runs for tasks leaving the queue early, never for normal drain.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use openclaw_clock::{CancellationToken, SharedClock};
use openclaw_timewheel::TimingWheel;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    fn idx(self) -> usize {
        self as usize
    }

    fn from_idx(idx: usize) -> Self {
        match idx {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }

    /// One level toward Critical, capped at Critical.
    pub fn boosted(self) -> Priority {
        Priority::from_idx(self.idx().saturating_sub(1))
    }

    /// One level toward Low, capped at Low (returns `None` if already Low).
    pub fn demoted(self) -> Option<Priority> {
        if self == Priority::Low {
            None
        } else {
            Some(Priority::from_idx(self.idx() + 1))
        }
    }
}

const LANES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionPolicy {
    Reject,
    DropOldest,
    Demote,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub per_priority_cap: [usize; LANES],
    pub global_cap: usize,
    pub aging_threshold_ms: u64,
    pub max_wait_time_ms: u64,
    pub rejection_policy: RejectionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            per_priority_cap: [256, 256, 256, 256],
            global_cap: 1024,
            aging_threshold_ms: 30_000,
            max_wait_time_ms: 300_000,
            rejection_policy: RejectionPolicy::Reject,
        }
    }
}

pub struct QueuedTask<T> {
    pub task_id: String,
    pub priority: Priority,
    pub original_priority: Priority,
    pub command: String,
    pub enqueued_at_ms: i64,
    pub payload: T,
    pub cancellation_token: CancellationToken,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { task_id: String },
    Dequeued { task_id: String },
    Rejected { reason: String },
    Aged { task_id: String, from: Priority, to: Priority },
    Dropped { task_id: String },
    MaxWaitExceeded { task_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub per_lane: [usize; LANES],
    pub total: usize,
}

struct AgingEntry {
    next_boost_at_ms: i64,
    seq: u64,
    task_id: String,
}

struct Inner<T> {
    lanes: [VecDeque<QueuedTask<T>>; LANES],
    index: HashMap<String, (usize, usize)>,
    aging_heap: BinaryHeap<Reverse<(i64, u64)>>,
    aging_lookup: HashMap<u64, AgingEntry>,
    aging_seq: u64,
    events: Vec<QueueEvent>,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            lanes: std::array::from_fn(|_| VecDeque::new()),
            index: HashMap::new(),
            aging_heap: BinaryHeap::new(),
            aging_lookup: HashMap::new(),
            aging_seq: 0,
            events: Vec::new(),
        }
    }

    fn size(&self) -> usize {
        self.lanes.iter().map(|l| l.len()).sum()
    }

    fn remove_by_id(&mut self, task_id: &str) -> Option<QueuedTask<T>> {
        let (lane, idx) = self.index.remove(task_id)?;
        let deque = &mut self.lanes[lane];
        let removed = if idx + 1 == deque.len() {
            deque.pop_back()
        } else {
            deque.swap_remove_back(idx)
        };
        if idx < deque.len() {
            if let Some(moved) = deque.get(idx) {
                self.index.insert(moved.task_id.clone(), (lane, idx));
            }
        }
        removed
    }

    fn push(&mut self, lane: usize, task: QueuedTask<T>) {
        let deque = &mut self.lanes[lane];
        self.index.insert(task.task_id.clone(), (lane, deque.len()));
        deque.push_back(task);
    }
}

/// 4-level priority queue. `T` is the caller's opaque task payload (the
/// spec's "execute" callable lives one layer up, in the exec scheduler).
pub struct PriorityQueue<T> {
    config: QueueConfig,
    inner: Mutex<Inner<T>>,
    clock: SharedClock,
    wheel: Arc<TimingWheel>,
}

impl<T: Send + 'static> PriorityQueue<T> {
    pub fn new(config: QueueConfig, clock: SharedClock, wheel: Arc<TimingWheel>) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner::new()),
            clock,
            wheel,
        })
    }

    pub fn enqueue(self: &Arc<Self>, mut task: QueuedTask<T>) -> EnqueueOutcome {
        loop {
            let lane = task.priority.idx();
            let mut inner = self.inner.lock();
            let lane_len = inner.lanes[lane].len();
            let total = inner.size();
            let per_lane_ok = lane_len < self.config.per_priority_cap[lane];
            let global_ok = total < self.config.global_cap;

            if per_lane_ok && global_ok {
                let task_id = task.task_id.clone();
                let enqueued_at_ms = task.enqueued_at_ms;
                inner.push(lane, task);
                inner.events.push(QueueEvent::Enqueued {
                    task_id: task_id.clone(),
                });
                drop(inner);
                self.arm_max_wait(&task_id);
                self.arm_aging(&task_id, enqueued_at_ms);
                return EnqueueOutcome {
                    success: true,
                    reason: None,
                };
            }

            match self.config.rejection_policy {
                RejectionPolicy::Reject => {
                    tracing::warn!(lane, "queue full, rejecting enqueue");
                    inner.events.push(QueueEvent::Rejected {
                        reason: "queue-full".to_string(),
                    });
                    return EnqueueOutcome {
                        success: false,
                        reason: Some("queue-full".to_string()),
                    };
                }
                RejectionPolicy::DropOldest => {
                    if let Some(victim) = inner.lanes[lane].pop_front() {
                        inner.index.remove(&victim.task_id);
                        // Positions shifted by one; re-sync the side index.
                        let updates: Vec<(String, usize)> = inner.lanes[lane]
                            .iter()
                            .enumerate()
                            .map(|(pos, t)| (t.task_id.clone(), pos))
                            .collect();
                        for (task_id, pos) in updates {
                            inner.index.insert(task_id, (lane, pos));
                        }
                        tracing::warn!(lane, dropped_task_id = %victim.task_id, "queue full, dropping oldest");
                        inner.events.push(QueueEvent::Dropped {
                            task_id: victim.task_id.clone(),
                        });
                        let task_id = task.task_id.clone();
                        let enqueued_at_ms = task.enqueued_at_ms;
                        inner.push(lane, task);
                        inner.events.push(QueueEvent::Enqueued {
                            task_id: task_id.clone(),
                        });
                        drop(inner);
                        self.arm_max_wait(&task_id);
                        self.arm_aging(&task_id, enqueued_at_ms);
                        return EnqueueOutcome {
                            success: true,
                            reason: None,
                        };
                    }
                    inner.events.push(QueueEvent::Rejected {
                        reason: "queue-full".to_string(),
                    });
                    return EnqueueOutcome {
                        success: false,
                        reason: Some("queue-full".to_string()),
                    };
                }
                RejectionPolicy::Demote => {
                    drop(inner);
                    match task.priority.demoted() {
                        Some(demoted) => {
                            task.priority = demoted;
                            continue;
                        }
                        None => {
                            self.inner.lock().events.push(QueueEvent::Rejected {
                                reason: "queue-full".to_string(),
                            });
                            return EnqueueOutcome {
                                success: false,
                                reason: Some("queue-full".to_string()),
                            };
                        }
                    }
                }
            }
        }
    }

    pub fn dequeue(&self) -> Option<QueuedTask<T>> {
        let mut inner = self.inner.lock();
        for lane in 0..LANES {
            if let Some(task) = inner.lanes[lane].pop_front() {
                inner.index.remove(&task.task_id);
                let updates: Vec<(String, usize)> = inner.lanes[lane]
                    .iter()
                    .enumerate()
                    .map(|(pos, t)| (t.task_id.clone(), pos))
                    .collect();
                for (task_id, pos) in updates {
                    inner.index.insert(task_id, (lane, pos));
                }
                inner.events.push(QueueEvent::Dequeued {
                    task_id: task.task_id.clone(),
                });
                self.wheel.cancel_timeout(&max_wait_id(&task.task_id));
                return Some(task);
            }
        }
        None
    }

    pub fn remove(&self, task_id: &str) -> bool {
        let removed = self.inner.lock().remove_by_id(task_id).is_some();
        if removed {
            self.wheel.cancel_timeout(&max_wait_id(task_id));
        }
        removed
    }

    pub fn get_size(&self) -> usize {
        self.inner.lock().size()
    }

    pub fn get_stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for lane in 0..LANES {
            stats.per_lane[lane] = inner.lanes[lane].len();
        }
        stats.total = stats.per_lane.iter().sum();
        stats
    }

    pub fn drain_events(&self) -> Vec<QueueEvent> {
        std::mem::take(&mut self.inner.lock().events)
    }

    fn arm_max_wait(self: &Arc<Self>, task_id: &str) {
        if self.config.max_wait_time_ms == 0 {
            return;
        }
        let this = self.clone();
        let id = task_id.to_string();
        self.wheel.schedule_timeout(
            max_wait_id(task_id),
            self.config.max_wait_time_ms,
            Arc::new(move || {
                if let Some(task) = this.inner.lock().remove_by_id(&id) {
                    task.cancellation_token.cancel();
                    this.inner.lock().events.push(QueueEvent::MaxWaitExceeded {
                        task_id: id.clone(),
                    });
                }
            }),
        );
    }

    fn arm_aging(&self, task_id: &str, enqueued_at_ms: i64) {
        if self.config.aging_threshold_ms == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let seq = inner.aging_seq;
        inner.aging_seq += 1;
        let next_boost_at_ms = enqueued_at_ms + self.config.aging_threshold_ms as i64;
        inner.aging_heap.push(Reverse((next_boost_at_ms, seq)));
        inner.aging_lookup.insert(
            seq,
            AgingEntry {
                next_boost_at_ms,
                seq,
                task_id: task_id.to_string(),
            },
        );
    }

    /// Boost every task whose aging timer is due as of `now_ms`. Visits
    /// only tasks actually due (`O(k log n)` over the `k` due tasks), not
    /// the whole queue.
    pub fn run_aging_sweep(&self, now_ms: i64) {
        loop {
            let mut inner = self.inner.lock();
            let Some(&Reverse((due_at, seq))) = inner.aging_heap.peek() else {
                break;
            };
            if due_at > now_ms {
                break;
            }
            inner.aging_heap.pop();
            let Some(entry) = inner.aging_lookup.remove(&seq) else {
                continue;
            };

            let Some(&(lane, idx)) = inner.index.get(&entry.task_id) else {
                // Task already left the queue; stale aging entry, ignore.
                continue;
            };
            let from = Priority::from_idx(lane);
            let to = from.boosted();
            if to == from {
                continue; // already Critical
            }

            let task = inner
                .remove_by_id(&entry.task_id)
                .expect("index said it was there");
            let mut task = task;
            task.priority = to;
            inner.push(to.idx(), task);
            tracing::debug!(task_id = %entry.task_id, ?from, ?to, "task aged up a priority lane");
            inner.events.push(QueueEvent::Aged {
                task_id: entry.task_id.clone(),
                from,
                to,
            });
            let _ = idx;

            if to != Priority::Critical {
                let next_seq = inner.aging_seq;
                inner.aging_seq += 1;
                let next_due = now_ms + self.config.aging_threshold_ms as i64;
                inner.aging_heap.push(Reverse((next_due, next_seq)));
                inner.aging_lookup.insert(
                    next_seq,
                    AgingEntry {
                        next_boost_at_ms: next_due,
                        seq: next_seq,
                        task_id: entry.task_id,
                    },
                );
            }
        }
    }
}

fn max_wait_id(task_id: &str) -> String {
    format!("queue-max-wait-{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_clock::{mock_clock, Clock};

    fn setup(config: QueueConfig) -> (Arc<PriorityQueue<u32>>, Arc<openclaw_clock::MockClock>) {
        let clock = mock_clock();
        let wheel = Arc::new(TimingWheel::new(clock.clone()));
        wheel.start();
        (PriorityQueue::new(config, clock.clone(), wheel), clock)
    }

    fn task(id: &str, priority: Priority, enqueued_at_ms: i64) -> QueuedTask<u32> {
        QueuedTask {
            task_id: id.to_string(),
            priority,
            original_priority: priority,
            command: "noop".into(),
            enqueued_at_ms,
            payload: 0,
            cancellation_token: CancellationToken::new(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn dequeue_respects_strict_priority() {
        let (q, _clock) = setup(QueueConfig::default());
        q.enqueue(task("low", Priority::Low, 0));
        q.enqueue(task("crit", Priority::Critical, 0));
        let first = q.dequeue().unwrap();
        assert_eq!(first.task_id, "crit");
    }

    #[test]
    fn dequeue_is_fifo_within_a_lane() {
        let (q, _clock) = setup(QueueConfig::default());
        q.enqueue(task("a", Priority::Normal, 0));
        q.enqueue(task("b", Priority::Normal, 1));
        q.enqueue(task("c", Priority::Normal, 2));
        assert_eq!(q.dequeue().unwrap().task_id, "a");
        assert_eq!(q.dequeue().unwrap().task_id, "b");
        assert_eq!(q.dequeue().unwrap().task_id, "c");
    }

    #[test]
    fn size_matches_sum_of_lanes_after_enqueue() {
        let (q, _clock) = setup(QueueConfig::default());
        for i in 0..5 {
            q.enqueue(task(&format!("t{i}"), Priority::Normal, 0));
        }
        assert_eq!(q.get_size(), 5);
    }

    #[test]
    fn reject_policy_denies_when_full() {
        let mut config = QueueConfig::default();
        config.per_priority_cap = [1, 1, 1, 1];
        config.global_cap = 1;
        let (q, _clock) = setup(config);
        assert!(q.enqueue(task("a", Priority::Low, 0)).success);
        let outcome = q.enqueue(task("b", Priority::Low, 0));
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("queue-full"));
    }

    #[test]
    fn drop_oldest_makes_room() {
        let mut config = QueueConfig::default();
        config.per_priority_cap = [10, 10, 1, 10];
        config.global_cap = 10;
        config.rejection_policy = RejectionPolicy::DropOldest;
        let (q, _clock) = setup(config);
        q.enqueue(task("old", Priority::Normal, 0));
        let outcome = q.enqueue(task("new", Priority::Normal, 1));
        assert!(outcome.success);
        assert_eq!(q.get_size(), 1);
        assert_eq!(q.dequeue().unwrap().task_id, "new");
    }

    #[test]
    fn demote_policy_steps_down_until_low_then_rejects() {
        let mut config = QueueConfig::default();
        config.per_priority_cap = [0, 0, 0, 0];
        config.global_cap = 10;
        config.rejection_policy = RejectionPolicy::Demote;
        let (q, _clock) = setup(config);
        let outcome = q.enqueue(task("a", Priority::Critical, 0));
        assert!(!outcome.success);
    }

    #[test]
    fn aging_boosts_oldest_tasks_first_and_never_decreases_priority() {
        let mut config = QueueConfig::default();
        config.aging_threshold_ms = 50;
        let (q, clock) = setup(config);
        q.enqueue(task("old", Priority::Low, 0));
        clock.advance(60);
        q.run_aging_sweep(clock.now_ms());
        let stats = q.get_stats();
        assert_eq!(stats.per_lane[Priority::Normal.idx()], 1);
        assert_eq!(stats.per_lane[Priority::Low.idx()], 0);
    }

    #[test]
    fn max_wait_exceeded_removes_and_cancels_token() {
        let mut config = QueueConfig::default();
        config.max_wait_time_ms = 10;
        let (q, clock) = setup(config);
        let mut t = task("slow", Priority::Low, 0);
        let token = t.cancellation_token.clone();
        q.enqueue(t);
        clock.advance(20);
        assert_eq!(q.get_size(), 0);
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove_is_idempotent_and_keeps_size_consistent() {
        let (q, _clock) = setup(QueueConfig::default());
        q.enqueue(task("a", Priority::Normal, 0));
        q.enqueue(task("b", Priority::Normal, 0));
        assert!(q.remove("a"));
        assert!(!q.remove("a"));
        assert_eq!(q.get_size(), 1);
        assert_eq!(q.dequeue().unwrap().task_id, "b");
    }
}
