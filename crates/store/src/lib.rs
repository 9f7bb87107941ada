//! Embedded durable store for heartbeat schedules, their run history,
//! pending signals, and per-agent allowlists.
//!
//! Backed by `sled`: each logical table is a separate sled tree, every
//! mutating call flushes before returning so "atomic and durable before
//! returning success" (spec.md §4.3) holds without the caller having to
//! know the storage engine. Schema creation is idempotent: trees are
//! opened lazily by `sled` itself.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage engine error: {0}")]
    Engine(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("schedule not found for agent {0}")]
    ScheduleNotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleState {
    Active,
    Paused,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHours {
    pub start_minute_of_day: u16,
    pub end_minute_of_day: u16,
    pub tz: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Visibility {
    pub show_in_timeline: bool,
    pub show_in_summary: bool,
    pub notify_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: String,
    pub agent_id: String,
    pub state: ScheduleState,
    pub interval_ms: u64,
    pub next_run_at_ms: i64,
    pub active_hours: Option<ActiveHours>,
    pub visibility: Visibility,
    pub created_at_ms: i64,
}

impl Schedule {
    pub fn schedule_id_for(agent_id: &str) -> String {
        format!("heartbeat-{agent_id}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub schedule_id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub started_at_ms: i64,
    pub completed_at_ms: i64,
    pub duration_ms: i64,
    pub message: Option<String>,
    pub channel: Option<String>,
    pub account_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Pause,
    RunNow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub schedule_id: String,
    pub kind: SignalKind,
    pub reason: Option<String>,
    pub enqueued_at_ms: i64,
    pub processed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub schedule_id: String,
    pub last_status: Option<RunStatus>,
    pub consecutive_failures: u32,
    pub last_run_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub agent_id: String,
    pub pattern: String,
    pub added_at_ms: i64,
    pub last_used_at_ms: i64,
    pub use_count: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum AnalyticsWindow {
    OneHour,
    OneDay,
    SevenDays,
    ThirtyDays,
}

impl AnalyticsWindow {
    pub fn millis(self) -> i64 {
        match self {
            AnalyticsWindow::OneHour => 3_600_000,
            AnalyticsWindow::OneDay => 86_400_000,
            AnalyticsWindow::SevenDays => 7 * 86_400_000,
            AnalyticsWindow::ThirtyDays => 30 * 86_400_000,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(AnalyticsWindow::OneHour),
            "24h" => Some(AnalyticsWindow::OneDay),
            "7d" => Some(AnalyticsWindow::SevenDays),
            "30d" => Some(AnalyticsWindow::ThirtyDays),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analytics {
    pub total_runs: u64,
    pub ok_runs: u64,
    pub error_runs: u64,
    pub skipped_runs: u64,
    pub avg_duration_ms: f64,
}

/// Embedded durable store, single process, sled-backed.
pub struct DurableStore {
    db: sled::Db,
    schedules: sled::Tree,
    runs: sled::Tree,
    run_seq: sled::Tree,
    signals: sled::Tree,
    allowlist: sled::Tree,
}

impl DurableStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "opening durable store");
        let db = sled::open(path)?;
        let schedules = db.open_tree("schedules")?;
        let runs = db.open_tree("runs")?;
        let run_seq = db.open_tree("run_seq")?;
        let signals = db.open_tree("signals")?;
        let allowlist = db.open_tree("allowlist")?;
        Ok(Self {
            db,
            schedules,
            runs,
            run_seq,
            signals,
            allowlist,
        })
    }

    /// Opens an ephemeral in-memory store, for tests.
    pub fn open_temp() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let schedules = db.open_tree("schedules")?;
        let runs = db.open_tree("runs")?;
        let run_seq = db.open_tree("run_seq")?;
        let signals = db.open_tree("signals")?;
        let allowlist = db.open_tree("allowlist")?;
        Ok(Self {
            db,
            schedules,
            runs,
            run_seq,
            signals,
            allowlist,
        })
    }

    fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // ---- schedules ----

    pub fn create_schedule(&self, schedule: &Schedule) -> StoreResult<()> {
        let bytes = serde_json::to_vec(schedule)?;
        self.schedules.insert(schedule.agent_id.as_bytes(), bytes)?;
        self.flush()
    }

    pub fn get_schedule(&self, agent_id: &str) -> StoreResult<Option<Schedule>> {
        match self.schedules.get(agent_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn update_schedule_next_run(&self, agent_id: &str, next_run_at_ms: i64) -> StoreResult<()> {
        let mut schedule = self
            .get_schedule(agent_id)?
            .ok_or_else(|| StoreError::ScheduleNotFound(agent_id.to_string()))?;
        schedule.next_run_at_ms = next_run_at_ms;
        self.create_schedule(&schedule)
    }

    pub fn set_schedule_state(&self, agent_id: &str, state: ScheduleState) -> StoreResult<()> {
        let mut schedule = self
            .get_schedule(agent_id)?
            .ok_or_else(|| StoreError::ScheduleNotFound(agent_id.to_string()))?;
        schedule.state = state;
        self.create_schedule(&schedule)
    }

    /// Schedules with `next_run_at_ms <= now + window_ms` and `state == Active`.
    pub fn get_due_schedules(&self, now_ms: i64, window_ms: i64) -> StoreResult<Vec<Schedule>> {
        let mut due = Vec::new();
        for item in self.schedules.iter() {
            let (_, bytes) = item?;
            let schedule: Schedule = serde_json::from_slice(&bytes)?;
            if schedule.state == ScheduleState::Active && schedule.next_run_at_ms <= now_ms + window_ms {
                due.push(schedule);
            }
        }
        due.sort_by_key(|s| s.next_run_at_ms);
        Ok(due)
    }

    // ---- runs ----

    pub fn record_run(&self, run: &Run) -> StoreResult<()> {
        let seq = self.run_seq.update_and_fetch(run.schedule_id.as_bytes(), |old| {
            let n = old
                .map(|bytes| u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])))
                .unwrap_or(0);
            Some((n + 1).to_be_bytes().to_vec())
        })?;
        let seq = seq
            .map(|bytes| u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0; 8])))
            .unwrap_or(1);
        let mut key = run.schedule_id.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(&seq.to_be_bytes());
        let bytes = serde_json::to_vec(run)?;
        self.runs.insert(key, bytes)?;
        self.flush()
    }

    fn runs_for_schedule(&self, schedule_id: &str) -> StoreResult<Vec<Run>> {
        let mut prefix = schedule_id.as_bytes().to_vec();
        prefix.push(0);
        let mut out = Vec::new();
        for item in self.runs.scan_prefix(prefix) {
            let (_, bytes) = item?;
            out.push(serde_json::from_slice::<Run>(&bytes)?);
        }
        // sled iterates keys in lexicographic (== numeric, big-endian) order.
        Ok(out)
    }

    pub fn get_analytics(&self, agent_id: &str, window: AnalyticsWindow, now_ms: i64) -> StoreResult<Analytics> {
        let schedule_id = Schedule::schedule_id_for(agent_id);
        let cutoff = now_ms - window.millis();
        let runs = self.runs_for_schedule(&schedule_id)?;
        let mut analytics = Analytics::default();
        let mut total_duration = 0i64;
        for run in runs.iter().filter(|r| r.started_at_ms >= cutoff) {
            analytics.total_runs += 1;
            total_duration += run.duration_ms;
            match run.status {
                RunStatus::Ok => analytics.ok_runs += 1,
                RunStatus::Error => analytics.error_runs += 1,
                RunStatus::Skipped => analytics.skipped_runs += 1,
            }
        }
        if analytics.total_runs > 0 {
            analytics.avg_duration_ms = total_duration as f64 / analytics.total_runs as f64;
        }
        Ok(analytics)
    }

    // ---- signals ----

    pub fn add_signal(&self, signal: &Signal) -> StoreResult<()> {
        let mut key = signal.schedule_id.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(signal.signal_id.as_bytes());
        let bytes = serde_json::to_vec(signal)?;
        self.signals.insert(key, bytes)?;
        self.flush()
    }

    pub fn get_pending_signals(&self, schedule_id: &str) -> StoreResult<Vec<Signal>> {
        let mut prefix = schedule_id.as_bytes().to_vec();
        prefix.push(0);
        let mut out = Vec::new();
        for item in self.signals.scan_prefix(prefix) {
            let (_, bytes) = item?;
            let signal: Signal = serde_json::from_slice(&bytes)?;
            if !signal.processed {
                out.push(signal);
            }
        }
        out.sort_by_key(|s| s.enqueued_at_ms);
        Ok(out)
    }

    pub fn mark_signals_processed(&self, schedule_id: &str) -> StoreResult<()> {
        let mut prefix = schedule_id.as_bytes().to_vec();
        prefix.push(0);
        let mut batch = sled::Batch::default();
        for item in self.signals.scan_prefix(&prefix) {
            let (key, bytes) = item?;
            let mut signal: Signal = serde_json::from_slice(&bytes)?;
            if !signal.processed {
                signal.processed = true;
                batch.insert(key, serde_json::to_vec(&signal)?);
            }
        }
        self.signals.apply_batch(batch)?;
        self.flush()
    }

    // ---- derived heartbeat state ----

    pub fn get_state(&self, agent_id: &str) -> StoreResult<HeartbeatState> {
        let schedule_id = Schedule::schedule_id_for(agent_id);
        let runs = self.runs_for_schedule(&schedule_id)?;
        let mut consecutive_failures = 0u32;
        for run in runs.iter().rev() {
            if run.status == RunStatus::Error {
                consecutive_failures += 1;
            } else {
                break;
            }
        }
        let last = runs.last();
        Ok(HeartbeatState {
            schedule_id,
            last_status: last.map(|r| r.status),
            consecutive_failures,
            last_run_at_ms: last.map(|r| r.started_at_ms),
        })
    }

    // ---- allowlist ----

    fn allowlist_key(agent_id: &str, pattern: &str) -> Vec<u8> {
        let mut key = agent_id.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(pattern.as_bytes());
        key
    }

    pub fn add_allowlist_entry(&self, entry: &AllowlistEntry) -> StoreResult<()> {
        let key = Self::allowlist_key(&entry.agent_id, &entry.pattern);
        let bytes = serde_json::to_vec(entry)?;
        self.allowlist.insert(key, bytes)?;
        self.flush()
    }

    pub fn get_allowlist(&self, agent_id: &str) -> StoreResult<Vec<AllowlistEntry>> {
        let mut prefix = agent_id.as_bytes().to_vec();
        prefix.push(0);
        let mut out = Vec::new();
        for item in self.allowlist.scan_prefix(prefix) {
            let (_, bytes) = item?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    pub fn is_allowlisted(&self, agent_id: &str, pattern: &str) -> StoreResult<bool> {
        let key = Self::allowlist_key(agent_id, pattern);
        Ok(self.allowlist.contains_key(key)?)
    }

    pub fn record_allowlist_use(&self, agent_id: &str, pattern: &str, now_ms: i64) -> StoreResult<()> {
        let key = Self::allowlist_key(agent_id, pattern);
        if let Some(bytes) = self.allowlist.get(&key)? {
            let mut entry: AllowlistEntry = serde_json::from_slice(&bytes)?;
            entry.use_count += 1;
            entry.last_used_at_ms = now_ms;
            self.allowlist.insert(key, serde_json::to_vec(&entry)?)?;
            self.flush()?;
        }
        Ok(())
    }

    pub fn remove_allowlist_entry(&self, agent_id: &str, pattern: &str) -> StoreResult<bool> {
        let key = Self::allowlist_key(agent_id, pattern);
        let removed = self.allowlist.remove(key)?.is_some();
        self.flush()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schedule(agent_id: &str, next_run_at_ms: i64) -> Schedule {
        Schedule {
            schedule_id: Schedule::schedule_id_for(agent_id),
            agent_id: agent_id.to_string(),
            state: ScheduleState::Active,
            interval_ms: 1000,
            next_run_at_ms,
            active_hours: None,
            visibility: Visibility::default(),
            created_at_ms: 0,
        }
    }

    #[test]
    fn create_and_get_schedule_round_trips() {
        let store = DurableStore::open_temp().unwrap();
        let schedule = sample_schedule("agent-1", 1000);
        store.create_schedule(&schedule).unwrap();
        let fetched = store.get_schedule("agent-1").unwrap().unwrap();
        assert_eq!(fetched.schedule_id, "heartbeat-agent-1");
        assert_eq!(fetched.next_run_at_ms, 1000);
    }

    #[test]
    fn due_schedules_respects_window_and_state() {
        let store = DurableStore::open_temp().unwrap();
        store.create_schedule(&sample_schedule("due", 500)).unwrap();
        let mut paused = sample_schedule("paused", 500);
        paused.state = ScheduleState::Paused;
        store.create_schedule(&paused).unwrap();
        store.create_schedule(&sample_schedule("far", 100_000)).unwrap();

        let due = store.get_due_schedules(0, 1000).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].agent_id, "due");
    }

    #[test]
    fn runs_are_append_only_and_drive_consecutive_failures() {
        let store = DurableStore::open_temp().unwrap();
        let schedule_id = Schedule::schedule_id_for("agent-1");
        for (i, status) in [RunStatus::Ok, RunStatus::Error, RunStatus::Error].into_iter().enumerate() {
            store
                .record_run(&Run {
                    run_id: format!("run-{i}"),
                    schedule_id: schedule_id.clone(),
                    agent_id: "agent-1".into(),
                    status,
                    started_at_ms: i as i64 * 100,
                    completed_at_ms: i as i64 * 100 + 10,
                    duration_ms: 10,
                    message: None,
                    channel: None,
                    account_id: None,
                    error: None,
                })
                .unwrap();
        }
        let state = store.get_state("agent-1").unwrap();
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_status, Some(RunStatus::Error));
    }

    #[test]
    fn analytics_windows_filter_by_start_time() {
        let store = DurableStore::open_temp().unwrap();
        let schedule_id = Schedule::schedule_id_for("agent-1");
        store
            .record_run(&Run {
                run_id: "old".into(),
                schedule_id: schedule_id.clone(),
                agent_id: "agent-1".into(),
                status: RunStatus::Ok,
                started_at_ms: 0,
                completed_at_ms: 10,
                duration_ms: 10,
                message: None,
                channel: None,
                account_id: None,
                error: None,
            })
            .unwrap();
        store
            .record_run(&Run {
                run_id: "recent".into(),
                schedule_id,
                agent_id: "agent-1".into(),
                status: RunStatus::Ok,
                started_at_ms: 3_600_000 - 10,
                completed_at_ms: 3_600_000,
                duration_ms: 10,
                message: None,
                channel: None,
                account_id: None,
                error: None,
            })
            .unwrap();

        let analytics = store
            .get_analytics("agent-1", AnalyticsWindow::OneHour, 3_600_000)
            .unwrap();
        assert_eq!(analytics.total_runs, 1);
    }

    #[test]
    fn signals_are_consumed_at_most_once() {
        let store = DurableStore::open_temp().unwrap();
        let schedule_id = Schedule::schedule_id_for("agent-1");
        store
            .add_signal(&Signal {
                signal_id: "s1".into(),
                schedule_id: schedule_id.clone(),
                kind: SignalKind::Pause,
                reason: Some("testing".into()),
                enqueued_at_ms: 0,
                processed: false,
            })
            .unwrap();
        assert_eq!(store.get_pending_signals(&schedule_id).unwrap().len(), 1);
        store.mark_signals_processed(&schedule_id).unwrap();
        assert_eq!(store.get_pending_signals(&schedule_id).unwrap().len(), 0);
    }

    #[test]
    fn allowlist_tracks_use_count() {
        let store = DurableStore::open_temp().unwrap();
        store
            .add_allowlist_entry(&AllowlistEntry {
                agent_id: "agent-1".into(),
                pattern: "/usr/bin/npm".into(),
                added_at_ms: 0,
                last_used_at_ms: 0,
                use_count: 0,
            })
            .unwrap();
        assert!(store.is_allowlisted("agent-1", "/usr/bin/npm").unwrap());
        store.record_allowlist_use("agent-1", "/usr/bin/npm", 100).unwrap();
        let entries = store.get_allowlist("agent-1").unwrap();
        assert_eq!(entries[0].use_count, 1);
        assert_eq!(entries[0].last_used_at_ms, 100);
    }
}
