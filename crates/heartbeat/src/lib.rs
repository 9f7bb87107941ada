//! Heartbeat scheduler: drives periodic per-agent execution.
//!
//! Schedules live in the durable store; this crate only owns the
//! in-memory hydration and at-most-once-per-schedule execution
//! bookkeeping. A schedule is "hydrated" into the timing wheel when its
//! `next_run_at_ms` falls within `imminent_window_ms`, re-hydrated
//! periodically so schedules created or rescheduled between hydration
//! passes are never missed.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use openclaw_clock::SharedClock;
use openclaw_store::{
    DurableStore, Run, RunStatus, Schedule, ScheduleState, Signal, SignalKind, StoreResult,
};
use openclaw_timewheel::TimingWheel;
use parking_lot::Mutex;

pub const DEFAULT_IMMINENT_WINDOW_MS: i64 = 120_000;
pub const DEFAULT_HYDRATE_PERIOD_CAP_MS: u64 = 60_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_MS: u64 = 60_000;
pub const STOP_TIMEOUT_MS: u64 = 5_000;

#[async_trait]
pub trait HeartbeatCallback: Send + Sync {
    async fn execute(&self, agent_id: &str) -> Result<Option<String>, String>;
}

pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_BASE_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_MS,
        }
    }
}

fn retry_delay_ms(config: &RetryConfig, failures: u32) -> u64 {
    let exp = failures.saturating_sub(1).min(10);
    let scaled = config.base_delay_ms.saturating_mul(1u64 << exp);
    scaled.min(config.max_delay_ms)
}

pub struct HeartbeatScheduler {
    store: Arc<DurableStore>,
    clock: SharedClock,
    wheel: Arc<TimingWheel>,
    callback: Arc<dyn HeartbeatCallback>,
    imminent_window_ms: i64,
    retry: RetryConfig,
    in_flight: Mutex<HashSet<String>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl HeartbeatScheduler {
    pub fn new(
        store: Arc<DurableStore>,
        clock: SharedClock,
        wheel: Arc<TimingWheel>,
        callback: Arc<dyn HeartbeatCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            wheel,
            callback,
            imminent_window_ms: DEFAULT_IMMINENT_WINDOW_MS,
            retry: RetryConfig::default(),
            in_flight: Mutex::new(HashSet::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn register_agent(
        &self,
        agent_id: &str,
        interval_ms: u64,
    ) -> StoreResult<()> {
        if self.store.get_schedule(agent_id)?.is_some() {
            return Ok(());
        }
        let schedule = Schedule {
            schedule_id: Schedule::schedule_id_for(agent_id),
            agent_id: agent_id.to_string(),
            state: ScheduleState::Active,
            interval_ms,
            next_run_at_ms: self.clock.now_ms() + interval_ms as i64,
            active_hours: None,
            visibility: Default::default(),
            created_at_ms: self.clock.now_ms(),
        };
        self.store.create_schedule(&schedule)
    }

    pub fn unregister_agent(&self, agent_id: &str) -> StoreResult<()> {
        self.store.set_schedule_state(agent_id, ScheduleState::Disabled)
    }

    pub fn pause(&self, agent_id: &str) -> StoreResult<()> {
        self.store.set_schedule_state(agent_id, ScheduleState::Paused)
    }

    pub fn resume(&self, agent_id: &str) -> StoreResult<()> {
        self.store.set_schedule_state(agent_id, ScheduleState::Active)
    }

    /// Writes a `runNow` signal and arms a zero-delay wheel entry so the
    /// schedule fires on the next tick instead of waiting for a hydration
    /// pass to notice the signal.
    pub fn trigger_now(self: &Arc<Self>, agent_id: &str, reason: Option<&str>) -> StoreResult<()> {
        let schedule_id = Schedule::schedule_id_for(agent_id);
        self.store.add_signal(&Signal {
            signal_id: format!("trigger-{}", uuid::Uuid::new_v4()),
            schedule_id: schedule_id.clone(),
            kind: SignalKind::RunNow,
            reason: reason.map(str::to_string),
            enqueued_at_ms: self.clock.now_ms(),
            processed: false,
        })?;

        let this = self.clone();
        self.wheel.schedule_timeout(&schedule_id.clone(), 0, Arc::new(move || {
            let this = this.clone();
            let schedule_id = schedule_id.clone();
            tokio::spawn(async move {
                this.run_schedule(&schedule_id).await;
            });
        }));
        Ok(())
    }

    /// Hydrates every due or imminent schedule into the timing wheel.
    /// Idempotent: re-hydrating an already-armed schedule just replaces
    /// its timer with the same deadline.
    pub fn hydrate_due(self: &Arc<Self>) -> StoreResult<usize> {
        let now = self.clock.now_ms();
        let due = self.store.get_due_schedules(now, self.imminent_window_ms)?;
        let count = due.len();
        for schedule in due {
            self.arm(schedule);
        }
        Ok(count)
    }

    fn arm(self: &Arc<Self>, schedule: Schedule) {
        let delay_ms = (schedule.next_run_at_ms - self.clock.now_ms()).max(0) as u64;
        let this = self.clone();
        let schedule_id = schedule.schedule_id.clone();
        self.wheel.schedule_timeout(&schedule_id, delay_ms, {
            let this = this.clone();
            let schedule_id = schedule_id.clone();
            Arc::new(move || {
                let this = this.clone();
                let schedule_id = schedule_id.clone();
                tokio::spawn(async move {
                    this.run_schedule(&schedule_id).await;
                });
            })
        });
    }

    /// Starts the hydration lifecycle: an initial pass plus a periodic
    /// pass every `min(imminent_window_ms/2, 60_000)`ms.
    pub fn start(self: &Arc<Self>) -> StoreResult<()> {
        self.hydrate_due()?;
        let period = (self.imminent_window_ms as u64 / 2).min(DEFAULT_HYDRATE_PERIOD_CAP_MS).max(1);
        let this = self.clone();
        self.wheel.schedule_interval("heartbeat-hydration", period, {
            Arc::new(move || {
                let this = this.clone();
                tokio::spawn(async move {
                    let _ = this.hydrate_due();
                });
            })
        });
        Ok(())
    }

    fn run_schedule<'a>(
        self: &'a Arc<Self>,
        schedule_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
                return;
            }
            {
                let mut in_flight = self.in_flight.lock();
                if in_flight.contains(schedule_id) {
                    return;
                }
                in_flight.insert(schedule_id.to_string());
            }

            let result = self.execute_once(schedule_id).await;

            self.in_flight.lock().remove(schedule_id);

            if let Err(e) = result {
                tracing::warn!(schedule_id, error = %e, "heartbeat execution failed");
            }
        })
    }

    async fn execute_once(self: &Arc<Self>, schedule_id: &str) -> StoreResult<()> {
        let agent_id = match schedule_id.strip_prefix("heartbeat-") {
            Some(id) => id.to_string(),
            None => schedule_id.to_string(),
        };

        let pending = self.store.get_pending_signals(schedule_id)?;
        self.store.mark_signals_processed(schedule_id)?;
        if pending.iter().any(|s| s.kind == SignalKind::Pause) {
            self.store.set_schedule_state(&agent_id, ScheduleState::Paused)?;
            return Ok(());
        }
        let run_now_reason = pending
            .iter()
            .find(|s| s.kind == SignalKind::RunNow)
            .map(|s| format!("signal:{}", s.reason.as_deref().unwrap_or("manual")));

        let schedule = match self.store.get_schedule(&agent_id)? {
            Some(s) if s.state == ScheduleState::Active => s,
            _ => return Ok(()),
        };

        if let Some(reason) = &run_now_reason {
            tracing::debug!(schedule_id, reason, "heartbeat run triggered by signal");
        }

        let started_at = self.clock.now_ms();
        let outcome = self.callback.execute(&agent_id).await;
        let completed_at = self.clock.now_ms();

        let state = self.store.get_state(&agent_id)?;
        let (status, message, error, failures_after) = match outcome {
            Ok(message) => (RunStatus::Ok, message, None, 0),
            Err(e) => (RunStatus::Error, None, Some(e), state.consecutive_failures + 1),
        };

        self.store.record_run(&Run {
            run_id: uuid::Uuid::new_v4().to_string(),
            schedule_id: schedule_id.to_string(),
            agent_id: agent_id.clone(),
            status,
            started_at_ms: started_at,
            completed_at_ms: completed_at,
            duration_ms: completed_at - started_at,
            message,
            channel: None,
            account_id: None,
            error,
        })?;

        if status == RunStatus::Error && failures_after <= self.retry.max_retries {
            let delay = retry_delay_ms(&self.retry, failures_after);
            let retry_id = format!("{schedule_id}-retry-{failures_after}");
            let this = self.clone();
            let schedule_id_owned = schedule_id.to_string();
            self.wheel.schedule_timeout(&retry_id, delay, Arc::new(move || {
                let this = this.clone();
                let schedule_id_owned = schedule_id_owned.clone();
                tokio::spawn(async move {
                    this.run_schedule(&schedule_id_owned).await;
                });
            }));
        } else {
            let next_run = completed_at + schedule.interval_ms as i64;
            self.store.update_schedule_next_run(&agent_id, next_run)?;
            self.arm(Schedule {
                next_run_at_ms: next_run,
                ..schedule
            });
        }

        Ok(())
    }

    /// Stops accepting new work and waits (up to [`STOP_TIMEOUT_MS`])
    /// for in-flight executions to drain.
    pub async fn stop(self: &Arc<Self>) {
        self.stopped.store(true, std::sync::atomic::Ordering::Release);
        self.wheel.cancel_interval("heartbeat-hydration");
        let deadline = self.clock.now_ms() + STOP_TIMEOUT_MS as i64;
        while !self.in_flight.lock().is_empty() && self.clock.now_ms() < deadline {
            self.clock.sleep(20).await;
        }
    }
}
