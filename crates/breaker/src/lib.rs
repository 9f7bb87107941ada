//! Circuit breaker with a rolling time-window failure rate, a half-open
//! probe budget, and exponential backoff on the open-state timeout that
//! stops growing after five consecutive trips.
//!
//! State transitions never read the wall clock directly; they take the
//! current time from an `openclaw_clock::Clock` so tests can drive the
//! whole lifecycle deterministically with a `MockClock`.

use std::collections::VecDeque;

use openclaw_clock::SharedClock;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Width of the rolling sample window.
    pub window_ms: u64,
    /// Minimum attempts in the window before the trip rule can fire.
    pub min_attempts: usize,
    /// Error rate above which a trip is considered, once `min_attempts`
    /// (or 10% of window samples, whichever is larger) have failed.
    pub error_rate_threshold: f64,
    /// Base backoff for the first trip.
    pub reset_timeout_ms: u64,
    /// Ceiling on backoff regardless of trip count.
    pub max_backoff_ms: u64,
    /// Probe calls admitted while half-open.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            min_attempts: 10,
            error_rate_threshold: 0.5,
            reset_timeout_ms: 1_000,
            max_backoff_ms: 300_000,
            half_open_max: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

struct Sample {
    at_ms: i64,
    failed: bool,
}

struct State {
    state: CircuitState,
    window: VecDeque<Sample>,
    consecutive_trips: u32,
    opened_at_ms: i64,
    half_open_inflight: u32,
    half_open_failed: bool,
    half_open_completed: u32,
}

impl State {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            consecutive_trips: 0,
            opened_at_ms: 0,
            half_open_inflight: 0,
            half_open_failed: false,
            half_open_completed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_trips: u32,
    pub window_failures: usize,
    pub window_len: usize,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(State::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let mut s = self.state.lock();
        let now = self.clock.now_ms();
        prune_window(&mut s.window, now, self.config.window_ms);
        BreakerStats {
            state: s.state,
            consecutive_trips: s.consecutive_trips,
            window_failures: s.window.iter().filter(|s| s.failed).count(),
            window_len: s.window.len(),
        }
    }

    fn backoff_ms(&self, consecutive_trips: u32) -> u64 {
        // Exponent capped at 5 trips: growth halts, not the trip counter.
        let exponent = consecutive_trips.min(5).max(1) - 1;
        let scaled = self
            .config
            .reset_timeout_ms
            .saturating_mul(1u64 << exponent.min(32));
        scaled.min(self.config.max_backoff_ms)
    }

    /// Pure query: does not mutate half-open probe bookkeeping, matching
    /// a caller that wants to inspect admission without consuming a slot.
    pub fn can_execute(&self) -> AdmissionDecision {
        let now = self.clock.now_ms();
        let s = self.state.lock();
        match s.state {
            CircuitState::Closed => AdmissionDecision {
                allowed: true,
                reason: None,
            },
            CircuitState::HalfOpen => {
                if s.half_open_inflight < self.config.half_open_max {
                    AdmissionDecision {
                        allowed: true,
                        reason: None,
                    }
                } else {
                    AdmissionDecision {
                        allowed: false,
                        reason: Some("half-open probe budget exhausted".to_string()),
                    }
                }
            }
            CircuitState::Open => {
                let elapsed = now - s.opened_at_ms;
                if elapsed >= self.backoff_ms(s.consecutive_trips) as i64 {
                    AdmissionDecision {
                        allowed: true,
                        reason: None,
                    }
                } else {
                    AdmissionDecision {
                        allowed: false,
                        reason: Some("circuit open".to_string()),
                    }
                }
            }
        }
    }

    /// Reserves a probe slot, transitioning Open -> HalfOpen once backoff
    /// has elapsed. Mutating counterpart to `can_execute`.
    fn admit(&self) -> bool {
        let now = self.clock.now_ms();
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = now - s.opened_at_ms;
                if elapsed >= self.backoff_ms(s.consecutive_trips) as i64 {
                    s.state = CircuitState::HalfOpen;
                    s.half_open_inflight = 1;
                    s.half_open_failed = false;
                    s.half_open_completed = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if s.half_open_inflight < self.config.half_open_max {
                    s.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let now = self.clock.now_ms();
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => {
                prune_window(&mut s.window, now, self.config.window_ms);
                s.window.push_back(Sample {
                    at_ms: now,
                    failed: false,
                });
            }
            CircuitState::HalfOpen => {
                s.half_open_inflight = s.half_open_inflight.saturating_sub(1);
                s.half_open_completed += 1;
                if !s.half_open_failed && s.half_open_completed >= self.config.half_open_max {
                    tracing::info!(breaker = %self.name, "circuit closing after successful probes");
                    s.state = CircuitState::Closed;
                    s.consecutive_trips = 0;
                    s.window.clear();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => {
                prune_window(&mut s.window, now, self.config.window_ms);
                s.window.push_back(Sample {
                    at_ms: now,
                    failed: true,
                });
                let total = s.window.len();
                let failures = s.window.iter().filter(|s| s.failed).count();
                let threshold = self
                    .config
                    .min_attempts
                    .max((total as f64 * 0.1).ceil() as usize);
                let error_rate = failures as f64 / total as f64;
                if failures >= threshold && error_rate > self.config.error_rate_threshold {
                    trip(&mut s, now, &self.name);
                }
            }
            CircuitState::HalfOpen => {
                s.half_open_inflight = s.half_open_inflight.saturating_sub(1);
                s.half_open_failed = true;
                trip(&mut s, now, &self.name);
            }
            CircuitState::Open => {}
        }
    }

    /// Executes `f` under breaker protection.
    pub fn call<F, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.admit() {
            return Err(BreakerError::Open);
        }
        match f() {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub async fn call_async<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            return Err(BreakerError::Open);
        }
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = State::new();
    }
}

fn prune_window(window: &mut VecDeque<Sample>, now_ms: i64, window_ms: u64) {
    let cutoff = now_ms - window_ms as i64;
    while let Some(front) = window.front() {
        if front.at_ms < cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn trip(s: &mut State, now_ms: i64, name: &str) {
    s.state = CircuitState::Open;
    s.consecutive_trips = s.consecutive_trips.saturating_add(1);
    s.opened_at_ms = now_ms;
    s.half_open_inflight = 0;
    s.half_open_failed = false;
    s.half_open_completed = 0;
    tracing::warn!(breaker = %name, trips = s.consecutive_trips, "circuit breaker tripped open");
}
