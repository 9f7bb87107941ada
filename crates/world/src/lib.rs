//! Wires every subsystem behind one explicit dependency graph instead of
//! module-level singletons: a single [`World`] owns the clock, the
//! timing wheel, the durable store, the policy engine, the audit log,
//! the process runner, the priority queue / circuit breaker / resource
//! monitor / exec scheduler, the approval workflow, the heartbeat
//! scheduler, and the retry limiter.
//!
//! Production code builds a `World` once at startup. Tests build a
//! fresh `World` per test with [`openclaw_clock::mock_clock`] so timer
//! behavior is deterministic and never touches wall-clock time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use openclaw_approval::{ApprovalGateway, ApprovalWorkflow};
use openclaw_audit::AuditLog;
use openclaw_breaker::{BreakerConfig, CircuitBreaker};
use openclaw_clock::SharedClock;
use openclaw_heartbeat::{HeartbeatCallback, HeartbeatScheduler};
use openclaw_policy::{PolicyConfig, PolicyEngine};
use openclaw_process::ProcessRunner;
use openclaw_queue::{PriorityQueue, QueueConfig};
use openclaw_resource::{ResourceConfig, ResourceMonitor, SystemReader};
use openclaw_retry::RetryLimiter;
use openclaw_scheduler::{ExecPayload, ExecScheduler, SchedulerConfig};
use openclaw_store::DurableStore;
use openclaw_timewheel::TimingWheel;
use parking_lot::Mutex;

/// Parameters accepted by [`NodeProxy::invoke`], mirroring the
/// `node.invoke` RPC payload used when `host = node`.
#[derive(Debug, Clone)]
pub struct NodeInvokeParams {
    pub command: Vec<String>,
    pub raw_command: String,
    pub cwd: String,
    pub env: Option<HashMap<String, String>>,
    pub timeout_ms: Option<u64>,
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
    pub approved: bool,
    pub approval_decision: Option<String>,
    pub run_id: Option<String>,
}

/// Result of a `node.invoke` call. `files` carries base64-encoded
/// payloads for cross-host transfer, per the wire format.
#[derive(Debug, Clone)]
pub struct NodeInvokeResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
    pub error: Option<String>,
    pub files: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct NodeInvokeError {
    pub message: String,
}

impl std::fmt::Display for NodeInvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NodeInvokeError {}

/// The `host = node` executor: an RPC-like bridge to a remote node that
/// shares the outward contract of the local Process Runner.
#[async_trait]
pub trait NodeProxy: Send + Sync {
    async fn invoke(
        &self,
        node_id: &str,
        params: NodeInvokeParams,
        idempotency_key: &str,
    ) -> Result<NodeInvokeResult, NodeInvokeError>;
}

/// In-memory `NodeProxy` double: returns canned responses keyed by
/// `idempotency_key`, falling back to a configurable default, and
/// records every call it received for test assertions.
pub struct InMemoryNodeProxy {
    responses: Mutex<HashMap<String, NodeInvokeResult>>,
    default_response: NodeInvokeResult,
    calls: Mutex<Vec<(String, NodeInvokeParams)>>,
}

impl InMemoryNodeProxy {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            default_response: NodeInvokeResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                success: true,
                error: None,
                files: None,
            },
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn stub(&self, idempotency_key: impl Into<String>, response: NodeInvokeResult) {
        self.responses.lock().insert(idempotency_key.into(), response);
    }

    pub fn calls(&self) -> Vec<(String, NodeInvokeParams)> {
        self.calls.lock().clone()
    }
}

impl Default for InMemoryNodeProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeProxy for InMemoryNodeProxy {
    async fn invoke(
        &self,
        node_id: &str,
        params: NodeInvokeParams,
        idempotency_key: &str,
    ) -> Result<NodeInvokeResult, NodeInvokeError> {
        let _ = node_id;
        let response = self
            .responses
            .lock()
            .get(idempotency_key)
            .cloned()
            .unwrap_or_else(|| self.default_response.clone());
        self.calls.lock().push((idempotency_key.to_string(), params));
        Ok(response)
    }
}

/// `ApprovalGateway` double that logs instead of reaching a human; a
/// decision is only ever produced by an explicit `submit_decision`
/// call, so tests compose it with [`ApprovalWorkflow`] directly.
pub struct LoggingApprovalGateway;

#[async_trait]
impl ApprovalGateway for LoggingApprovalGateway {
    async fn request_approval(&self, request: openclaw_approval::ApprovalRequest) {
        tracing::info!(request_id = %request.request_id, command = %request.command, "approval requested");
    }

    async fn notify_running(&self, request_id: &str) {
        tracing::info!(request_id, "command still running, awaiting approval outcome");
    }

    async fn notify_outcome(&self, request_id: &str, outcome: openclaw_approval::ApprovalOutcome) {
        tracing::info!(request_id, outcome = ?outcome, "approval resolved");
    }
}

/// `HeartbeatCallback` double that always succeeds without doing work.
pub struct NoopHeartbeatCallback;

#[async_trait]
impl HeartbeatCallback for NoopHeartbeatCallback {
    async fn execute(&self, _agent_id: &str) -> Result<Option<String>, String> {
        Ok(None)
    }
}

#[cfg(target_os = "linux")]
fn default_system_reader() -> Arc<dyn SystemReader> {
    Arc::new(openclaw_resource::linux::LinuxSystemReader)
}

#[cfg(target_os = "macos")]
fn default_system_reader() -> Arc<dyn SystemReader> {
    Arc::new(openclaw_resource::macos::MacosSystemReader)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn default_system_reader() -> Arc<dyn SystemReader> {
    Arc::new(openclaw_resource::fallback::FallbackSystemReader)
}

/// Configuration for assembling a [`World`]. `store_path` / `audit_path`
/// of `None` fall back to ephemeral, in-memory-backed storage suitable
/// for tests.
pub struct WorldConfig {
    pub store_path: Option<PathBuf>,
    pub audit_path: PathBuf,
    pub policy: PolicyConfig,
    pub queue: QueueConfig,
    pub breaker: BreakerConfig,
    pub resource: ResourceConfig,
    pub scheduler: SchedulerConfig,
    pub system_reader: Option<Arc<dyn SystemReader>>,
}

impl WorldConfig {
    pub fn with_audit_path(audit_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: None,
            audit_path: audit_path.into(),
            policy: PolicyConfig {
                path_dirs: default_path_dirs(),
                denied_hosts: Vec::new(),
                allowed_hosts: None,
            },
            queue: QueueConfig::default(),
            breaker: BreakerConfig::default(),
            resource: ResourceConfig::default(),
            scheduler: SchedulerConfig::default(),
            system_reader: None,
        }
    }
}

fn default_path_dirs() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default()
}

/// The assembled control plane: every subsystem shares one clock and
/// one timing wheel, so a test driving a single `MockClock` advances
/// heartbeats, retries, approval timeouts, and circuit-breaker backoff
/// in lockstep.
pub struct World {
    pub clock: SharedClock,
    pub wheel: Arc<TimingWheel>,
    pub store: Arc<DurableStore>,
    pub policy: Arc<PolicyEngine>,
    pub audit: Arc<AuditLog>,
    pub process_runner: Arc<ProcessRunner>,
    pub queue: Arc<PriorityQueue<ExecPayload>>,
    pub breaker: Arc<CircuitBreaker>,
    pub resource_monitor: Arc<ResourceMonitor>,
    pub exec_scheduler: Arc<ExecScheduler>,
    pub approval: Arc<ApprovalWorkflow>,
    pub heartbeat: Arc<HeartbeatScheduler>,
    pub retry: Arc<RetryLimiter>,
    pub node_proxy: Arc<dyn NodeProxy>,
}

impl World {
    pub fn new(
        config: WorldConfig,
        clock: SharedClock,
        approval_gateway: Arc<dyn ApprovalGateway>,
        heartbeat_callback: Arc<dyn HeartbeatCallback>,
        node_proxy: Arc<dyn NodeProxy>,
    ) -> anyhow::Result<Arc<Self>> {
        let wheel = Arc::new(TimingWheel::new(clock.clone()));
        wheel.start();

        let store = Arc::new(match &config.store_path {
            Some(path) => DurableStore::open(path)?,
            None => DurableStore::open_temp()?,
        });

        let policy = Arc::new(PolicyEngine::new(config.policy));
        let audit = Arc::new(AuditLog::open(&config.audit_path)?);
        let process_runner = Arc::new(ProcessRunner::new(clock.clone(), wheel.clone()));

        let queue = PriorityQueue::new(config.queue, clock.clone(), wheel.clone());
        let breaker = Arc::new(CircuitBreaker::new("exec", config.breaker, clock.clone()));
        let reader = config.system_reader.unwrap_or_else(default_system_reader);
        let resource_monitor = Arc::new(ResourceMonitor::new(reader, config.resource, clock.clone()));
        let exec_scheduler = ExecScheduler::new(
            config.scheduler,
            clock.clone(),
            queue.clone(),
            breaker.clone(),
            resource_monitor.clone(),
        );

        let approval = Arc::new(ApprovalWorkflow::new(
            clock.clone(),
            wheel.clone(),
            approval_gateway,
        ));

        let retry = RetryLimiter::new(clock.clone());

        let heartbeat = HeartbeatScheduler::new(
            store.clone(),
            clock.clone(),
            wheel.clone(),
            heartbeat_callback,
        );

        Ok(Arc::new(Self {
            clock,
            wheel,
            store,
            policy,
            audit,
            process_runner,
            queue,
            breaker,
            resource_monitor,
            exec_scheduler,
            approval,
            heartbeat,
            retry,
            node_proxy,
        }))
    }

    /// Builds a world with ephemeral storage and the in-memory test
    /// doubles, for tests that only need deterministic plumbing rather
    /// than a real gateway / callback / node proxy.
    pub fn test_world(clock: SharedClock, audit_path: PathBuf) -> anyhow::Result<Arc<Self>> {
        Self::new(
            WorldConfig::with_audit_path(audit_path),
            clock,
            Arc::new(LoggingApprovalGateway),
            Arc::new(NoopHeartbeatCallback),
            Arc::new(InMemoryNodeProxy::new()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_clock::mock_clock;
    use openclaw_store::ScheduleState;
    use tempfile::tempdir;

    #[test]
    fn fresh_world_wires_every_subsystem() {
        let dir = tempdir().unwrap();
        let clock = mock_clock();
        let world = World::test_world(clock, dir.path().join("audit.jsonl")).unwrap();

        assert_eq!(world.exec_scheduler.running_count(), 0);
        assert!(world.breaker.can_execute().allowed);
        assert!(world.resource_monitor.can_start_process().allowed);
        assert_eq!(world.queue.get_size(), 0);
    }

    #[tokio::test]
    async fn heartbeat_registered_through_world_store_becomes_due() {
        let dir = tempdir().unwrap();
        let clock = mock_clock();
        let world = World::test_world(clock.clone(), dir.path().join("audit.jsonl")).unwrap();

        world.heartbeat.register_agent("agent-1", 60_000).unwrap();
        let schedule = world
            .store
            .get_schedule("agent-1")
            .unwrap()
            .expect("schedule persisted");
        assert_eq!(schedule.state, ScheduleState::Active);
        assert_eq!(schedule.agent_id, "agent-1");
    }

    #[tokio::test]
    async fn node_proxy_double_records_invocations() {
        let dir = tempdir().unwrap();
        let clock = mock_clock();
        let world = World::test_world(clock, dir.path().join("audit.jsonl")).unwrap();

        let params = NodeInvokeParams {
            command: vec!["echo".to_string(), "hi".to_string()],
            raw_command: "echo hi".to_string(),
            cwd: "/tmp".to_string(),
            env: None,
            timeout_ms: Some(5_000),
            agent_id: Some("agent-1".to_string()),
            session_key: None,
            approved: true,
            approval_decision: Some("allow-once".to_string()),
            run_id: Some("run-1".to_string()),
        };
        let result = world
            .node_proxy
            .invoke("node-a", params, "idem-1")
            .await
            .unwrap();
        assert!(result.success);
    }

    #[test]
    fn audit_log_opens_under_world_assembly() {
        let dir = tempdir().unwrap();
        let clock = mock_clock();
        let world = World::test_world(clock, dir.path().join("audit.jsonl")).unwrap();
        let report = world.audit.verify().unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 0);
    }
}
