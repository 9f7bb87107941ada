//! Approval workflow: dispatches a pending command to an approval
//! gateway, races the human (or automated) decision against a
//! timing-wheel timeout, and emits a running-notice if the command is
//! still executing once `approval_running_notice_ms` has elapsed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use openclaw_clock::SharedClock;
use openclaw_timewheel::TimingWheel;
use parking_lot::Mutex;

pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_RUNNING_NOTICE_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskFallback {
    Deny,
    AllowOnce,
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub command: String,
    pub agent_id: Option<String>,
    pub risk_summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Allowed { persist_allowlist: bool },
    Denied,
    TimedOut,
}

/// The external surface the workflow dispatches to. A real
/// implementation forwards the request to a human reviewer (chat
/// message, CLI prompt); tests use an in-memory double.
#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest);
    async fn notify_running(&self, request_id: &str);
    async fn notify_outcome(&self, request_id: &str, outcome: ApprovalOutcome);
}

struct PendingApproval {
    decision: Option<ApprovalDecision>,
    waker: Option<std::task::Waker>,
}

pub struct ApprovalWorkflow {
    clock: SharedClock,
    wheel: Arc<TimingWheel>,
    gateway: Arc<dyn ApprovalGateway>,
    timeout_ms: u64,
    running_notice_ms: u64,
    ask_fallback: AskFallback,
    pending: Mutex<HashMap<String, PendingApproval>>,
}

impl ApprovalWorkflow {
    pub fn new(
        clock: SharedClock,
        wheel: Arc<TimingWheel>,
        gateway: Arc<dyn ApprovalGateway>,
    ) -> Self {
        Self {
            clock,
            wheel,
            gateway,
            timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
            running_notice_ms: DEFAULT_RUNNING_NOTICE_MS,
            ask_fallback: AskFallback::Deny,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_running_notice_ms(mut self, ms: u64) -> Self {
        self.running_notice_ms = ms;
        self
    }

    pub fn with_ask_fallback(mut self, fallback: AskFallback) -> Self {
        self.ask_fallback = fallback;
        self
    }

    /// Submits a decision for a pending request. No-op if the request
    /// already timed out or isn't known.
    pub fn submit_decision(&self, request_id: &str, decision: ApprovalDecision) {
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(request_id) {
            entry.decision = Some(decision);
            if let Some(waker) = entry.waker.take() {
                waker.wake();
            }
        }
    }

    /// Dispatches the request and waits for a decision, a timeout, or
    /// cancellation of the underlying process. Schedules a
    /// running-notice if the wait outlasts `running_notice_ms`.
    pub async fn request_and_wait(
        self: &Arc<Self>,
        request: ApprovalRequest,
    ) -> ApprovalOutcome {
        let request_id = request.request_id.clone();
        self.pending.lock().insert(
            request_id.clone(),
            PendingApproval {
                decision: None,
                waker: None,
            },
        );
        self.gateway.request_approval(request).await;

        let notice_id = format!("approval-notice-{request_id}");
        let gateway = self.gateway.clone();
        let notice_request_id = request_id.clone();
        self.wheel.schedule_timeout(&notice_id, self.running_notice_ms, {
            let gateway = gateway.clone();
            let request_id = notice_request_id.clone();
            Arc::new(move || {
                let gateway = gateway.clone();
                let request_id = request_id.clone();
                tokio::spawn(async move {
                    gateway.notify_running(&request_id).await;
                });
            })
        });

        let decision_future = DecisionFuture {
            workflow: self.clone(),
            request_id: request_id.clone(),
        };

        let outcome = tokio::select! {
            decision = decision_future => {
                self.wheel.cancel_timeout(&notice_id);
                match decision {
                    ApprovalDecision::AllowOnce => ApprovalOutcome::Allowed { persist_allowlist: false },
                    ApprovalDecision::AllowAlways => ApprovalOutcome::Allowed { persist_allowlist: true },
                    ApprovalDecision::Deny => ApprovalOutcome::Denied,
                }
            }
            _ = self.clock.sleep(self.timeout_ms) => {
                self.wheel.cancel_timeout(&notice_id);
                self.pending.lock().remove(&request_id);
                tracing::warn!(request_id = %request_id, "approval request timed out");
                match self.ask_fallback {
                    AskFallback::Deny => ApprovalOutcome::TimedOut,
                    AskFallback::AllowOnce => ApprovalOutcome::Allowed { persist_allowlist: false },
                }
            }
        };

        self.pending.lock().remove(&request_id);
        tracing::debug!(request_id = %request_id, outcome = ?outcome, "approval request resolved");
        self.gateway.notify_outcome(&request_id, outcome).await;
        outcome
    }
}

struct DecisionFuture {
    workflow: Arc<ApprovalWorkflow>,
    request_id: String,
}

impl std::future::Future for DecisionFuture {
    type Output = ApprovalDecision;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let mut pending = self.workflow.pending.lock();
        match pending.get_mut(&self.request_id) {
            Some(entry) => {
                if let Some(decision) = entry.decision {
                    std::task::Poll::Ready(decision)
                } else {
                    entry.waker = Some(cx.waker().clone());
                    std::task::Poll::Pending
                }
            }
            None => std::task::Poll::Ready(ApprovalDecision::Deny),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_clock::mock_clock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingGateway {
        running_notices: Arc<AtomicUsize>,
        outcomes: Mutex<Vec<(String, ApprovalOutcome)>>,
    }

    impl RecordingGateway {
        fn new() -> Self {
            Self {
                running_notices: Arc::new(AtomicUsize::new(0)),
                outcomes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ApprovalGateway for RecordingGateway {
        async fn request_approval(&self, _request: ApprovalRequest) {}
        async fn notify_running(&self, _request_id: &str) {
            self.running_notices.fetch_add(1, Ordering::Relaxed);
        }
        async fn notify_outcome(&self, request_id: &str, outcome: ApprovalOutcome) {
            self.outcomes.lock().push((request_id.to_string(), outcome));
        }
    }

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest {
            request_id: id.to_string(),
            command: "rm -rf /tmp/scratch".to_string(),
            agent_id: Some("agent-1".to_string()),
            risk_summary: "destructive filesystem operation".to_string(),
        }
    }

    #[tokio::test]
    async fn allow_once_resolves_without_persisting_allowlist() {
        let clock = mock_clock();
        let wheel = Arc::new(TimingWheel::new(clock.clone()));
        wheel.start();
        let gateway = Arc::new(RecordingGateway::new());
        let workflow = Arc::new(ApprovalWorkflow::new(clock.clone(), wheel, gateway));

        let w = workflow.clone();
        let handle = tokio::spawn(async move { w.request_and_wait(request("r1")).await });
        tokio::task::yield_now().await;
        workflow.submit_decision("r1", ApprovalDecision::AllowOnce);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::Allowed { persist_allowlist: false });
    }

    #[tokio::test]
    async fn allow_always_requests_allowlist_persistence() {
        let clock = mock_clock();
        let wheel = Arc::new(TimingWheel::new(clock.clone()));
        wheel.start();
        let gateway = Arc::new(RecordingGateway::new());
        let workflow = Arc::new(ApprovalWorkflow::new(clock.clone(), wheel, gateway));

        let w = workflow.clone();
        let handle = tokio::spawn(async move { w.request_and_wait(request("r2")).await });
        tokio::task::yield_now().await;
        workflow.submit_decision("r2", ApprovalDecision::AllowAlways);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::Allowed { persist_allowlist: true });
    }

    #[tokio::test]
    async fn deny_resolves_denied() {
        let clock = mock_clock();
        let wheel = Arc::new(TimingWheel::new(clock.clone()));
        wheel.start();
        let gateway = Arc::new(RecordingGateway::new());
        let workflow = Arc::new(ApprovalWorkflow::new(clock.clone(), wheel, gateway));

        let w = workflow.clone();
        let handle = tokio::spawn(async move { w.request_and_wait(request("r3")).await });
        tokio::task::yield_now().await;
        workflow.submit_decision("r3", ApprovalDecision::Deny);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::Denied);
    }

    #[tokio::test]
    async fn timeout_with_deny_fallback_produces_timed_out() {
        let clock = mock_clock();
        let wheel = Arc::new(TimingWheel::new(clock.clone()));
        wheel.start();
        let gateway = Arc::new(RecordingGateway::new());
        let workflow = Arc::new(
            ApprovalWorkflow::new(clock.clone(), wheel, gateway).with_timeout_ms(1_000),
        );

        let w = workflow.clone();
        let handle = tokio::spawn(async move { w.request_and_wait(request("r4")).await });
        tokio::task::yield_now().await;
        clock.advance(1_000);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::TimedOut);
    }

    #[tokio::test]
    async fn timeout_with_allow_once_fallback_allows() {
        let clock = mock_clock();
        let wheel = Arc::new(TimingWheel::new(clock.clone()));
        wheel.start();
        let gateway = Arc::new(RecordingGateway::new());
        let workflow = Arc::new(
            ApprovalWorkflow::new(clock.clone(), wheel, gateway)
                .with_timeout_ms(1_000)
                .with_ask_fallback(AskFallback::AllowOnce),
        );

        let w = workflow.clone();
        let handle = tokio::spawn(async move { w.request_and_wait(request("r5")).await });
        tokio::task::yield_now().await;
        clock.advance(1_000);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::Allowed { persist_allowlist: false });
    }
}
