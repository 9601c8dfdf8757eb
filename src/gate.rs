//! Send-time gating with an exactly-once completion guarantee.
//!
//! The host's send gate must receive one decision per send attempt. Three
//! sources race to provide it: the evaluation finishing, the evaluation
//! failing, and the budget timer. [`EvaluationSession`] owns the tagged
//! `Pending`/`Completed` state; the first delivery wins and later ones are
//! silent no-ops. Every failure path allows the send.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;

use crate::error::EvaluationError;
use crate::evaluation::{Evaluation, RecipientEvaluator};
use crate::policy::Verdict;
use crate::recipients::RecipientSource;
use crate::telemetry::{Telemetry, TelemetryRecord};

/// Decision handed to the host's send gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allow_event: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allow_event: true,
            error_message: None,
        }
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self {
            allow_event: false,
            error_message: Some(message.into()),
        }
    }

    pub fn from_verdict(verdict: &Verdict) -> Self {
        if verdict.block {
            Decision {
                allow_event: false,
                error_message: verdict.message.clone(),
            }
        } else {
            Decision::allow()
        }
    }
}

/// The host commit protocol for a send attempt.
pub trait SendGate: Send + Sync {
    fn complete(&self, decision: Decision);
}

/// A gate that forwards the decision through a oneshot channel.
pub struct ChannelGate {
    tx: Mutex<Option<oneshot::Sender<Decision>>>,
}

impl ChannelGate {
    pub fn new() -> (Self, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl SendGate for ChannelGate {
    fn complete(&self, decision: Decision) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            // receiver gone means the host stopped waiting
            let _ = tx.send(decision);
        }
    }
}

/// What produced the terminal decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletedBy {
    /// The policy ran to completion.
    Evaluation,
    /// The evaluation failed and the send was allowed.
    FailOpen,
    /// The budget elapsed first and the send was allowed.
    Timeout,
}

impl CompletedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletedBy::Evaluation => "evaluation",
            CompletedBy::FailOpen => "failOpen",
            CompletedBy::Timeout => "timeout",
        }
    }
}

enum SessionState {
    Pending { timer: Option<AbortHandle> },
    Completed { by: CompletedBy },
}

/// Completion guard for one send attempt.
pub struct EvaluationSession {
    state: Mutex<SessionState>,
    gate: Arc<dyn SendGate>,
    done: watch::Sender<Option<CompletedBy>>,
}

impl EvaluationSession {
    /// A pending session without a timer.
    pub fn new(gate: Arc<dyn SendGate>) -> Arc<Self> {
        let (done, _) = watch::channel(None);
        Arc::new(Self {
            state: Mutex::new(SessionState::Pending { timer: None }),
            gate,
            done,
        })
    }

    /// A pending session whose timer allows the send once `budget` elapses.
    /// Must be called from within a tokio runtime.
    pub fn start(gate: Arc<dyn SendGate>, budget: Duration) -> Arc<Self> {
        let session = Self::new(gate);
        let timed = Arc::clone(&session);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if timed.deliver(Decision::allow(), CompletedBy::Timeout) {
                tracing::warn!(
                    budget_ms = budget.as_millis() as u64,
                    "recipient evaluation exceeded budget, allowing send"
                );
            }
        });
        session.arm(timer.abort_handle());
        session
    }

    fn arm(&self, handle: AbortHandle) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            SessionState::Pending { timer } => *timer = Some(handle),
            // timer already fired or a decision beat us to it
            SessionState::Completed { .. } => handle.abort(),
        }
    }

    /// Deliver `decision` to the gate if no decision has been delivered yet.
    /// Returns `false` (and does nothing) when the session is already completed.
    pub fn deliver(&self, decision: Decision, by: CompletedBy) -> bool {
        let timer = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *state {
                SessionState::Completed { by: first } => {
                    tracing::debug!(first = first.as_str(), late = by.as_str(), "decision already delivered, ignoring");
                    return false;
                }
                SessionState::Pending { timer } => {
                    let timer = timer.take();
                    *state = SessionState::Completed { by };
                    timer
                }
            }
        };
        if by != CompletedBy::Timeout {
            if let Some(timer) = timer {
                timer.abort();
            }
        }
        self.gate.complete(decision);
        self.done.send_replace(Some(by));
        true
    }

    pub fn completed_by(&self) -> Option<CompletedBy> {
        match &*self.state.lock().unwrap_or_else(|e| e.into_inner()) {
            SessionState::Pending { .. } => None,
            SessionState::Completed { by } => Some(*by),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.completed_by().is_none()
    }

    /// Resolves once a decision has been delivered.
    pub async fn closed(&self) -> Option<CompletedBy> {
        let mut rx = self.done.subscribe();
        let by = rx.wait_for(|by| by.is_some()).await.ok().and_then(|by| *by);
        by
    }
}

/// Summary of one gated send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub completed_by: CompletedBy,
    /// The policy verdict, when the evaluation finished in time.
    pub verdict: Option<Verdict>,
    /// A block was turned into an allow by audit-only mode.
    pub audit_suppressed: bool,
}

/// Evaluates recipients on a send attempt and completes the host gate.
pub struct GatingEvaluator {
    evaluator: RecipientEvaluator,
    timeout: Duration,
    audit_only: bool,
    telemetry: Arc<dyn Telemetry>,
}

impl GatingEvaluator {
    pub fn new(
        evaluator: RecipientEvaluator,
        timeout: Duration,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            evaluator,
            timeout,
            audit_only: false,
            telemetry,
        }
    }

    /// Evaluate and log would-be blocks but always allow the send.
    pub fn with_audit_only(mut self, audit_only: bool) -> Self {
        self.audit_only = audit_only;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn on_message_send(
        &self,
        source: Arc<dyn RecipientSource>,
        gate: Arc<dyn SendGate>,
    ) -> GateReport {
        let started = Instant::now();
        let session = EvaluationSession::start(gate, self.timeout);

        let evaluator = self.evaluator.clone();
        let mut task = tokio::spawn(async move { evaluator.evaluate(source.as_ref()).await });

        let report = tokio::select! {
            joined = &mut task => {
                let outcome = joined
                    .map_err(|e| EvaluationError::Aborted(e.to_string()))
                    .and_then(|r| r);
                self.complete(&session, outcome)
            }
            by = session.closed() => {
                task.abort();
                GateReport {
                    completed_by: by.unwrap_or(CompletedBy::Timeout),
                    verdict: None,
                    audit_suppressed: false,
                }
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        if report.completed_by == CompletedBy::Timeout {
            self.telemetry.track(
                TelemetryRecord::event("SendTimedOut")
                    .with_measurement("budgetMs", self.timeout.as_millis() as f64),
            );
        }
        self.telemetry
            .track(TelemetryRecord::metric("EvaluationLatencyMs", latency_ms as f64).with_property("path", "send"));
        report
    }

    fn complete(
        &self,
        session: &EvaluationSession,
        outcome: Result<Evaluation, EvaluationError>,
    ) -> GateReport {
        match outcome {
            Ok(Evaluation { state, verdict }) => {
                let suppress = verdict.block && self.audit_only;
                let decision = if suppress {
                    Decision::allow()
                } else {
                    Decision::from_verdict(&verdict)
                };
                let allow = decision.allow_event;
                let delivered = session.deliver(decision, CompletedBy::Evaluation);
                if delivered && suppress {
                    tracing::info!(
                        warning = verdict.warning.map(|w| w.code()).unwrap_or(""),
                        "audit-only mode, allowing send that would be blocked"
                    );
                    self.telemetry.audit(
                        TelemetryRecord::event("SendWouldBlock")
                            .with_property("warning", verdict.warning.map(|w| w.code()).unwrap_or(""))
                            .with_property("message", verdict.message.as_deref().unwrap_or(""))
                            .with_measurement("totalToCc", state.total_to_cc() as f64)
                            .with_measurement("externalInToCc", state.external_in_to_cc() as f64)
                            .with_measurement("externalInBcc", state.external_in_bcc() as f64),
                    );
                }
                if delivered {
                    tracing::info!(
                        allow,
                        total_to_cc = state.total_to_cc(),
                        external_in_to_cc = state.external_in_to_cc(),
                        external_in_bcc = state.external_in_bcc(),
                        "send evaluated"
                    );
                    self.telemetry.track(
                        TelemetryRecord::event("SendEvaluated")
                            .with_property("outcome", if allow { "allow" } else { "block" })
                            .with_property("warning", verdict.warning.map(|w| w.code()).unwrap_or("none"))
                            .with_measurement("totalToCc", state.total_to_cc() as f64)
                            .with_measurement("externalInToCc", state.external_in_to_cc() as f64)
                            .with_measurement("externalInBcc", state.external_in_bcc() as f64)
                            .with_measurement("bccCount", state.bcc_count() as f64),
                    );
                }
                GateReport {
                    completed_by: session.completed_by().unwrap_or(CompletedBy::Evaluation),
                    verdict: delivered.then_some(verdict),
                    audit_suppressed: delivered && suppress,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, code = err.code(), "recipient evaluation failed, allowing send");
                self.telemetry.track(
                    TelemetryRecord::exception(err.to_string())
                        .with_property("code", err.code())
                        .with_property("path", "send"),
                );
                session.deliver(Decision::allow(), CompletedBy::FailOpen);
                GateReport {
                    completed_by: session.completed_by().unwrap_or(CompletedBy::FailOpen),
                    verdict: None,
                    audit_suppressed: false,
                }
            }
        }
    }
}
