//! Live advisory evaluation while a message is being composed.
//!
//! Unlike the gating path nothing here blocks; each check renders a status
//! and replaces or removes a single advisory on the host's notification
//! surface. [`RecipientMonitor`] debounces recipient-change notifications so
//! bursts of edits collapse into one check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::EvaluationError;
use crate::evaluation::{Evaluation, RecipientEvaluator};
use crate::recipients::{AggregateState, RecipientSource};
use crate::telemetry::{Telemetry, TelemetryRecord};

/// Key of the one advisory this crate owns on the host surface.
pub const ADVISORY_KEY: &str = "recipientWarning";

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

const NOTIFY_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryMessage {
    pub text: String,
    pub persistent: bool,
}

/// Host surface for informational messages attached to the draft.
pub trait NotificationSurface: Send + Sync {
    fn replace(&self, key: &str, message: AdvisoryMessage);
    fn remove(&self, key: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSurface;

impl NotificationSurface for NoopSurface {
    fn replace(&self, _key: &str, _message: AdvisoryMessage) {}
    fn remove(&self, _key: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCounts {
    pub to: usize,
    pub cc: usize,
    pub bcc: usize,
    pub total_to_cc: usize,
}

impl From<&AggregateState> for FieldCounts {
    fn from(state: &AggregateState) -> Self {
        Self {
            to: state.to_count(),
            cc: state.cc_count(),
            bcc: state.bcc_count(),
            total_to_cc: state.total_to_cc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum LiveStatus {
    Ok {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Warning {
        headline: String,
        detail: String,
        total_external: usize,
    },
    Failed {
        message: String,
    },
}

impl LiveStatus {
    pub fn failed() -> Self {
        LiveStatus::Failed {
            message: "Could not check recipients".to_string(),
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, LiveStatus::Warning { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveReport {
    /// Absent when the check failed before counts were known.
    pub counts: Option<FieldCounts>,
    pub status: LiveStatus,
    /// Advisory placed on the surface by this check, if any.
    pub advisory: Option<AdvisoryMessage>,
}

pub struct LiveEvaluator {
    evaluator: RecipientEvaluator,
    surface: Arc<dyn NotificationSurface>,
    telemetry: Arc<dyn Telemetry>,
}

impl LiveEvaluator {
    pub fn new(
        evaluator: RecipientEvaluator,
        surface: Arc<dyn NotificationSurface>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            evaluator,
            surface,
            telemetry,
        }
    }

    pub fn evaluator(&self) -> &RecipientEvaluator {
        &self.evaluator
    }

    /// Run one check and update the advisory. Never fails; any error is
    /// reported as [`LiveStatus::Failed`] with the advisory removed.
    pub async fn check(&self, source: Arc<dyn RecipientSource>) -> LiveReport {
        let started = Instant::now();
        let evaluator = self.evaluator.clone();
        let outcome = tokio::spawn(async move { evaluator.evaluate(source.as_ref()).await })
            .await
            .map_err(|e| EvaluationError::Aborted(e.to_string()))
            .and_then(|r| r);

        let report = match outcome {
            Ok(evaluation) => self.render(evaluation),
            Err(err) => {
                tracing::warn!(error = %err, code = err.code(), "live recipient check failed");
                self.telemetry.track(
                    TelemetryRecord::exception(err.to_string())
                        .with_property("code", err.code())
                        .with_property("path", "live"),
                );
                self.surface.remove(ADVISORY_KEY);
                LiveReport {
                    counts: None,
                    status: LiveStatus::failed(),
                    advisory: None,
                }
            }
        };

        self.telemetry.track(
            TelemetryRecord::metric("EvaluationLatencyMs", started.elapsed().as_millis() as f64)
                .with_property("path", "live"),
        );
        report
    }

    fn render(&self, Evaluation { state, verdict }: Evaluation) -> LiveReport {
        let counts = FieldCounts::from(&state);
        let total_external = state.total_external();

        self.telemetry.track(
            TelemetryRecord::event("RecipientsChecked")
                .with_measurement("toCount", counts.to as f64)
                .with_measurement("ccCount", counts.cc as f64)
                .with_measurement("bccCount", counts.bcc as f64)
                .with_measurement("externalInToCc", state.external_in_to_cc() as f64)
                .with_measurement("externalInBcc", state.external_in_bcc() as f64),
        );

        match verdict.warning {
            Some(warning) => {
                let advisory = AdvisoryMessage {
                    text: warning.notification(),
                    persistent: true,
                };
                self.surface.replace(ADVISORY_KEY, advisory.clone());
                self.telemetry.track(
                    TelemetryRecord::event("PrivacyWarningShown")
                        .with_property("warning", warning.code())
                        .with_measurement("totalToCc", counts.total_to_cc as f64)
                        .with_measurement("totalExternal", total_external as f64),
                );
                tracing::debug!(warning = warning.code(), "privacy advisory shown");
                LiveReport {
                    counts: Some(counts),
                    status: LiveStatus::Warning {
                        headline: warning.headline(),
                        detail: warning.detail(),
                        total_external,
                    },
                    advisory: Some(advisory),
                }
            }
            None => {
                self.surface.remove(ADVISORY_KEY);
                let over_limit = self
                    .evaluator
                    .policy()
                    .thresholds()
                    .recipient_threshold
                    .is_some_and(|limit| counts.total_to_cc > limit);
                let message = if over_limit {
                    format!("{} recipient(s) - all internal, OK", counts.total_to_cc)
                } else {
                    format!("{} recipient(s) in To/CC - OK", counts.total_to_cc)
                };
                LiveReport {
                    counts: Some(counts),
                    status: LiveStatus::Ok { message },
                    advisory: None,
                }
            }
        }
    }
}

/// Debounced background checker for one draft.
///
/// Runs a check at start, then one check per quiet period of `debounce`
/// after the last [`notify`](Self::notify). The latest report is published
/// through a watch channel.
pub struct RecipientMonitor {
    notify_tx: mpsc::Sender<()>,
    reports: watch::Receiver<Option<LiveReport>>,
    handle: JoinHandle<()>,
}

impl RecipientMonitor {
    pub fn spawn(
        live: Arc<LiveEvaluator>,
        source: Arc<dyn RecipientSource>,
        debounce: Duration,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CAPACITY);
        let (report_tx, reports) = watch::channel(None);
        let handle = tokio::spawn(run_monitor(live, source, debounce, notify_rx, report_tx));
        Self {
            notify_tx,
            reports,
            handle,
        }
    }

    /// Signal a recipient change.
    pub fn notify(&self) {
        // a full queue already guarantees a pending check
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.notify_tx.try_send(()) {
            tracing::debug!("recipient monitor stopped, notification dropped");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LiveReport>> {
        self.reports.clone()
    }

    pub fn latest(&self) -> Option<LiveReport> {
        self.reports.borrow().clone()
    }

    /// Stop the monitor. A notification still inside its window is dropped.
    pub async fn shutdown(self) {
        drop(self.notify_tx);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "recipient monitor task ended abnormally");
        }
    }
}

async fn run_monitor(
    live: Arc<LiveEvaluator>,
    source: Arc<dyn RecipientSource>,
    debounce: Duration,
    mut notify_rx: mpsc::Receiver<()>,
    report_tx: watch::Sender<Option<LiveReport>>,
) {
    report_tx.send_replace(Some(live.check(Arc::clone(&source)).await));

    while notify_rx.recv().await.is_some() {
        loop {
            tokio::select! {
                more = notify_rx.recv() => {
                    if more.is_none() {
                        return;
                    }
                }
                _ = tokio::time::sleep(debounce) => break,
            }
        }
        let report = live.check(Arc::clone(&source)).await;
        report_tx.send_replace(Some(report));
    }
}
