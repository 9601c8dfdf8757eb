//! HTTP surface: a host bridge posts the recipient fields it fetched and
//! receives either a send decision or a live advisory report.

use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, State,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::config::{AppConfig, GuardConfig};
use crate::evaluation::RecipientEvaluator;
use crate::gate::{ChannelGate, CompletedBy, Decision, GatingEvaluator};
use crate::live::{LiveEvaluator, NoopSurface, RecipientMonitor};
use crate::recipients::{PayloadRecipientSource, RecipientSource};
use crate::telemetry::{RotatingWriter, Telemetry, TelemetrySink};
use crate::util::LatencyHistogram;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub allow_event: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub completed_by: CompletedBy,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub http_status: u16,
}

/// Counters exposed on `/metrics`.
#[derive(Default)]
pub struct ServiceMetrics {
    pub evaluations_total: AtomicU64,
    /// Blocking verdicts before any audit-only override.
    pub blocks_total: AtomicU64,
    pub fail_open_total: AtomicU64,
    pub timeouts_total: AtomicU64,
    pub audit_suppressed_total: AtomicU64,
    pub live_checks_total: AtomicU64,
    pub live_warnings_total: AtomicU64,
    pub send_latency: LatencyHistogram,
}

/// Shared handler state. Cloned per request; everything heavy is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GuardConfig>,
    pub gating: Arc<GatingEvaluator>,
    pub live: Arc<LiveEvaluator>,
    pub telemetry: TelemetrySink,
    pub allowed_tokens: Option<HashSet<String>>,
    /// Maximum accepted raw request body size in bytes (None => unlimited)
    pub max_request_bytes: Option<usize>,
    pub audit_only: bool,
    pub metrics: Arc<ServiceMetrics>,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

impl AppState {
    /// Build handler state from a loaded configuration. Telemetry files that
    /// cannot be opened are logged and skipped.
    pub fn from_config(config: AppConfig) -> Self {
        let AppConfig {
            guard,
            log_file,
            audit_log_file,
            allowed_tokens,
            rotation,
            log_stdout,
            log_sample_n,
            max_request_bytes,
            audit_only,
        } = config;

        let open = |path: &str, what: &str| {
            match RotatingWriter::open(path, rotation.max_bytes, rotation.keep, rotation.compress) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(path=%path, error=%e, "Failed to open {what}; continuing without it");
                    None
                }
            }
        };
        let telemetry_writer = match log_file.as_deref() {
            Some(path) => open(path, "LOG_FILE"),
            None => {
                tracing::warn!("Telemetry disabled: LOG_FILE not set");
                None
            }
        };
        let audit_writer = audit_log_file
            .as_deref()
            .and_then(|path| open(path, "AUDIT_LOG_FILE"));

        let telemetry = TelemetrySink::new(telemetry_writer, audit_writer, log_stdout, log_sample_n);
        let shared: Arc<dyn Telemetry> = Arc::new(telemetry.clone());

        let evaluator = RecipientEvaluator::from_config(&guard);
        let gating = GatingEvaluator::new(evaluator.clone(), guard.send_timeout(), Arc::clone(&shared))
            .with_audit_only(audit_only);
        let live = LiveEvaluator::new(evaluator, Arc::new(NoopSurface), shared);

        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            config: Arc::new(guard),
            gating: Arc::new(gating),
            live: Arc::new(live),
            telemetry,
            allowed_tokens,
            max_request_bytes,
            audit_only,
            metrics: Arc::new(ServiceMetrics::default()),
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    /// Debounced live monitor for one draft, using the configured quiet window.
    pub fn monitor(&self, source: Arc<dyn RecipientSource>) -> RecipientMonitor {
        RecipientMonitor::spawn(Arc::clone(&self.live), source, self.config.debounce())
    }
}

pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    tracing::info!(
        internal_domains = config.guard.internal_domains.len(),
        recipient_threshold = ?config.guard.recipient_threshold,
        external_threshold = config.guard.external_threshold,
        send_timeout_ms = config.guard.send_timeout_ms,
        audit_only = config.audit_only,
        "recipient guard configured"
    );
    Ok(AppState::from_config(config))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/evaluate-send", post(evaluate_send_handler))
        .route("/evaluate-live", post(evaluate_live_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

fn respond_with_error(err: ErrorResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

fn authorization_error() -> ErrorResponse {
    ErrorResponse {
        error_code: 2001,
        message: "Unauthorized".into(),
        http_status: 401,
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ErrorResponse> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(authorization_error)?;

    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return Err(authorization_error());
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        return Err(authorization_error());
    }
    Ok(token.to_string())
}

/// Without an allow-list every caller is accepted.
fn ensure_authorized(
    headers: &HeaderMap,
    allowed_tokens: Option<&HashSet<String>>,
) -> Result<(), ErrorResponse> {
    let Some(tokens) = allowed_tokens else {
        return Ok(());
    };
    let token = extract_bearer_token(headers)?;
    if !tokens.contains(&token) {
        return Err(authorization_error());
    }
    Ok(())
}

fn too_large(message: String) -> ErrorResponse {
    ErrorResponse {
        error_code: 4001,
        message,
        http_status: 413,
    }
}

/// Size guard on the declared Content-Length, ahead of body buffering.
fn ensure_within_limit(state: &AppState, headers: &HeaderMap) -> Result<(), ErrorResponse> {
    let Some(limit) = state.max_request_bytes else {
        return Ok(());
    };
    let declared = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    match declared {
        Some(clen) if clen > limit => Err(too_large(format!(
            "Request too large ({} bytes > limit {} bytes)",
            clen, limit
        ))),
        _ => Ok(()),
    }
}

fn admit(
    state: &AppState,
    headers: &HeaderMap,
    payload: Result<Json<PayloadRecipientSource>, JsonRejection>,
) -> Result<PayloadRecipientSource, axum::response::Response> {
    ensure_within_limit(state, headers).map_err(respond_with_error)?;
    ensure_authorized(headers, state.allowed_tokens.as_ref()).map_err(respond_with_error)?;
    match payload {
        Ok(Json(inner)) => Ok(inner),
        Err(rejection) => Err(handle_json_rejection(state, rejection)),
    }
}

/// Gate a send attempt. Always answers; evaluation failures and timeouts
/// answer with `allowEvent: true`.
async fn evaluate_send_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PayloadRecipientSource>, JsonRejection>,
) -> axum::response::Response {
    let source = match admit(&state, &headers, payload) {
        Ok(source) => source,
        Err(resp) => return resp,
    };

    let started = Instant::now();
    let (gate, decision_rx) = ChannelGate::new();
    let report = state
        .gating
        .on_message_send(Arc::new(source), Arc::new(gate))
        .await;
    let decision = decision_rx.await.unwrap_or_else(|_| {
        tracing::warn!("send gate dropped without a decision, allowing");
        Decision::allow()
    });
    state
        .metrics
        .send_latency
        .observe(started.elapsed().as_millis() as u64);

    let m = &state.metrics;
    m.evaluations_total.fetch_add(1, Ordering::Relaxed);
    match report.completed_by {
        CompletedBy::FailOpen => {
            m.fail_open_total.fetch_add(1, Ordering::Relaxed);
        }
        CompletedBy::Timeout => {
            m.timeouts_total.fetch_add(1, Ordering::Relaxed);
        }
        CompletedBy::Evaluation => {}
    }
    if report.verdict.as_ref().is_some_and(|v| v.block) {
        m.blocks_total.fetch_add(1, Ordering::Relaxed);
    }
    if report.audit_suppressed {
        m.audit_suppressed_total.fetch_add(1, Ordering::Relaxed);
    }

    let response = SendResponse {
        allow_event: decision.allow_event,
        error_message: decision.error_message,
        completed_by: report.completed_by,
    };
    (StatusCode::OK, Json(response)).into_response()
}

async fn evaluate_live_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PayloadRecipientSource>, JsonRejection>,
) -> axum::response::Response {
    let source = match admit(&state, &headers, payload) {
        Ok(source) => source,
        Err(resp) => return resp,
    };

    let report = state.live.check(Arc::new(source)).await;
    state.metrics.live_checks_total.fetch_add(1, Ordering::Relaxed);
    if report.status.is_warning() {
        state.metrics.live_warnings_total.fetch_add(1, Ordering::Relaxed);
    }
    (StatusCode::OK, Json(report)).into_response()
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> axum::response::Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            tracing::warn!(limit = ?state.max_request_bytes, "request body exceeded configured limit");
            let message = match state.max_request_bytes {
                Some(limit) => format!("Request too large (body exceeded limit {} bytes)", limit),
                None => "Request too large".to_string(),
            };
            respond_with_error(too_large(message))
        }
        other => other.into_response(),
    }
}

/// Health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let evaluator = state.live.evaluator();
    let thresholds = evaluator.policy().thresholds();
    let classifier = evaluator.classifier();
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "recipientThreshold": thresholds.recipient_threshold,
        "externalThreshold": thresholds.external_threshold,
        "internalDomainCount": classifier.allow_list().len(),
        "unknownAddress": classifier.unknown_address(),
        "sendTimeoutMs": state.gating.timeout().as_millis() as u64,
        "debounceMs": state.config.debounce_ms,
        "auditOnly": state.audit_only,
    });
    (StatusCode::OK, Json(json)).into_response()
}

fn write_counter(buf: &mut String, name: &str, help: &str, value: u64) {
    use std::fmt::Write as _;
    writeln!(buf, "# HELP {} {}", name, help).ok();
    writeln!(buf, "# TYPE {} counter", name).ok();
    writeln!(buf, "{} {}", name, value).ok();
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    use std::fmt::Write as _;
    let m = &state.metrics;
    let mut buf = String::new();

    write_counter(
        &mut buf,
        "recipient_guard_evaluations_total",
        "Send attempts evaluated",
        m.evaluations_total.load(Ordering::Relaxed),
    );
    write_counter(
        &mut buf,
        "recipient_guard_blocks_total",
        "Blocking verdicts (pre audit override)",
        m.blocks_total.load(Ordering::Relaxed),
    );
    write_counter(
        &mut buf,
        "recipient_guard_fail_open_total",
        "Send attempts allowed because the evaluation failed",
        m.fail_open_total.load(Ordering::Relaxed),
    );
    write_counter(
        &mut buf,
        "recipient_guard_timeouts_total",
        "Send attempts allowed because the budget elapsed",
        m.timeouts_total.load(Ordering::Relaxed),
    );
    write_counter(
        &mut buf,
        "recipient_guard_audit_suppressed_total",
        "Blocks suppressed due to audit-only mode",
        m.audit_suppressed_total.load(Ordering::Relaxed),
    );
    write_counter(
        &mut buf,
        "recipient_guard_live_checks_total",
        "Live advisory checks",
        m.live_checks_total.load(Ordering::Relaxed),
    );
    write_counter(
        &mut buf,
        "recipient_guard_live_warnings_total",
        "Live checks that showed a privacy advisory",
        m.live_warnings_total.load(Ordering::Relaxed),
    );
    write_counter(
        &mut buf,
        "recipient_guard_telemetry_lines_total",
        "Telemetry/audit JSON lines written",
        state.telemetry.lines_total(),
    );
    write_counter(
        &mut buf,
        "recipient_guard_telemetry_write_errors_total",
        "Telemetry/audit JSON line write failures",
        state.telemetry.write_errors_total(),
    );

    writeln!(
        &mut buf,
        "# HELP recipient_guard_send_latency_ms Send evaluation latency histogram milliseconds"
    )
    .ok();
    writeln!(&mut buf, "# TYPE recipient_guard_send_latency_ms histogram").ok();
    for (ub, cumulative) in m.send_latency.cumulative() {
        writeln!(
            &mut buf,
            "recipient_guard_send_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    let count = m.send_latency.count();
    writeln!(
        &mut buf,
        "recipient_guard_send_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(&mut buf, "recipient_guard_send_latency_ms_sum {}", m.send_latency.sum_ms()).ok();
    writeln!(&mut buf, "recipient_guard_send_latency_ms_count {}", count).ok();

    writeln!(
        &mut buf,
        "# HELP recipient_guard_build_info Build information\n# TYPE recipient_guard_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "recipient_guard_build_info{{version=\"{}\",schemaVersion=\"1\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP recipient_guard_log_file_size_bytes Current size in bytes of active telemetry log file (0 if disabled)\n# TYPE recipient_guard_log_file_size_bytes gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "recipient_guard_log_file_size_bytes {}",
        state.telemetry.log_file_size_bytes()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP recipient_guard_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE recipient_guard_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "recipient_guard_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP recipient_guard_process_uptime_seconds Process uptime seconds\n# TYPE recipient_guard_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "recipient_guard_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
