#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use recipient_guard::{
    AdvisoryMessage, Decision, DomainAllowList, DomainClassifier, FetchOutcome, FieldPayload,
    NotificationSurface, PayloadRecipientSource, Recipient, RecipientEvaluator, RecipientField,
    RecipientSource, RiskPolicy, SendGate, Telemetry, TelemetryRecord, UnknownAddress,
};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Every variable the configuration layer reads.
pub const GUARD_VARS: &[&str] = &[
    "GUARD_POLICY_CONFIG",
    "GUARD_INTERNAL_DOMAINS",
    "GUARD_RECIPIENT_THRESHOLD",
    "GUARD_EXTERNAL_THRESHOLD",
    "GUARD_UNKNOWN_ADDRESS",
    "GUARD_SEND_TIMEOUT_MS",
    "GUARD_DEBOUNCE_MS",
    "STRICT_AUTH_ALLOWED_TOKENS",
    "LOG_FILE",
    "AUDIT_LOG_FILE",
    "LOG_MAX_BYTES",
    "LOG_ROTATE_KEEP",
    "LOG_ROTATE_COMPRESS",
    "GUARD_LOG_STDOUT",
    "GUARD_LOG_SAMPLE_N",
    "GUARD_MAX_REQUEST_BYTES",
    "GUARD_AUDIT_ONLY",
];

/// Start from a clean slate so ambient variables do not leak into a test.
pub fn clean_env() -> EnvGuard {
    let mut env = EnvGuard::new();
    for var in GUARD_VARS {
        env.remove(var);
    }
    env
}

pub fn classifier() -> DomainClassifier {
    DomainClassifier::new(
        DomainAllowList::new(["bcc.no", "bcc.media"]),
        UnknownAddress::External,
    )
}

pub fn evaluator() -> RecipientEvaluator {
    RecipientEvaluator::new(classifier(), RiskPolicy::default())
}

pub fn recipients(addrs: &[&str]) -> Vec<Recipient> {
    addrs.iter().map(|a| Recipient::new(*a)).collect()
}

pub fn internal(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("staff{i}@bcc.no")).collect()
}

pub fn external(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("guest{i}@partner{i}.com")).collect()
}

fn field(addrs: &[String]) -> Option<FieldPayload> {
    Some(FieldPayload::succeeded(
        addrs.iter().map(|a| Recipient::new(a.as_str())).collect(),
    ))
}

/// A source whose three fields succeed with the given addresses. `bcc: None`
/// models a host without BCC access.
pub fn source(to: &[String], cc: &[String], bcc: Option<&[String]>) -> PayloadRecipientSource {
    PayloadRecipientSource {
        to: field(to),
        cc: field(cc),
        bcc: bcc.and_then(field),
    }
}

/// Host call that never returns.
pub struct PendingSource;

#[async_trait]
impl RecipientSource for PendingSource {
    async fn fetch(&self, _field: RecipientField) -> FetchOutcome {
        std::future::pending().await
    }
}

/// Delays every fetch before delegating.
pub struct SlowSource<S> {
    pub delay: Duration,
    pub inner: S,
}

#[async_trait]
impl<S: RecipientSource> RecipientSource for SlowSource<S> {
    async fn fetch(&self, field: RecipientField) -> FetchOutcome {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(field).await
    }
}

/// Faults inside the host bridge.
pub struct PanickingSource;

#[async_trait]
impl RecipientSource for PanickingSource {
    async fn fetch(&self, field: RecipientField) -> FetchOutcome {
        panic!("host bridge crashed fetching {field}");
    }
}

/// Counts fetches per evaluation.
pub struct CountingSource<S> {
    pub inner: S,
    pub fetches: AtomicUsize,
}

impl<S> CountingSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Number of complete evaluations (three fetches each).
    pub fn evaluations(&self) -> usize {
        self.fetches.load(Ordering::SeqCst) / 3
    }
}

#[async_trait]
impl<S: RecipientSource> RecipientSource for CountingSource<S> {
    async fn fetch(&self, field: RecipientField) -> FetchOutcome {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(field).await
    }
}

/// Host send gate that records every completion call.
#[derive(Default)]
pub struct RecordingGate {
    decisions: Mutex<Vec<Decision>>,
}

impl RecordingGate {
    pub fn calls(&self) -> usize {
        self.decisions.lock().unwrap().len()
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.decisions.lock().unwrap().clone()
    }
}

impl SendGate for RecordingGate {
    fn complete(&self, decision: Decision) {
        self.decisions.lock().unwrap().push(decision);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceCall {
    Replace(String, AdvisoryMessage),
    Remove(String),
}

#[derive(Default)]
pub struct RecordingSurface {
    calls: Mutex<Vec<SurfaceCall>>,
}

impl RecordingSurface {
    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl NotificationSurface for RecordingSurface {
    fn replace(&self, key: &str, message: AdvisoryMessage) {
        self.calls
            .lock()
            .unwrap()
            .push(SurfaceCall::Replace(key.to_string(), message));
    }

    fn remove(&self, key: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(SurfaceCall::Remove(key.to_string()));
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    tracked: Mutex<Vec<TelemetryRecord>>,
    audited: Mutex<Vec<TelemetryRecord>>,
}

impl RecordingTelemetry {
    pub fn names(&self) -> Vec<String> {
        self.tracked
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }

    pub fn tracked(&self) -> Vec<TelemetryRecord> {
        self.tracked.lock().unwrap().clone()
    }

    pub fn audited(&self) -> Vec<TelemetryRecord> {
        self.audited.lock().unwrap().clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn track(&self, record: TelemetryRecord) {
        self.tracked.lock().unwrap().push(record);
    }

    fn audit(&self, record: TelemetryRecord) {
        self.audited.lock().unwrap().push(record);
    }
}
