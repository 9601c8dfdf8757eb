//! Fire-and-forget telemetry.
//!
//! Evaluators report named events, metrics and exceptions through the
//! [`Telemetry`] capability. Implementations return nothing and must never
//! panic or block the caller on a failed write; a broken sink only loses
//! records.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

pub const APP_NAME: &str = "RecipientGuard";

pub type Properties = BTreeMap<String, String>;
pub type Measurements = BTreeMap<String, f64>;

/// A single telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TelemetryRecord {
    Event {
        name: String,
        properties: Properties,
        measurements: Measurements,
    },
    Metric {
        name: String,
        value: f64,
        properties: Properties,
    },
    Exception {
        message: String,
        properties: Properties,
    },
}

impl TelemetryRecord {
    pub fn event(name: impl Into<String>) -> Self {
        TelemetryRecord::Event {
            name: name.into(),
            properties: Properties::new(),
            measurements: Measurements::new(),
        }
    }

    pub fn metric(name: impl Into<String>, value: f64) -> Self {
        TelemetryRecord::Metric {
            name: name.into(),
            value,
            properties: Properties::new(),
        }
    }

    pub fn exception(message: impl Into<String>) -> Self {
        TelemetryRecord::Exception {
            message: message.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl ToString) -> Self {
        match &mut self {
            TelemetryRecord::Event { properties, .. }
            | TelemetryRecord::Metric { properties, .. }
            | TelemetryRecord::Exception { properties, .. } => {
                properties.insert(key.to_string(), value.to_string());
            }
        }
        self
    }

    /// Numeric measurement; ignored for non-event records.
    pub fn with_measurement(mut self, key: &str, value: f64) -> Self {
        if let TelemetryRecord::Event { measurements, .. } = &mut self {
            measurements.insert(key.to_string(), value);
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            TelemetryRecord::Event { name, .. } | TelemetryRecord::Metric { name, .. } => name,
            TelemetryRecord::Exception { .. } => "exception",
        }
    }
}

/// Telemetry capability. Both methods are infallible by contract.
pub trait Telemetry: Send + Sync {
    fn track(&self, record: TelemetryRecord);

    /// Record a decision that audit-only mode kept from taking effect.
    fn audit(&self, _record: TelemetryRecord) {}

    fn flush(&self) {}
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn track(&self, _record: TelemetryRecord) {}
}

/// Simple size-based rotating writer (`keep` numbered backups, the newest
/// optionally gzip-compressed).
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(
        path: &str,
        max_bytes: Option<u64>,
        keep: usize,
        compress: bool,
    ) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes,
            keep,
            compress,
        })
    }

    fn check_rotate(&mut self) {
        if let Some(limit) = self.max_bytes {
            if self.exceeds_limit(limit) {
                self.rotate_backups();
                self.compress_latest_backup();
                self.reopen_current();
            }
        }
    }

    fn write_line_result(&mut self, line: &str) -> std::io::Result<()> {
        self.check_rotate();
        writeln!(self.file, "{}", line)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }

    fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    fn exceeds_limit(&self, limit: u64) -> bool {
        self.current_size().map(|len| len >= limit).unwrap_or(false)
    }

    fn rotate_backups(&self) {
        if self.keep == 0 {
            return;
        }
        for idx in (1..=self.keep).rev() {
            let old = if idx == 1 {
                self.path.clone()
            } else {
                self.path.with_extension(format!("{}", idx - 1))
            };
            if old.exists() {
                let new = self.path.with_extension(format!("{}", idx));
                let _ = fs::rename(&old, &new);
            }
        }
    }

    fn compress_latest_backup(&self) {
        if !self.compress || self.keep == 0 {
            return;
        }
        let rotated = self.path.with_extension("1");
        if let Ok(data) = fs::read(&rotated) {
            let gz_path = rotated.with_extension("1.gz");
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            if gz.write_all(&data).is_ok() {
                if let Ok(buf) = gz.finish() {
                    let _ = fs::write(&gz_path, buf);
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }

    fn reopen_current(&mut self) {
        if let Ok(newf) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = newf;
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Telemetry,
    Audit,
}

/// Newline-delimited JSON telemetry with an optional separate audit stream.
#[derive(Clone)]
pub struct TelemetrySink {
    telemetry_writer: Option<Arc<Mutex<RotatingWriter>>>,
    audit_writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    log_sample_n: Option<u64>,
    log_sample_counter: Arc<AtomicU64>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    log_file_size_bytes: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(
        telemetry_writer: Option<RotatingWriter>,
        audit_writer: Option<RotatingWriter>,
        log_stdout: bool,
        log_sample_n: Option<u64>,
    ) -> Self {
        Self {
            telemetry_writer: telemetry_writer.map(|w| Arc::new(Mutex::new(w))),
            audit_writer: audit_writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            log_sample_n,
            log_sample_counter: Arc::new(AtomicU64::new(0)),
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
            log_file_size_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sink with no writers; records are only echoed to stdout if enabled.
    pub fn disabled() -> Self {
        Self::new(None, None, false, None)
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn log_file_size_bytes(&self) -> u64 {
        self.log_file_size_bytes.load(Ordering::Relaxed)
    }

    fn write_line(
        &self,
        payload: &serde_json::Value,
        writer: Option<&Arc<Mutex<RotatingWriter>>>,
        kind: StreamKind,
    ) -> bool {
        let line = payload.to_string();
        if let Some(target) = writer {
            if let Ok(mut guard) = target.lock() {
                match guard.write_line_result(&line) {
                    Ok(_) => {
                        self.lines_total.fetch_add(1, Ordering::Relaxed);
                        if let Some(sz) = guard.current_size() {
                            self.log_file_size_bytes.store(sz, Ordering::Relaxed);
                        }
                        return true;
                    }
                    Err(e) => {
                        match kind {
                            StreamKind::Telemetry => {
                                tracing::warn!(error=%e, "Failed to write telemetry line");
                            }
                            StreamKind::Audit => {
                                tracing::warn!(error=%e, "Failed to write audit line");
                            }
                        }
                        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        false
    }

    fn should_log_stdout(&self) -> bool {
        if !self.log_stdout {
            return false;
        }
        if let Some(n) = self.log_sample_n {
            let prev = self.log_sample_counter.fetch_add(1, Ordering::Relaxed);
            prev % n == 0
        } else {
            true
        }
    }
}

/// Stamp a record with time and application identity.
fn envelope(mut payload: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("schemaVersion".into(), 1.into());
        obj.insert("ts".into(), chrono::Utc::now().to_rfc3339().into());
        obj.insert("appName".into(), APP_NAME.into());
        obj.insert("appVersion".into(), env!("CARGO_PKG_VERSION").into());
    }
    payload
}

impl Telemetry for TelemetrySink {
    fn track(&self, record: TelemetryRecord) {
        let payload = match serde_json::to_value(&record) {
            Ok(v) => envelope(v),
            Err(e) => {
                tracing::warn!(error=%e, name = record.name(), "Failed to serialise telemetry record");
                return;
            }
        };
        let writer = self.telemetry_writer.as_ref();
        let wrote = self.write_line(&payload, writer, StreamKind::Telemetry);
        if (wrote || writer.is_none()) && self.should_log_stdout() {
            tracing::info!(target: "telemetry", record = %payload);
        }
    }

    /// Falls back to the telemetry file when no audit file is configured.
    fn audit(&self, record: TelemetryRecord) {
        let writer = self
            .audit_writer
            .as_ref()
            .or(self.telemetry_writer.as_ref());
        if writer.is_none() {
            tracing::warn!("Audit record dropped: no audit or telemetry writer configured");
            return;
        }
        let payload = match serde_json::to_value(&record) {
            Ok(v) => {
                let mut v = envelope(v);
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("audit".into(), true.into());
                }
                v
            }
            Err(e) => {
                tracing::warn!(error=%e, name = record.name(), "Failed to serialise audit record");
                return;
            }
        };
        if self.write_line(&payload, writer, StreamKind::Audit) && self.should_log_stdout() {
            tracing::info!(target: "telemetry", audit = true, record = %payload);
        }
    }

    fn flush(&self) {
        for writer in [&self.telemetry_writer, &self.audit_writer].into_iter().flatten() {
            if let Ok(mut guard) = writer.lock() {
                if let Err(e) = guard.flush() {
                    tracing::warn!(error=%e, "Failed to flush telemetry writer");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_attach_properties_and_measurements() {
        let rec = TelemetryRecord::event("SendEvaluated")
            .with_property("outcome", "allow")
            .with_measurement("totalToCc", 3.0);
        match &rec {
            TelemetryRecord::Event {
                properties,
                measurements,
                ..
            } => {
                assert_eq!(properties.get("outcome").map(String::as_str), Some("allow"));
                assert_eq!(measurements.get("totalToCc"), Some(&3.0));
            }
            other => panic!("unexpected record {other:?}"),
        }
        let metric = TelemetryRecord::metric("EvaluationLatencyMs", 4.0).with_measurement("ignored", 1.0);
        assert_eq!(metric, TelemetryRecord::metric("EvaluationLatencyMs", 4.0));
    }

    #[test]
    fn envelope_stamps_identity() {
        let v = envelope(serde_json::json!({"type": "event"}));
        assert_eq!(v["appName"], APP_NAME);
        assert_eq!(v["appVersion"], env!("CARGO_PKG_VERSION"));
        assert!(v["ts"].is_string());
    }

    #[test]
    fn disabled_sink_swallows_records() {
        let sink = TelemetrySink::disabled();
        sink.track(TelemetryRecord::exception("boom"));
        sink.flush();
        assert_eq!(sink.lines_total(), 0);
        assert_eq!(sink.write_errors_total(), 0);
    }
}
