//! Core library for the recipient guard. Classifies outbound recipients as
//! internal or external, applies a threshold policy that flags messages
//! likely to disclose external addresses, and delivers the verdict either
//! as a bounded-time send decision or as a live advisory.

pub mod classify;
mod config;
pub mod error;
pub mod evaluation;
pub mod gate;
pub mod live;
pub mod policy;
pub mod recipients;
pub mod service;
pub mod telemetry;
pub mod util;

pub use config::{AppConfig, GuardConfig, RotationConfig};

pub use crate::classify::{Classification, DomainAllowList, DomainClassifier, UnknownAddress};
pub use crate::error::EvaluationError;
pub use crate::evaluation::{Evaluation, RecipientEvaluator};
pub use crate::gate::{
    ChannelGate, CompletedBy, Decision, EvaluationSession, GateReport, GatingEvaluator, SendGate,
};
pub use crate::live::{
    AdvisoryMessage, FieldCounts, LiveEvaluator, LiveReport, LiveStatus, NotificationSurface,
    RecipientMonitor, ADVISORY_KEY,
};
pub use crate::policy::{PolicyThresholds, RiskPolicy, Verdict, Warning};
pub use crate::recipients::{
    FetchOutcome, FieldPayload, PayloadRecipientSource, Recipient, RecipientField, RecipientSource,
};
pub use crate::service::{app, build_state_from_env, AppState};
pub use crate::telemetry::{NoopTelemetry, RotatingWriter, Telemetry, TelemetryRecord, TelemetrySink};
