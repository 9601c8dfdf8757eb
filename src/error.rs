//! Error types for recipient evaluation.
//!
//! Every variant here is resolved to a fail-open outcome by the evaluators;
//! none of them is ever surfaced to the person composing the message.

use crate::recipients::RecipientField;

/// Failure modes of a single evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    /// The host reported a non-success status for a required field.
    #[error("failed to fetch {field} recipients: {message}")]
    Fetch {
        field: RecipientField,
        message: String,
    },

    /// A required field (To or CC) is not exposed by the host at all.
    #[error("{field} recipients are not available from the host")]
    Unavailable { field: RecipientField },

    /// The evaluation task stopped before producing a verdict (panic or abort).
    #[error("evaluation aborted: {0}")]
    Aborted(String),
}

impl EvaluationError {
    /// Short stable code used in telemetry properties and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EvaluationError::Fetch { .. } => "host_fetch_failure",
            EvaluationError::Unavailable { .. } => "host_unavailable",
            EvaluationError::Aborted(_) => "unexpected_exception",
        }
    }
}
