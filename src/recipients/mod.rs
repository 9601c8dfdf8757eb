//! Host recipient records and the asynchronous source they are fetched from.
//!
//! The mail host exposes To, CC and BCC as three independently fetched
//! collections. Each fetch may fail, and BCC may not exist at all on older
//! hosts. [`RecipientSource`] models that contract; [`aggregate`] turns the
//! three results into the single [`AggregateState`] the policy reads.

use std::fmt;

use serde::{Deserialize, Serialize};

mod aggregate;

pub use aggregate::{aggregate, AggregateState, RecipientBucket, RecipientCounts};

/// One recipient as the host reports it. Depending on host version the
/// address arrives as `emailAddress` or `address`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Recipient {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email_address: Some(email.into()),
            ..Self::default()
        }
    }

    /// First non-empty of `email_address` and `address`, else `""`.
    pub fn email(&self) -> &str {
        self.email_address
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.address.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("")
    }
}

/// The three mail recipient visibility classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientField {
    To,
    Cc,
    Bcc,
}

impl RecipientField {
    pub fn as_str(self) -> &'static str {
        match self {
            RecipientField::To => "to",
            RecipientField::Cc => "cc",
            RecipientField::Bcc => "bcc",
        }
    }
}

impl fmt::Display for RecipientField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one host round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The host succeeded; a missing value means an empty field.
    Succeeded(Option<Vec<Recipient>>),
    /// The host reported a non-success status.
    Failed(String),
    /// The host does not expose this field.
    Unavailable,
}

/// Asynchronous access to the recipient fields of the message being composed.
#[async_trait::async_trait]
pub trait RecipientSource: Send + Sync {
    async fn fetch(&self, field: RecipientField) -> FetchOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Succeeded,
    Failed,
}

/// Wire form of one field's fetch result, as relayed by a host bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPayload {
    pub status: FetchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<Recipient>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FieldPayload {
    pub fn succeeded(value: Vec<Recipient>) -> Self {
        Self {
            status: FetchStatus::Succeeded,
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: FetchStatus::Failed,
            value: None,
            error: Some(error.into()),
        }
    }

    fn outcome(&self) -> FetchOutcome {
        match self.status {
            FetchStatus::Succeeded => FetchOutcome::Succeeded(self.value.clone()),
            FetchStatus::Failed => FetchOutcome::Failed(
                self.error
                    .clone()
                    .unwrap_or_else(|| "host reported failure".into()),
            ),
        }
    }
}

/// A [`RecipientSource`] backed by an already-fetched request body. A field
/// that is absent from the body is reported as [`FetchOutcome::Unavailable`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadRecipientSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<FieldPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<FieldPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<FieldPayload>,
}

impl PayloadRecipientSource {
    fn field(&self, field: RecipientField) -> Option<&FieldPayload> {
        match field {
            RecipientField::To => self.to.as_ref(),
            RecipientField::Cc => self.cc.as_ref(),
            RecipientField::Bcc => self.bcc.as_ref(),
        }
    }
}

#[async_trait::async_trait]
impl RecipientSource for PayloadRecipientSource {
    async fn fetch(&self, field: RecipientField) -> FetchOutcome {
        match self.field(field) {
            Some(payload) => payload.outcome(),
            None => FetchOutcome::Unavailable,
        }
    }
}
