//! Threshold policy over aggregated recipient counts.
//!
//! A message warns when either
//!
//! * at least `external_threshold` external addresses sit in To/CC, or
//! * more than `recipient_threshold` addresses sit in To/CC and at least one
//!   external address is present anywhere (To, CC or BCC).
//!
//! Leaving `recipient_threshold` unset gives the older single-threshold
//! policy where only the external To/CC count matters.

use serde::{Deserialize, Serialize};

use crate::recipients::{AggregateState, RecipientCounts};

pub const DEFAULT_RECIPIENT_THRESHOLD: usize = 10;
pub const DEFAULT_EXTERNAL_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyThresholds {
    /// Strict upper bound on visible To/CC addresses before the total-based
    /// rule applies. `None` disables the rule.
    pub recipient_threshold: Option<usize>,
    /// Inclusive lower bound on external To/CC addresses that always warns.
    pub external_threshold: usize,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            recipient_threshold: Some(DEFAULT_RECIPIENT_THRESHOLD),
            external_threshold: DEFAULT_EXTERNAL_THRESHOLD,
        }
    }
}

/// Which leakage pattern triggered a warning, with the counts it cites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Warning {
    /// Too many external addresses visible in To/CC.
    ExternalInToCc { external: usize },
    /// External BCC recipients will see every To/CC address.
    BccSeesToCc { total: usize },
    /// A large visible list with some external presence.
    LargeVisibleList { total: usize, external: usize },
}

impl Warning {
    /// One-line status text.
    pub fn headline(&self) -> String {
        match *self {
            Warning::ExternalInToCc { external } => {
                format!("Warning: {} external recipients in To/CC", external)
            }
            Warning::BccSeesToCc { total } => {
                format!("Warning: {} addresses visible to external", total)
            }
            Warning::LargeVisibleList { total, external } => {
                format!("Warning: {} recipients ({} external)", total, external)
            }
        }
    }

    /// Longer explanation of what will be disclosed.
    pub fn detail(&self) -> String {
        match *self {
            Warning::ExternalInToCc { external } => format!(
                "You have {} external recipients in the To/CC fields. Their email addresses will be visible to all other recipients.",
                external
            ),
            Warning::BccSeesToCc { total } => format!(
                "External recipients in BCC will see all {} email addresses in the To/CC fields.",
                total
            ),
            Warning::LargeVisibleList { total, external } => format!(
                "You have {} recipients ({} external) in the To/CC fields. All email addresses will be visible to everyone.",
                total, external
            ),
        }
    }

    /// Advisory text, also used as the send-gate message.
    pub fn notification(&self) -> String {
        match *self {
            Warning::ExternalInToCc { external } => format!(
                "You have {} external recipients in To/CC. Consider using BCC for external recipients to protect their privacy.",
                external
            ),
            Warning::BccSeesToCc { total } => format!(
                "External recipients in BCC will see all {} email addresses in To/CC. Consider moving recipients to BCC to protect their addresses from external parties.",
                total
            ),
            Warning::LargeVisibleList { total, external } => format!(
                "You have {} recipients ({} external) in To/CC. Consider using BCC for external recipients to protect their privacy.",
                total, external
            ),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Warning::ExternalInToCc { .. } => "external_in_to_cc",
            Warning::BccSeesToCc { .. } => "bcc_sees_to_cc",
            Warning::LargeVisibleList { .. } => "large_visible_list",
        }
    }
}

/// Output of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub block: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<Warning>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            block: false,
            message: None,
            warning: None,
        }
    }

    fn warn(warning: Warning) -> Self {
        Self {
            block: true,
            message: Some(warning.notification()),
            warning: Some(warning),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskPolicy {
    thresholds: PolicyThresholds,
}

impl RiskPolicy {
    pub fn new(thresholds: PolicyThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> PolicyThresholds {
        self.thresholds
    }

    pub fn evaluate(&self, state: &AggregateState) -> Verdict {
        self.evaluate_counts(state.counts())
    }

    pub fn evaluate_counts(&self, counts: RecipientCounts) -> Verdict {
        let RecipientCounts {
            total_to_cc,
            external_in_to_cc,
            external_in_bcc,
        } = counts;
        if total_to_cc == 0 {
            return Verdict::allow();
        }
        // Externals are a subset of the visible list.
        let external_in_to_cc = external_in_to_cc.min(total_to_cc);

        let by_external =
            external_in_to_cc > 0 && external_in_to_cc >= self.thresholds.external_threshold;
        let by_total = self
            .thresholds
            .recipient_threshold
            .is_some_and(|limit| total_to_cc > limit && external_in_to_cc + external_in_bcc > 0);

        if !by_external && !by_total {
            return Verdict::allow();
        }

        let warning = if by_external {
            Warning::ExternalInToCc {
                external: external_in_to_cc,
            }
        } else if external_in_bcc > 0 && external_in_to_cc == 0 {
            Warning::BccSeesToCc { total: total_to_cc }
        } else {
            Warning::LargeVisibleList {
                total: total_to_cc,
                external: external_in_to_cc,
            }
        };
        Verdict::warn(warning)
    }
}
