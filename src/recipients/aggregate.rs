use serde::Serialize;

use super::{FetchOutcome, Recipient, RecipientField, RecipientSource};
use crate::classify::DomainClassifier;
use crate::error::EvaluationError;

/// Recipients of one mail field (or the merged To+CC view) with counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientBucket {
    items: Vec<Recipient>,
    external_count: usize,
    total_count: usize,
}

impl RecipientBucket {
    /// Classify every recipient; duplicates are counted as often as they occur.
    pub fn classify(items: Vec<Recipient>, classifier: &DomainClassifier) -> Self {
        let external_count = items
            .iter()
            .filter(|r| classifier.is_external(r.email()))
            .count();
        Self {
            total_count: items.len(),
            external_count,
            items,
        }
    }

    pub fn items(&self) -> &[Recipient] {
        &self.items
    }

    pub fn external_count(&self) -> usize {
        self.external_count
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    fn merge(mut self, other: RecipientBucket) -> Self {
        self.items.extend(other.items);
        self.external_count += other.external_count;
        self.total_count += other.total_count;
        self
    }
}

/// The three numbers the risk policy depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientCounts {
    pub total_to_cc: usize,
    pub external_in_to_cc: usize,
    pub external_in_bcc: usize,
}

impl RecipientCounts {
    pub fn total_external(&self) -> usize {
        self.external_in_to_cc + self.external_in_bcc
    }
}

/// Merged view of one message's recipients; the sole input to the policy.
///
/// Only [`AggregateState::from_buckets`] builds one, so the external counts
/// never exceed the recipient counts they were derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateState {
    to_count: usize,
    cc_count: usize,
    to_cc: RecipientBucket,
    bcc: RecipientBucket,
    external_in_to_cc: usize,
    external_in_bcc: usize,
    total_external: usize,
}

impl AggregateState {
    pub fn from_buckets(to: RecipientBucket, cc: RecipientBucket, bcc: RecipientBucket) -> Self {
        let to_count = to.total_count;
        let cc_count = cc.total_count;
        let to_cc = to.merge(cc);
        let external_in_to_cc = to_cc.external_count;
        let external_in_bcc = bcc.external_count;
        Self {
            to_count,
            cc_count,
            to_cc,
            bcc,
            external_in_to_cc,
            external_in_bcc,
            total_external: external_in_to_cc + external_in_bcc,
        }
    }

    pub fn to_count(&self) -> usize {
        self.to_count
    }

    pub fn cc_count(&self) -> usize {
        self.cc_count
    }

    pub fn total_to_cc(&self) -> usize {
        self.to_cc.total_count
    }

    pub fn bcc_count(&self) -> usize {
        self.bcc.total_count
    }

    pub fn to_cc(&self) -> &RecipientBucket {
        &self.to_cc
    }

    pub fn bcc(&self) -> &RecipientBucket {
        &self.bcc
    }

    pub fn external_in_to_cc(&self) -> usize {
        self.external_in_to_cc
    }

    pub fn external_in_bcc(&self) -> usize {
        self.external_in_bcc
    }

    pub fn total_external(&self) -> usize {
        self.total_external
    }

    pub fn counts(&self) -> RecipientCounts {
        RecipientCounts {
            total_to_cc: self.to_cc.total_count,
            external_in_to_cc: self.external_in_to_cc,
            external_in_bcc: self.external_in_bcc,
        }
    }
}

/// Fetch To, CC and BCC from the host and classify them.
///
/// To and CC are required: a failure or missing capability aborts the
/// evaluation. BCC is best effort; when the host cannot provide it the
/// aggregate carries an empty BCC bucket.
pub async fn aggregate(
    source: &dyn RecipientSource,
    classifier: &DomainClassifier,
) -> Result<AggregateState, EvaluationError> {
    let (to, cc, bcc) = tokio::join!(
        source.fetch(RecipientField::To),
        source.fetch(RecipientField::Cc),
        source.fetch(RecipientField::Bcc),
    );

    let to = required(RecipientField::To, to)?;
    let cc = required(RecipientField::Cc, cc)?;
    let bcc = match bcc {
        FetchOutcome::Succeeded(value) => value.unwrap_or_default(),
        FetchOutcome::Unavailable => {
            tracing::debug!("bcc not exposed by host, treating as empty");
            Vec::new()
        }
        FetchOutcome::Failed(message) => {
            tracing::debug!(error = %message, "bcc fetch failed, treating as empty");
            Vec::new()
        }
    };

    Ok(AggregateState::from_buckets(
        RecipientBucket::classify(to, classifier),
        RecipientBucket::classify(cc, classifier),
        RecipientBucket::classify(bcc, classifier),
    ))
}

fn required(field: RecipientField, outcome: FetchOutcome) -> Result<Vec<Recipient>, EvaluationError> {
    match outcome {
        FetchOutcome::Succeeded(value) => Ok(value.unwrap_or_default()),
        FetchOutcome::Failed(message) => Err(EvaluationError::Fetch { field, message }),
        FetchOutcome::Unavailable => Err(EvaluationError::Unavailable { field }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{DomainAllowList, UnknownAddress};

    fn classifier() -> DomainClassifier {
        DomainClassifier::new(DomainAllowList::new(["corp.no"]), UnknownAddress::External)
    }

    fn recipients(addrs: &[&str]) -> Vec<Recipient> {
        addrs.iter().map(|a| Recipient::new(*a)).collect()
    }

    #[test]
    fn merged_counts_uphold_invariants() {
        let c = classifier();
        let state = AggregateState::from_buckets(
            RecipientBucket::classify(recipients(&["a@corp.no", "b@ext.com"]), &c),
            RecipientBucket::classify(recipients(&["c@ext.com", "c@ext.com"]), &c),
            RecipientBucket::classify(recipients(&["d@ext.org"]), &c),
        );
        assert_eq!(state.to_count(), 2);
        assert_eq!(state.cc_count(), 2);
        assert_eq!(state.total_to_cc(), 4);
        assert_eq!(state.to_cc().items().len(), 4);
        assert_eq!(state.bcc_count(), 1);
        assert_eq!(state.external_in_to_cc(), 3);
        assert_eq!(state.external_in_bcc(), 1);
        assert_eq!(state.total_external(), 4);
        assert_eq!(state.counts().total_external(), state.total_external());
    }

    #[test]
    fn default_state_is_empty_and_never_warns() {
        let state = AggregateState::default();
        assert_eq!(state.total_to_cc(), 0);
        assert_eq!(state.external_in_to_cc(), 0);
        assert_eq!(state.total_external(), 0);
        assert!(!crate::policy::RiskPolicy::default().evaluate(&state).block);
    }
}
