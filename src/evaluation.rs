//! One pass of fetch, classify and policy evaluation, shared by the gating
//! and live evaluators.

use std::sync::Arc;

use crate::classify::DomainClassifier;
use crate::config::GuardConfig;
use crate::error::EvaluationError;
use crate::policy::{RiskPolicy, Verdict};
use crate::recipients::{aggregate, AggregateState, RecipientSource};

/// Aggregate state together with the verdict derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub state: AggregateState,
    pub verdict: Verdict,
}

/// Cheap to clone; the classifier is shared.
#[derive(Debug, Clone)]
pub struct RecipientEvaluator {
    classifier: Arc<DomainClassifier>,
    policy: RiskPolicy,
}

impl RecipientEvaluator {
    pub fn new(classifier: DomainClassifier, policy: RiskPolicy) -> Self {
        Self {
            classifier: Arc::new(classifier),
            policy,
        }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new(config.classifier(), config.policy())
    }

    pub fn classifier(&self) -> &DomainClassifier {
        &self.classifier
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub async fn evaluate(
        &self,
        source: &dyn RecipientSource,
    ) -> Result<Evaluation, EvaluationError> {
        let state = aggregate(source, &self.classifier).await?;
        let verdict = self.policy.evaluate(&state);
        tracing::debug!(
            total_to_cc = state.total_to_cc(),
            external_in_to_cc = state.external_in_to_cc(),
            external_in_bcc = state.external_in_bcc(),
            warn = verdict.block,
            "recipients evaluated"
        );
        Ok(Evaluation { state, verdict })
    }
}
