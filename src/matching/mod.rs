pub mod remote;
pub mod rules;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{AUTO_ACCEPT_CONFIDENCE, REVIEW_CONFIDENCE, UNAVAILABLE_CONFIDENCE};
use crate::error::Result;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::types::{Candidate, Decision, MatchDecision, MatchFactors, Product};

pub use remote::RemoteComparator;
pub use rules::RuleComparator;

/// Anything that can judge whether a candidate is the same product as the
/// reference. Implementations may fail; the engine turns failures into a
/// review-required decision.
#[async_trait]
pub trait Comparator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn compare(&self, reference: &Product, candidate: &Candidate) -> Result<MatchDecision>;

    /// Compare many candidates in one call. Must return exactly one decision
    /// per candidate, in order.
    async fn compare_batch(
        &self,
        reference: &Product,
        candidates: &[Candidate],
    ) -> Result<Vec<MatchDecision>> {
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            out.push(self.compare(reference, candidate).await?);
        }
        Ok(out)
    }
}

/// Threshold policy shared by the engine and the marketplace registry.
pub fn decision_for(confidence: f64) -> Decision {
    if confidence >= AUTO_ACCEPT_CONFIDENCE {
        Decision::AutoAccept
    } else if confidence >= REVIEW_CONFIDENCE {
        Decision::Review
    } else {
        Decision::AutoReject
    }
}

/// Decision returned whenever the comparator cannot be used.
pub fn unavailable_decision() -> MatchDecision {
    MatchDecision {
        is_match: false,
        confidence: UNAVAILABLE_CONFIDENCE,
        reasoning: "Matching unavailable — manual review required.".to_string(),
        factors: MatchFactors {
            name_match: UNAVAILABLE_CONFIDENCE,
            price_match: UNAVAILABLE_CONFIDENCE,
            specs_match: UNAVAILABLE_CONFIDENCE,
            image_match: None,
        },
        degraded: true,
    }
}

pub struct MatchingEngine {
    comparator: Arc<dyn Comparator>,
    retry: RetryPolicy,
}

impl MatchingEngine {
    pub fn new(comparator: Arc<dyn Comparator>, retry: RetryPolicy) -> Self {
        Self { comparator, retry }
    }

    pub fn comparator_name(&self) -> &'static str {
        self.comparator.name()
    }

    /// Never fails: comparator errors degrade to [`unavailable_decision`].
    pub async fn match_one(&self, reference: &Product, candidate: &Candidate) -> MatchDecision {
        let result = retry_with_backoff(&self.retry, "comparator", || {
            self.comparator.compare(reference, candidate)
        })
        .await;

        match result {
            Ok(decision) => {
                let decision = normalize(decision);
                debug!(
                    comparator = self.comparator.name(),
                    marketplace = %candidate.marketplace,
                    confidence = decision.confidence,
                    "Match {} vs {}: {:.2} ({})",
                    reference.name,
                    candidate.product.name,
                    decision.confidence,
                    decision_for(decision.confidence),
                );
                decision
            }
            Err(e) => {
                warn!(
                    comparator = self.comparator.name(),
                    marketplace = %candidate.marketplace,
                    "Comparator failed for '{}': {e}",
                    candidate.product.name,
                );
                unavailable_decision()
            }
        }
    }

    /// One decision per candidate, in input order. A failed or malformed
    /// batch call falls back to the single-candidate path.
    pub async fn match_batch(&self, reference: &Product, candidates: &[Candidate]) -> Vec<MatchDecision> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let batch = retry_with_backoff(&self.retry, "comparator batch", || {
            self.comparator.compare_batch(reference, candidates)
        })
        .await;

        match batch {
            Ok(decisions) if decisions.len() == candidates.len() => {
                decisions.into_iter().map(normalize).collect()
            }
            Ok(decisions) => {
                warn!(
                    comparator = self.comparator.name(),
                    "Batch returned {} decisions for {} candidates, matching individually",
                    decisions.len(),
                    candidates.len(),
                );
                self.match_each(reference, candidates).await
            }
            Err(e) => {
                warn!(
                    comparator = self.comparator.name(),
                    "Batch matching failed: {e}, matching individually",
                );
                self.match_each(reference, candidates).await
            }
        }
    }

    async fn match_each(&self, reference: &Product, candidates: &[Candidate]) -> Vec<MatchDecision> {
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            out.push(self.match_one(reference, candidate).await);
        }
        out
    }
}

/// Clamp scores into [0,1] and derive `is_match` from the threshold policy so
/// comparators cannot disagree with it.
fn normalize(mut decision: MatchDecision) -> MatchDecision {
    if !decision.confidence.is_finite() {
        return unavailable_decision();
    }
    decision.confidence = decision.confidence.clamp(0.0, 1.0);
    decision.factors.name_match = clamp_unit(decision.factors.name_match);
    decision.factors.price_match = clamp_unit(decision.factors.price_match);
    decision.factors.specs_match = clamp_unit(decision.factors.specs_match);
    decision.factors.image_match = decision.factors.image_match.map(clamp_unit);
    decision.is_match = decision_for(decision.confidence) == Decision::AutoAccept;
    decision
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
