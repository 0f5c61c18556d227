//! Per-item set of marketplace listings believed to be the tracked product,
//! and the owner decisions that move candidates in and out of it.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::consensus::elect_primary;
use crate::error::{AppError, Result};
use crate::matching::{decision_for, MatchingEngine};
use crate::source::search_url;
use crate::state::Store;
use crate::types::{
    now_ns, Candidate, Decision, ListingStatus, Marketplace, MarketplaceListing, MatchDecision,
    MatchHistoryRecord, MatchOutcome, TrackedItem,
};

/// Outcome of evaluating one candidate against an item.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateEvaluation {
    pub marketplace: Marketplace,
    pub listing_ref: String,
    pub decision: MatchDecision,
    pub outcome: MatchOutcome,
}

pub struct MarketplaceRegistry {
    store: Arc<dyn Store>,
    matcher: Arc<MatchingEngine>,
}

impl MarketplaceRegistry {
    pub fn new(store: Arc<dyn Store>, matcher: Arc<MatchingEngine>) -> Self {
        Self { store, matcher }
    }

    /// Record a candidate listing according to the match decision.
    ///
    /// Auto-accept installs the candidate as the active listing for the
    /// marketplace unless the current one was accepted with strictly higher
    /// confidence. Review, and any degraded decision, parks it as pending.
    /// Everything else is discarded. Every outcome is appended to the match
    /// history. `observed_price` seeds the listing's last price when the candidate
    /// came with one.
    pub async fn register_candidate(
        &self,
        item: &TrackedItem,
        marketplace: Marketplace,
        listing_ref: &str,
        decision: &MatchDecision,
        observed_price: Option<f64>,
    ) -> Result<MatchOutcome> {
        if listing_ref.trim().is_empty() {
            return Err(AppError::InvalidInput("listing reference must not be empty".to_string()));
        }
        if !decision.confidence.is_finite() || !(0.0..=1.0).contains(&decision.confidence) {
            return Err(AppError::InvalidInput(format!(
                "match confidence {} outside [0, 1]",
                decision.confidence
            )));
        }

        let now = now_ns();
        let mut reasoning = decision.reasoning.clone();
        // A degraded decision carries no real evidence either way; the owner decides.
        let policy = if decision.degraded { Decision::Review } else { decision_for(decision.confidence) };
        let outcome = match policy {
            Decision::AutoAccept => {
                let listings = self.store.listings(&item.id).await?;
                let incumbent = listings
                    .iter()
                    .find(|l| l.is_active() && l.marketplace == marketplace)
                    .and_then(|l| l.confidence);

                if incumbent.is_some_and(|c| c > decision.confidence) {
                    reasoning = format!("{reasoning} (kept existing listing with higher confidence)");
                    MatchOutcome::Rejected
                } else {
                    let price = observed_price.filter(|p| p.is_finite() && *p > 0.0);
                    self.store
                        .put_listing(&MarketplaceListing {
                            item_id: item.id.clone(),
                            marketplace,
                            listing_ref: listing_ref.to_string(),
                            status: ListingStatus::Active,
                            last_price: price,
                            last_checked_at: price.map(|_| now),
                            in_stock: true,
                            confidence: Some(decision.confidence),
                        })
                        .await?;
                    MatchOutcome::Accepted
                }
            }
            Decision::Review => {
                self.store
                    .put_listing(&MarketplaceListing {
                        item_id: item.id.clone(),
                        marketplace,
                        listing_ref: listing_ref.to_string(),
                        status: ListingStatus::Pending,
                        last_price: observed_price.filter(|p| p.is_finite() && *p > 0.0),
                        last_checked_at: None,
                        in_stock: true,
                        confidence: None,
                    })
                    .await?;
                MatchOutcome::Pending
            }
            Decision::AutoReject => MatchOutcome::Rejected,
        };

        self.store
            .append_match_record(&MatchHistoryRecord {
                item_id: item.id.clone(),
                marketplace,
                listing_ref: listing_ref.to_string(),
                confidence: decision.confidence,
                outcome,
                reasoning,
                recorded_at: now,
            })
            .await?;

        info!(
            item_id = %item.id,
            marketplace = %marketplace,
            confidence = decision.confidence,
            outcome = %outcome,
            "Candidate {} for '{}': {outcome} ({:.2})",
            listing_ref,
            item.name,
            decision.confidence,
        );
        Ok(outcome)
    }

    /// Match fresh candidates against the item in one batch and register each.
    pub async fn evaluate_candidates(
        &self,
        item: &TrackedItem,
        candidates: &[Candidate],
    ) -> Result<Vec<CandidateEvaluation>> {
        let decisions = self.matcher.match_batch(&item.as_product(), candidates).await;

        let mut evaluations = Vec::with_capacity(candidates.len());
        for (candidate, decision) in candidates.iter().zip(decisions) {
            let listing_ref = match candidate.product.url.as_deref().filter(|u| !u.trim().is_empty()) {
                Some(url) => url.to_string(),
                None => search_url(candidate.marketplace, &candidate.product.name)?.to_string(),
            };
            let outcome = self
                .register_candidate(item, candidate.marketplace, &listing_ref, &decision, candidate.product.price)
                .await?;
            evaluations.push(CandidateEvaluation {
                marketplace: candidate.marketplace,
                listing_ref,
                decision,
                outcome,
            });
        }
        Ok(evaluations)
    }

    /// Owner confirmation: the pending listing becomes the active one.
    pub async fn confirm_listing(&self, item_id: &str, marketplace: Marketplace) -> Result<MarketplaceListing> {
        self.require_item(item_id).await?;
        let pending = self.pending(item_id, marketplace).await?;

        let confirmed = MarketplaceListing {
            status: ListingStatus::Active,
            confidence: Some(1.0),
            ..pending
        };
        self.store.put_listing(&confirmed).await?;
        self.store.delete_listing(item_id, marketplace, ListingStatus::Pending).await?;
        self.store
            .append_match_record(&MatchHistoryRecord {
                item_id: item_id.to_string(),
                marketplace,
                listing_ref: confirmed.listing_ref.clone(),
                confidence: 1.0,
                outcome: MatchOutcome::Confirmed,
                reasoning: "Confirmed by owner".to_string(),
                recorded_at: now_ns(),
            })
            .await?;

        info!(item_id, marketplace = %marketplace, "Listing confirmed: {}", confirmed.listing_ref);
        Ok(confirmed)
    }

    /// Owner rejection: the pending listing is dropped.
    pub async fn reject_listing(&self, item_id: &str, marketplace: Marketplace) -> Result<()> {
        self.require_item(item_id).await?;
        let pending = self.pending(item_id, marketplace).await?;
        self.store.delete_listing(item_id, marketplace, ListingStatus::Pending).await?;

        // The pending listing has no confidence of its own; keep the one it was parked with.
        let parked_confidence = self
            .store
            .match_history(item_id)
            .await?
            .into_iter()
            .find(|r| r.marketplace == marketplace && r.outcome == MatchOutcome::Pending)
            .map_or(0.0, |r| r.confidence);

        self.store
            .append_match_record(&MatchHistoryRecord {
                item_id: item_id.to_string(),
                marketplace,
                listing_ref: pending.listing_ref.clone(),
                confidence: parked_confidence,
                outcome: MatchOutcome::Rejected,
                reasoning: "Rejected by owner".to_string(),
                recorded_at: now_ns(),
            })
            .await?;

        info!(item_id, marketplace = %marketplace, "Listing rejected: {}", pending.listing_ref);
        Ok(())
    }

    pub async fn set_primary(&self, item_id: &str, marketplace: Marketplace) -> Result<()> {
        self.require_item(item_id).await?;
        let listings = self.store.listings(item_id).await?;
        if !listings.iter().any(|l| l.is_active() && l.marketplace == marketplace) {
            return Err(no_active(item_id, marketplace));
        }
        self.store.set_primary(item_id, Some(marketplace)).await
    }

    /// Delete the active listing. Removing the primary re-elects one from what
    /// is left, or clears it so the item falls back to direct checking.
    pub async fn remove(&self, item_id: &str, marketplace: Marketplace) -> Result<()> {
        let item = self.require_item(item_id).await?;
        if !self.store.delete_listing(item_id, marketplace, ListingStatus::Active).await? {
            return Err(no_active(item_id, marketplace));
        }

        if item.primary_marketplace == Some(marketplace) {
            let remaining = self.store.listings(item_id).await?;
            let next = elect_primary(&remaining).map(|(l, _)| l.marketplace);
            self.store.set_primary(item_id, next).await?;
            info!(
                item_id,
                removed = %marketplace,
                "Primary listing removed; new primary: {}",
                next.map_or("none".to_string(), |m| m.to_string()),
            );
        }
        Ok(())
    }

    async fn require_item(&self, item_id: &str) -> Result<TrackedItem> {
        self.store
            .get_item(item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("item {item_id}")))
    }

    async fn pending(&self, item_id: &str, marketplace: Marketplace) -> Result<MarketplaceListing> {
        self.store
            .listings(item_id)
            .await?
            .into_iter()
            .find(|l| l.marketplace == marketplace && l.status == ListingStatus::Pending)
            .ok_or_else(|| AppError::NoPendingListing {
                item_id: item_id.to_string(),
                marketplace: marketplace.to_string(),
            })
    }
}

fn no_active(item_id: &str, marketplace: Marketplace) -> AppError {
    AppError::NoActiveListing { item_id: item_id.to_string(), marketplace: marketplace.to_string() }
}
