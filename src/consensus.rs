//! Authoritative price selection. Pure functions of the item and its listing
//! state; recomputed on every run so there is no stored "primary" flag that can
//! go stale.

use serde::Serialize;

use crate::types::{Marketplace, MarketplaceListing, PriceObservation, TrackedItem};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub authoritative_price: f64,
    /// None when the price came from the direct (non-marketplace) observation.
    pub primary_marketplace: Option<Marketplace>,
    pub lowest_ever: f64,
    pub highest_ever: f64,
    /// Tag recorded in the price history for this price.
    pub source: String,
}

/// Cheapest active listing with a known price. Ties go to the listing checked
/// most recently, then to marketplace order so the result is deterministic.
pub fn elect_primary(listings: &[MarketplaceListing]) -> Option<(&MarketplaceListing, f64)> {
    listings
        .iter()
        .filter(|l| l.is_active())
        .filter_map(|l| l.last_price.filter(|p| p.is_finite() && *p > 0.0).map(|p| (l, p)))
        .min_by(|(a, pa), (b, pb)| {
            pa.total_cmp(pb)
                .then_with(|| b.last_checked_at.cmp(&a.last_checked_at))
                .then_with(|| a.marketplace.cmp(&b.marketplace))
        })
}

/// Pick the authoritative price and fold it into the lifetime extremes.
///
/// Marketplace listings win over the direct observation; the direct
/// observation is only used when no active listing carries a price. Returns
/// None when there is nothing to resolve from.
pub fn resolve(
    item: &TrackedItem,
    listings: &[MarketplaceListing],
    direct: Option<&PriceObservation>,
) -> Option<Resolution> {
    let (price, primary, source) = match elect_primary(listings) {
        Some((listing, price)) => (price, Some(listing.marketplace), listing.marketplace.to_string()),
        None => {
            let obs = direct?;
            if !obs.price.is_finite() || obs.price <= 0.0 {
                return None;
            }
            (obs.price, None, obs.source.clone())
        }
    };

    let lowest_ever = item.lowest_price.map_or(price, |low| low.min(price));
    let highest_ever = item.highest_price.map_or(price, |high| high.max(price));

    Some(Resolution {
        authoritative_price: price,
        primary_marketplace: primary,
        lowest_ever,
        highest_ever,
        source,
    })
}

/// Item state after applying a resolution.
pub fn apply(item: &TrackedItem, resolution: &Resolution) -> TrackedItem {
    let mut next = item.clone();
    next.current_price = Some(resolution.authoritative_price);
    next.primary_marketplace = resolution.primary_marketplace;
    next.lowest_price = Some(resolution.lowest_ever);
    next.highest_price = Some(resolution.highest_ever);
    next
}
