use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::latency::{FetchLatency, LatencySummary};
use crate::config::DEFAULT_HISTORY_LIMIT;
use crate::error::{AppError, Result};
use crate::registry::{CandidateEvaluation, MarketplaceRegistry};
use crate::scheduler::Reconciler;
use crate::state::{OwnerEdit, Store};
use crate::types::{
    Candidate, Marketplace, MarketplaceListing, MatchHistoryRecord, PriceHistoryEntry, RunReport, TimestampNs,
    TrackedItem,
};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub reconciler: Arc<Reconciler>,
    pub registry: Arc<MarketplaceRegistry>,
    pub latency: Arc<FetchLatency>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/reconcile", post(trigger_reconciliation))
        .route("/reconcile/cancel", post(cancel_reconciliation))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/items", get(list_items).post(create_item))
        .route("/items/:id", get(get_item).patch(update_item).delete(delete_item))
        .route("/items/:id/check", post(check_item))
        .route("/items/:id/history", get(get_item_history))
        .route("/items/:id/listings", get(get_item_listings))
        .route("/items/:id/candidates", post(evaluate_candidates))
        .route("/items/:id/matches", get(get_item_matches))
        .route("/items/:id/listings/:marketplace", axum::routing::delete(remove_listing))
        .route("/items/:id/listings/:marketplace/confirm", post(confirm_listing))
        .route("/items/:id/listings/:marketplace/reject", post(reject_listing))
        .route("/items/:id/listings/:marketplace/primary", post(set_primary))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / query types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct CreateItemRequest {
    pub owner: String,
    pub name: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub target_price: f64,
}

/// Owner-editable fields. Price fields belong to the reconciler.
#[derive(Deserialize, Default)]
pub struct UpdateItemRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub target_price: Option<f64>,
    pub tracking_enabled: Option<bool>,
    pub purchased: Option<bool>,
}

impl UpdateItemRequest {
    /// Blank URLs clear the stored value.
    fn into_edit(self) -> OwnerEdit {
        let clearable = |v: Option<String>| v.map(|u| Some(u.trim().to_string()).filter(|u| !u.is_empty()));
        OwnerEdit {
            name: self.name.map(|n| n.trim().to_string()),
            url: clearable(self.url),
            image_url: clearable(self.image_url),
            target_price: self.target_price,
            tracking_enabled: self.tracking_enabled,
            purchased: self.purchased,
        }
    }
}

#[derive(Deserialize)]
pub struct CandidatesRequest {
    pub candidates: Vec<Candidate>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub running: bool,
    pub last_started_at: Option<TimestampNs>,
    pub last_finished_at: Option<TimestampNs>,
    pub runs_completed: u64,
    pub last_report: Option<RunReport>,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub overall: LatencySummary,
    pub sources: BTreeMap<String, LatencySummary>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Runs on its own task so a disconnecting client cannot abandon a batch halfway.
async fn trigger_reconciliation(State(state): State<ApiState>) -> Result<Json<RunReport>> {
    let reconciler = Arc::clone(&state.reconciler);
    let report = tokio::spawn(async move { reconciler.run_reconciliation().await })
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))??;
    Ok(Json(report))
}

/// On-demand check of one item, outside the due window. Spawned for the same
/// reason as a full run.
async fn check_item(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<RunReport>> {
    let reconciler = Arc::clone(&state.reconciler);
    let report = tokio::spawn(async move { reconciler.check_item(&id).await })
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))??;
    Ok(Json(report))
}

async fn cancel_reconciliation(State(state): State<ApiState>) -> StatusCode {
    if state.reconciler.health().is_running() {
        state.reconciler.cancel();
        info!("Cancellation requested for the running reconciliation");
        StatusCode::ACCEPTED
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let health = state.reconciler.health();
    Json(HealthResponse {
        status: "ok",
        running: health.is_running(),
        last_started_at: health.last_started_at(),
        last_finished_at: health.last_finished_at(),
        runs_completed: health.runs_completed(),
        last_report: health.last_report(),
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    Json(LatencyResponse {
        overall: state.latency.overall(),
        sources: state.latency.sources().into_iter().collect(),
    })
}

async fn list_items(State(state): State<ApiState>) -> Result<Json<Vec<TrackedItem>>> {
    Ok(Json(state.store.tracked_items().await?))
}

async fn create_item(
    State(state): State<ApiState>,
    Json(req): Json<CreateItemRequest>,
) -> Result<(StatusCode, Json<TrackedItem>)> {
    if req.owner.trim().is_empty() {
        return Err(AppError::InvalidInput("owner must not be empty".to_string()));
    }
    let mut item = TrackedItem::new(req.owner.trim(), req.name.trim(), req.url, req.target_price);
    item.image_url = req.image_url;
    item.validate()?;

    state.store.upsert_item(&item).await?;
    info!(item_id = %item.id, "Tracking '{}' at target ${:.2}", item.name, item.target_price);
    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_item(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<TrackedItem>> {
    Ok(Json(require_item(&state, &id).await?))
}

/// Only owner fields are written; price state a concurrent run commits is kept.
async fn update_item(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateItemRequest>,
) -> Result<Json<TrackedItem>> {
    let edit = req.into_edit();
    let item = state.store.update_owner_fields(&id, &edit).await?;
    info!(item_id = %item.id, "Owner updated '{}'", item.name);
    Ok(Json(item))
}

async fn delete_item(State(state): State<ApiState>, Path(id): Path<String>) -> Result<StatusCode> {
    if state.store.delete_item(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("item {id}")))
    }
}

async fn get_item_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<PriceHistoryEntry>>> {
    require_item(&state, &id).await?;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.store.price_history(&id, limit).await?))
}

async fn get_item_listings(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MarketplaceListing>>> {
    require_item(&state, &id).await?;
    Ok(Json(state.store.listings(&id).await?))
}

async fn evaluate_candidates(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CandidatesRequest>,
) -> Result<Json<Vec<CandidateEvaluation>>> {
    let item = require_item(&state, &id).await?;
    Ok(Json(state.registry.evaluate_candidates(&item, &req.candidates).await?))
}

async fn get_item_matches(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MatchHistoryRecord>>> {
    require_item(&state, &id).await?;
    Ok(Json(state.store.match_history(&id).await?))
}

async fn confirm_listing(
    State(state): State<ApiState>,
    Path((id, marketplace)): Path<(String, String)>,
) -> Result<Json<MarketplaceListing>> {
    let marketplace: Marketplace = marketplace.parse()?;
    Ok(Json(state.registry.confirm_listing(&id, marketplace).await?))
}

async fn reject_listing(
    State(state): State<ApiState>,
    Path((id, marketplace)): Path<(String, String)>,
) -> Result<StatusCode> {
    let marketplace: Marketplace = marketplace.parse()?;
    state.registry.reject_listing(&id, marketplace).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_primary(
    State(state): State<ApiState>,
    Path((id, marketplace)): Path<(String, String)>,
) -> Result<StatusCode> {
    let marketplace: Marketplace = marketplace.parse()?;
    state.registry.set_primary(&id, marketplace).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_listing(
    State(state): State<ApiState>,
    Path((id, marketplace)): Path<(String, String)>,
) -> Result<StatusCode> {
    let marketplace: Marketplace = marketplace.parse()?;
    state.registry.remove(&id, marketplace).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn require_item(state: &ApiState, id: &str) -> Result<TrackedItem> {
    state
        .store
        .get_item(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("item {id}")))
}
