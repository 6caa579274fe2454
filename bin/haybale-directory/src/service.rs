//! Directory HTTP service
//!
//! Leader-only routes: `/register`, `/commit`, `/mark_deleted`,
//! `/set_desired`, `/scan`. Any-replica routes: `/locate`, `/status`,
//! `/heartbeat`, `/stores`, `/sync`, `/changes`, `/photos_on_store`,
//! `/health`. Followers answer leader-only requests with 503 and the
//! current leader's address.

use crate::state::DirectoryState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use haybale_common::api::{
    ChangesResponse, CommitRequest, ErrorBody, LocateResponse, PhotoStatusResponse,
    PhotosOnStoreResponse, RegisterRequest, RegisterResponse, ScanMode, ScanRecord, ScanResponse,
    SetDesiredRequest, StoreLocation, StoresResponse, SyncRequest,
};
use haybale_common::types::now_ms;
use haybale_common::{Error, PhotoId, PhotoRecord, StoreId};
use haybale_placement::{choose_stores, PlacementInput};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Build the directory router
pub fn router(state: Arc<DirectoryState>) -> Router {
    Router::new()
        .route("/register", post(register_handler))
        .route("/commit", post(commit_handler))
        .route("/mark_deleted", post(mark_deleted_handler))
        .route("/set_desired", post(set_desired_handler))
        .route("/locate", get(locate_handler))
        .route("/status", get(status_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/stores", get(stores_handler))
        .route("/sync", post(sync_handler))
        .route("/changes", get(changes_handler))
        .route("/scan", get(scan_handler))
        .route("/photos_on_store", get(photos_on_store_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Error wrapper carrying the leader hint for not-leader rejections
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let leader = match &self.0 {
            Error::NotLeader { leader } => leader.clone(),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            leader,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct IdQuery {
    id: PhotoId,
}

#[derive(Deserialize)]
struct StoreQuery {
    store_id: StoreId,
}

#[derive(Deserialize)]
struct SinceQuery {
    since: u64,
}

#[derive(Deserialize)]
struct ScanQuery {
    mode: ScanMode,
}

/// Allocate an id and pick stores for a new upload
async fn register_handler(
    State(state): State<Arc<DirectoryState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    state.require_leader()?;

    let photo_id = state.meta.allocate_photo_id()?;
    let candidates = state.healthy_stores();
    let chosen = choose_stores(
        PlacementInput {
            size: request.size,
            margin_bytes: state.config.placement_margin_bytes,
            replicas: state.config.default_replica_count as usize,
        },
        &candidates,
        &BTreeSet::new(),
    )?;

    // Persist the skeleton so the blob is visible to status and GC-safe
    // even if the client dies before commit
    let record = PhotoRecord::new(
        photo_id,
        request.size,
        request.checksum,
        state.config.default_replica_count,
        now_ms(),
    );
    state.meta.upsert(&record)?;
    state.push_delta(vec![record]);

    let locations = resolve_addresses(&state, &chosen);
    info!(photo = %photo_id, stores = chosen.len(), "registered upload");
    Ok(Json(RegisterResponse {
        photo_id,
        locations,
    }))
}

/// Record the replica set a writer (client or replicator) achieved
async fn commit_handler(
    State(state): State<Arc<DirectoryState>>,
    Json(request): Json<CommitRequest>,
) -> Result<StatusCode, ApiError> {
    state.require_leader()?;

    let mut record = state
        .meta
        .get(request.photo_id)?
        .ok_or(Error::NotFound(request.photo_id.as_u64()))?;

    let locations: BTreeSet<StoreId> = request.locations.into_iter().collect();
    if record.locations == locations {
        // Repeated commit with the same set is a no-op
        return Ok(StatusCode::OK);
    }

    record.locations = locations;
    record.updated_at_ms = now_ms();
    state.meta.upsert(&record)?;
    debug!(photo = %request.photo_id, replicas = record.locations.len(), "committed locations");
    state.push_delta(vec![record]);
    Ok(StatusCode::OK)
}

/// Tombstone a blob in metadata; GC drains the replicas afterwards
async fn mark_deleted_handler(
    State(state): State<Arc<DirectoryState>>,
    Query(query): Query<IdQuery>,
) -> Result<StatusCode, ApiError> {
    state.require_leader()?;

    if !state.meta.mark_deleted(query.id, now_ms())? {
        return Err(Error::NotFound(query.id.as_u64()).into());
    }
    if let Some(record) = state.meta.get(query.id)? {
        state.push_delta(vec![record]);
    }
    info!(photo = %query.id, "marked deleted");
    Ok(StatusCode::OK)
}

/// Adjust the target replica count of a blob
async fn set_desired_handler(
    State(state): State<Arc<DirectoryState>>,
    Json(request): Json<SetDesiredRequest>,
) -> Result<StatusCode, ApiError> {
    state.require_leader()?;

    if request.desired_replicas == 0 || request.desired_replicas > state.config.max_replica_count {
        return Err(Error::invalid_argument(format!(
            "desired_replicas must be in 1..={}",
            state.config.max_replica_count
        ))
        .into());
    }

    let mut record = state
        .meta
        .get(request.photo_id)?
        .ok_or(Error::NotFound(request.photo_id.as_u64()))?;
    if record.desired_replicas != request.desired_replicas {
        record.desired_replicas = request.desired_replicas;
        record.updated_at_ms = now_ms();
        state.meta.upsert(&record)?;
        state.push_delta(vec![record]);
    }
    Ok(StatusCode::OK)
}

/// Healthy replica addresses for a blob
async fn locate_handler(
    State(state): State<Arc<DirectoryState>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<LocateResponse>, ApiError> {
    let record = state
        .meta
        .get(query.id)?
        .ok_or(Error::NotFound(query.id.as_u64()))?;
    if record.deleted {
        return Err(Error::NotFound(query.id.as_u64()).into());
    }

    state.record_read(query.id.as_u64());
    let healthy = state.healthy_store_ids();
    let live: Vec<StoreId> = record.healthy_locations(&healthy).into_iter().collect();
    Ok(Json(LocateResponse {
        locations: resolve_addresses(&state, &live),
    }))
}

/// Full metadata view of one blob
async fn status_handler(
    State(state): State<Arc<DirectoryState>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<PhotoStatusResponse>, ApiError> {
    let record = state
        .meta
        .get(query.id)?
        .ok_or(Error::NotFound(query.id.as_u64()))?;

    let healthy = state.healthy_store_ids();
    let live: Vec<StoreId> = record.healthy_locations(&healthy).into_iter().collect();
    let healthy_locations = resolve_addresses(&state, &live);
    Ok(Json(PhotoStatusResponse {
        record,
        healthy_locations,
    }))
}

/// Absorb a store heartbeat
async fn heartbeat_handler(
    State(state): State<Arc<DirectoryState>>,
    Json(descriptor): Json<haybale_common::StoreDescriptor>,
) -> StatusCode {
    state.absorb_heartbeat(descriptor);
    StatusCode::OK
}

/// Every known store descriptor
async fn stores_handler(State(state): State<Arc<DirectoryState>>) -> Json<StoresResponse> {
    Json(StoresResponse {
        stores: state.store_snapshot(),
    })
}

/// Apply a delta pushed by the leader
async fn sync_handler(
    State(state): State<Arc<DirectoryState>>,
    Json(request): Json<SyncRequest>,
) -> Result<StatusCode, ApiError> {
    let applied = state.meta.apply_delta(&request.records)?;
    debug!(
        received = request.records.len(),
        applied, "applied pushed delta"
    );
    Ok(StatusCode::OK)
}

/// Records changed since a watermark, for anti-entropy pulls
async fn changes_handler(
    State(state): State<Arc<DirectoryState>>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<ChangesResponse>, ApiError> {
    let records = state.meta.changed_since(query.since)?;
    Ok(Json(ChangesResponse {
        records,
        now_ms: now_ms(),
    }))
}

/// Replication scan: under- and over-replicated first, or everything
async fn scan_handler(
    State(state): State<Arc<DirectoryState>>,
    Query(query): Query<ScanQuery>,
) -> Result<Json<ScanResponse>, ApiError> {
    state.require_leader()?;

    let healthy = state.healthy_store_ids();
    let limit = state.config.scan_limit;
    let mut under = Vec::new();
    let mut over = Vec::new();
    let mut rest = Vec::new();

    state.meta.scan(|record| {
        if record.under_replicated(&healthy) {
            under.push(record);
        } else if record.over_replicated() {
            over.push(record);
        } else if query.mode == ScanMode::Full {
            rest.push(record);
        }
    })?;

    let records: Vec<ScanRecord> = under
        .into_iter()
        .chain(over)
        .chain(rest)
        .take(match query.mode {
            ScanMode::Priority => limit,
            ScanMode::Full => usize::MAX,
        })
        .map(|record| {
            let hot = state.read_rate(record.photo_id.as_u64()) > state.config.hotness_threshold;
            ScanRecord { record, hot }
        })
        .collect();

    Ok(Json(ScanResponse { records }))
}

/// Photos the directory places on one store; drives that store's GC
async fn photos_on_store_handler(
    State(state): State<Arc<DirectoryState>>,
    Query(query): Query<StoreQuery>,
) -> Result<Json<PhotosOnStoreResponse>, ApiError> {
    let photo_ids = state.meta.photos_on_store(query.store_id)?;
    Ok(Json(PhotosOnStoreResponse { photo_ids }))
}

async fn health_handler(State(state): State<Arc<DirectoryState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "role": format!("{:?}", *state.role.read()),
        "stores": state.stores.read().len(),
        "watermark": state.sync_watermark.load(Ordering::Relaxed),
    }))
}

fn resolve_addresses(state: &DirectoryState, ids: &[StoreId]) -> Vec<StoreLocation> {
    let stores = state.stores.read();
    ids.iter()
        .filter_map(|id| {
            stores.get(id).map(|d| StoreLocation {
                store_id: *id,
                address: d.address.clone(),
            })
        })
        .collect()
}
