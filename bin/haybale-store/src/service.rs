//! Store HTTP service
//!
//! Routes: `POST /put?id=`, `GET /get?id=`, `DELETE /del?id=`,
//! `GET /stats`, `POST /copy?id=&to=`, `GET /health`. Disk work runs on
//! the blocking pool; the cache is populated on successful writes and
//! invalidated on deletes, always best-effort.

use crate::rate_limit::RateLimiter;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use haybale_client::StoreClient;
use haybale_common::api::{ErrorBody, StatsResponse, CHECKSUM_HEADER};
use haybale_common::ops_window::OpsWindow;
use haybale_common::{checksum, Error, PhotoId, StoreId};
use haybale_coord::BlobCache;
use haybale_volume::StoreEngine;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Shared state of the store daemon
pub struct StoreState {
    /// This store's identity
    pub store_id: StoreId,
    /// Address advertised to the directory
    pub advertise_addr: String,
    /// Volume engine
    pub engine: Arc<StoreEngine>,
    /// Blob byte cache
    pub cache: Arc<BlobCache>,
    /// Request counter feeding the heartbeat
    pub ops: Arc<OpsWindow>,
    /// Per-source write limiter
    pub limiter: RateLimiter,
}

/// Build the store router
pub fn router(state: Arc<StoreState>) -> Router {
    Router::new()
        .route("/put", post(put_handler))
        .route("/get", get(get_handler))
        .route("/del", delete(del_handler))
        .route("/stats", get(stats_handler))
        .route("/copy", post(copy_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Error wrapper mapping the common error type onto HTTP responses
#[derive(Debug)]
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.to_string(),
            leader: None,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct IdQuery {
    id: PhotoId,
}

#[derive(Deserialize)]
struct CopyQuery {
    id: PhotoId,
    to: String,
}

async fn put_handler(
    State(state): State<Arc<StoreState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<IdQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.ops.record();
    if !state.limiter.check(peer.ip()) {
        return Err(Error::RateLimited.into());
    }

    // The uploader's digest is the contract; compute it ourselves when the
    // header is absent
    let checksum_hex = match headers.get(CHECKSUM_HEADER).and_then(|v| v.to_str().ok()) {
        Some(provided) => provided.to_string(),
        None => checksum::sha256_hex(&body),
    };

    let engine = Arc::clone(&state.engine);
    let payload = body.clone();
    tokio::task::spawn_blocking(move || engine.put(query.id, payload, &checksum_hex))
        .await
        .map_err(|e| Error::internal(format!("put task: {e}")))??;

    // Push-on-write so a read of a fresh upload hits the cache
    state.cache.put(query.id, &body).await;
    Ok(StatusCode::OK)
}

async fn get_handler(
    State(state): State<Arc<StoreState>>,
    Query(query): Query<IdQuery>,
) -> Result<Bytes, ApiError> {
    state.ops.record();
    let engine = Arc::clone(&state.engine);
    let bytes = tokio::task::spawn_blocking(move || engine.get(query.id))
        .await
        .map_err(|e| Error::internal(format!("get task: {e}")))??;
    Ok(bytes)
}

async fn del_handler(
    State(state): State<Arc<StoreState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<IdQuery>,
) -> Result<StatusCode, ApiError> {
    state.ops.record();
    if !state.limiter.check(peer.ip()) {
        return Err(Error::RateLimited.into());
    }

    let engine = Arc::clone(&state.engine);
    tokio::task::spawn_blocking(move || engine.delete(query.id))
        .await
        .map_err(|e| Error::internal(format!("delete task: {e}")))??;

    state.cache.invalidate(query.id).await;
    Ok(StatusCode::OK)
}

async fn stats_handler(State(state): State<Arc<StoreState>>) -> Json<StatsResponse> {
    let mut stats = state.engine.stats();
    stats.ops_60s = state.ops.count();
    Json(StatsResponse {
        store_id: state.store_id,
        stats,
    })
}

/// Stream a local blob to a peer store, on behalf of the replication manager
async fn copy_handler(
    State(state): State<Arc<StoreState>>,
    Query(query): Query<CopyQuery>,
) -> Result<StatusCode, ApiError> {
    state.ops.record();

    let engine = Arc::clone(&state.engine);
    let bytes = tokio::task::spawn_blocking(move || engine.get(query.id))
        .await
        .map_err(|e| Error::internal(format!("copy read task: {e}")))??;

    let digest = checksum::sha256_hex(&bytes);
    let peer = StoreClient::new(&query.to)?;
    peer.put(query.id, bytes, &digest).await?;

    info!(photo = %query.id, dest = %query.to, "copied blob to peer");
    Ok(StatusCode::OK)
}

async fn health_handler() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use haybale_coord::MemoryBackend;
    use haybale_volume::EngineConfig;
    use std::time::Duration;

    fn test_state(dir: &std::path::Path) -> Arc<StoreState> {
        let engine = StoreEngine::open(EngineConfig {
            data_dir: dir.to_path_buf(),
            max_volume_size: 1024 * 1024,
            capacity_bytes: 16 * 1024 * 1024,
            free_bytes_floor: 0,
            compaction_efficiency_threshold: 0.6,
        })
        .unwrap();
        Arc::new(StoreState {
            store_id: StoreId::new(),
            advertise_addr: "http://127.0.0.1:7100".into(),
            engine: Arc::new(engine),
            cache: Arc::new(BlobCache::new(MemoryBackend::new(), Duration::from_secs(60))),
            ops: Arc::new(OpsWindow::new()),
            limiter: RateLimiter::new(100, 100),
        })
    }

    #[tokio::test]
    async fn test_put_populates_cache_and_get_serves() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let id = PhotoId::from_u64(42);

        let body = Bytes::from_static(b"HELLO");
        let mut headers = HeaderMap::new();
        headers.insert(
            CHECKSUM_HEADER,
            checksum::sha256_hex(&body).parse().unwrap(),
        );

        let status = put_handler(
            State(state.clone()),
            ConnectInfo(peer),
            Query(IdQuery { id }),
            headers,
            body.clone(),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);

        assert_eq!(state.cache.get(id).await.unwrap(), body);
        let served = get_handler(State(state.clone()), Query(IdQuery { id }))
            .await
            .unwrap();
        assert_eq!(served, body);
    }

    #[tokio::test]
    async fn test_del_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let id = PhotoId::from_u64(7);

        let body = Bytes::from_static(b"X");
        put_handler(
            State(state.clone()),
            ConnectInfo(peer),
            Query(IdQuery { id }),
            HeaderMap::new(),
            body,
        )
        .await
        .unwrap();
        assert!(state.cache.get(id).await.is_some());

        del_handler(State(state.clone()), ConnectInfo(peer), Query(IdQuery { id }))
            .await
            .unwrap();
        assert!(state.cache.get(id).await.is_none());
        assert!(get_handler(State(state), Query(IdQuery { id })).await.is_err());
    }

    #[tokio::test]
    async fn test_rate_limited_put_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = test_state(dir.path());
        Arc::get_mut(&mut state).unwrap().limiter = RateLimiter::new(1, 1);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let ok = put_handler(
            State(state.clone()),
            ConnectInfo(peer),
            Query(IdQuery {
                id: PhotoId::from_u64(1),
            }),
            HeaderMap::new(),
            Bytes::from_static(b"a"),
        )
        .await;
        assert!(ok.is_ok());

        let limited = put_handler(
            State(state),
            ConnectInfo(peer),
            Query(IdQuery {
                id: PhotoId::from_u64(2),
            }),
            HeaderMap::new(),
            Bytes::from_static(b"b"),
        )
        .await;
        assert!(matches!(limited, Err(ApiError(Error::RateLimited))));
    }

    #[tokio::test]
    async fn test_put_with_wrong_checksum_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(CHECKSUM_HEADER, "deadbeef".parse().unwrap());
        let result = put_handler(
            State(state),
            ConnectInfo(peer),
            Query(IdQuery {
                id: PhotoId::from_u64(1),
            }),
            headers,
            Bytes::from_static(b"data"),
        )
        .await;
        assert!(matches!(
            result,
            Err(ApiError(Error::ChecksumMismatch { .. }))
        ));
    }
}
