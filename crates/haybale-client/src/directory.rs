//! Directory HTTP client
//!
//! Any-replica reads try the configured addresses in order; leader-only
//! mutations follow the leader hint in not-leader rejections for a bounded
//! number of hops.

use crate::retry::{map_transport_err, with_backoff, DEFAULT_ATTEMPTS};
use haybale_common::api::{
    ChangesResponse, CommitRequest, ErrorBody, LocateResponse, PhotoStatusResponse,
    PhotosOnStoreResponse, RegisterRequest, RegisterResponse, ScanMode, ScanResponse,
    SetDesiredRequest, StoresResponse, SyncRequest,
};
use haybale_common::{Error, PhotoId, PhotoRecord, Result, StoreDescriptor, StoreId};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Default per-request deadline
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

/// Leader-hint hops to follow before giving up
const MAX_LEADER_HOPS: usize = 3;

/// Client for a directory cluster
#[derive(Clone)]
pub struct DirectoryClient {
    http: reqwest::Client,
    addresses: Vec<String>,
}

impl DirectoryClient {
    /// Create a client for the given directory addresses
    pub fn new(addresses: Vec<String>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::invalid_argument("no directory addresses configured"));
        }
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_DEADLINE)
            .build()
            .map_err(|e| Error::internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            addresses: addresses
                .into_iter()
                .map(|a| a.trim_end_matches('/').to_string())
                .collect(),
        })
    }

    /// Allocate an id and placement for an upload (leader only)
    pub async fn register(&self, size: u64, checksum: &str) -> Result<RegisterResponse> {
        let body = RegisterRequest {
            size,
            checksum: checksum.to_string(),
        };
        with_backoff("directory register", DEFAULT_ATTEMPTS, || {
            self.leader_request(Method::POST, "/register", Some(&body))
        })
        .await
    }

    /// Record the locations a client actually wrote (leader only)
    pub async fn commit(&self, photo_id: PhotoId, locations: Vec<StoreId>) -> Result<()> {
        let body = CommitRequest {
            photo_id,
            locations,
        };
        with_backoff("directory commit", DEFAULT_ATTEMPTS, || {
            self.leader_request::<_, serde_json::Value>(Method::POST, "/commit", Some(&body))
        })
        .await?;
        Ok(())
    }

    /// Mark a blob deleted (leader only)
    pub async fn mark_deleted(&self, photo_id: PhotoId) -> Result<()> {
        let path = format!("/mark_deleted?id={photo_id}");
        with_backoff("directory mark_deleted", DEFAULT_ATTEMPTS, || {
            self.leader_request::<(), serde_json::Value>(Method::POST, &path, None)
        })
        .await?;
        Ok(())
    }

    /// Adjust a blob's target replica count (leader only)
    pub async fn set_desired(&self, photo_id: PhotoId, desired_replicas: u32) -> Result<()> {
        let body = SetDesiredRequest {
            photo_id,
            desired_replicas,
        };
        with_backoff("directory set_desired", DEFAULT_ATTEMPTS, || {
            self.leader_request::<_, serde_json::Value>(Method::POST, "/set_desired", Some(&body))
        })
        .await?;
        Ok(())
    }

    /// Healthy locations of a blob (any replica)
    pub async fn locate(&self, photo_id: PhotoId) -> Result<LocateResponse> {
        self.any_request(Method::GET, &format!("/locate?id={photo_id}"))
            .await
    }

    /// Full metadata view of a blob (any replica)
    pub async fn status(&self, photo_id: PhotoId) -> Result<PhotoStatusResponse> {
        self.any_request(Method::GET, &format!("/status?id={photo_id}"))
            .await
    }

    /// All known store descriptors (any replica)
    pub async fn stores(&self) -> Result<Vec<StoreDescriptor>> {
        let response: StoresResponse = self.any_request(Method::GET, "/stores").await?;
        Ok(response.stores)
    }

    /// Announce a store's liveness and stats to every directory replica
    ///
    /// Succeeds when at least one replica accepted the heartbeat.
    pub async fn heartbeat(&self, descriptor: &StoreDescriptor) -> Result<()> {
        let mut delivered = false;
        let mut last_err = None;
        for address in &self.addresses {
            match self
                .send_to::<_, serde_json::Value>(address, Method::POST, "/heartbeat", Some(descriptor))
                .await
            {
                Ok(_) => delivered = true,
                Err(err) => {
                    debug!(%address, %err, "heartbeat delivery failed");
                    last_err = Some(err);
                }
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| Error::Unavailable("no directory reachable".into())))
        }
    }

    /// Replication scan of the metadata (leader only)
    pub async fn scan(&self, mode: ScanMode) -> Result<ScanResponse> {
        let mode = match mode {
            ScanMode::Priority => "priority",
            ScanMode::Full => "full",
        };
        let path = format!("/scan?mode={mode}");
        with_backoff("directory scan", DEFAULT_ATTEMPTS, || {
            self.leader_request::<(), ScanResponse>(Method::GET, &path, None)
        })
        .await
    }

    /// Photos the directory places on a given store (any replica)
    pub async fn photos_on_store(&self, store_id: StoreId) -> Result<Vec<u64>> {
        let response: PhotosOnStoreResponse = self
            .any_request(Method::GET, &format!("/photos_on_store?store_id={store_id}"))
            .await?;
        Ok(response.photo_ids)
    }

    /// Records changed after a watermark, pulled from a specific address
    ///
    /// Used by follower anti-entropy, which already knows the leader.
    pub async fn changes_from(&self, address: &str, since_ms: u64) -> Result<ChangesResponse> {
        self.send_to::<(), _>(
            address,
            Method::GET,
            &format!("/changes?since={since_ms}"),
            None,
        )
        .await
    }

    /// Push a metadata delta to a follower
    pub async fn sync_to(&self, address: &str, records: Vec<PhotoRecord>) -> Result<()> {
        let body = SyncRequest { records };
        self.send_to::<_, serde_json::Value>(address, Method::POST, "/sync", Some(&body))
            .await?;
        Ok(())
    }

    /// Try each replica in order; first success wins
    async fn any_request<Resp: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
    ) -> Result<Resp> {
        let mut last_err = None;
        for address in &self.addresses {
            match self.send_to::<(), Resp>(address, method.clone(), path, None).await {
                Ok(response) => return Ok(response),
                // Only transport-level failures fall through to the next
                // replica; application errors are authoritative
                Err(err) if err.is_retryable() => {
                    debug!(%address, %err, "directory replica unreachable");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Unavailable("no directory reachable".into())))
    }

    /// Find and call the leader, following not-leader hints
    async fn leader_request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Req>,
    ) -> Result<Resp> {
        let mut candidates: Vec<String> = self.addresses.clone();
        let mut hops = 0;
        let mut last_err = None;

        while let Some(address) = candidates.first().cloned() {
            candidates.remove(0);
            match self.send_to(&address, method.clone(), path, body).await {
                Ok(response) => return Ok(response),
                Err(Error::NotLeader { leader }) => {
                    if let Some(leader) = leader {
                        if hops < MAX_LEADER_HOPS && leader != address {
                            debug!(%address, %leader, "following leader hint");
                            hops += 1;
                            candidates.insert(0, leader);
                            continue;
                        }
                    }
                    last_err = Some(Error::NotLeader { leader: None });
                }
                Err(err) if err.is_retryable() => {
                    debug!(%address, %err, "directory replica unreachable");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Unavailable("no directory leader found".into())))
    }

    async fn send_to<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        address: &str,
        method: Method,
        path: &str,
        body: Option<&Req>,
    ) -> Result<Resp> {
        let url = format!("{}{path}", address.trim_end_matches('/'));
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(map_transport_err)?;
        let status = response.status();

        if status.is_success() {
            let body = response.bytes().await.map_err(map_transport_err)?;
            // Mutation endpoints acknowledge with an empty 200
            let body: &[u8] = if body.is_empty() { b"null" } else { &body };
            return serde_json::from_slice(body).map_err(|e| Error::Serialization(e.to_string()));
        }

        let body_text = response.text().await.unwrap_or_default();
        // A not-leader rejection carries the leader address in the body
        if status.as_u16() == 503 {
            if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&body_text) {
                if parsed.leader.is_some() || parsed.error.contains("leader") {
                    return Err(Error::NotLeader {
                        leader: parsed.leader,
                    });
                }
            }
        }
        Err(Error::from_status(status.as_u16(), 0, &body_text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_register_follows_leader_hint() {
        let leader_addr = spawn(Router::new().route(
            "/register",
            post(|| async {
                Json(RegisterResponse {
                    photo_id: haybale_common::PhotoId::from_u64(7),
                    locations: vec![],
                })
            }),
        ))
        .await;

        let hint = leader_addr.clone();
        let follower_addr = spawn(Router::new().route(
            "/register",
            post(move || async move {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorBody {
                        error: "not the directory leader".into(),
                        leader: Some(hint),
                    }),
                )
            }),
        ))
        .await;

        // Only the follower is configured; the hint leads to the leader
        let client = DirectoryClient::new(vec![follower_addr]).unwrap();
        let response = client.register(5, "ab").await.unwrap();
        assert_eq!(response.photo_id.as_u64(), 7);
    }

    #[tokio::test]
    async fn test_locate_maps_404_to_not_found() {
        let addr = spawn(Router::new().route(
            "/locate",
            get(|| async { (StatusCode::NOT_FOUND, "no such photo") }),
        ))
        .await;

        let client = DirectoryClient::new(vec![addr]).unwrap();
        let err = client
            .locate(haybale_common::PhotoId::from_u64(1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_replica_falls_through() {
        let alive = spawn(Router::new().route(
            "/stores",
            get(|| async {
                Json(StoresResponse { stores: vec![] })
            }),
        ))
        .await;

        // First address refuses connections; the second answers
        let client =
            DirectoryClient::new(vec!["http://127.0.0.1:1".into(), alive]).unwrap();
        assert!(client.stores().await.unwrap().is_empty());
    }
}
