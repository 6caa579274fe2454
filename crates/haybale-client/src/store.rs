//! Store HTTP client

use crate::retry::map_transport_err;
use bytes::Bytes;
use haybale_common::api::{StatsResponse, CHECKSUM_HEADER};
use haybale_common::{Error, PhotoId, Result};
use std::time::Duration;

/// Default per-request deadline
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Client for one store's HTTP interface
#[derive(Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    base: String,
}

impl StoreClient {
    /// Create a client for the store at `base` (e.g. `http://10.0.0.5:7100`)
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_DEADLINE)
            .build()
            .map_err(|e| Error::internal(format!("http client: {e}")))?;
        Ok(Self::with_client(http, base))
    }

    /// Create a client reusing an existing connection pool
    pub fn with_client(http: reqwest::Client, base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self { http, base }
    }

    /// The store's base address
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Upload a blob
    pub async fn put(&self, photo_id: PhotoId, bytes: Bytes, checksum_hex: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/put?id={photo_id}", self.base))
            .header(CHECKSUM_HEADER, checksum_hex)
            .body(bytes)
            .send()
            .await
            .map_err(map_transport_err)?;
        Self::expect_ok(response, photo_id).await?;
        Ok(())
    }

    /// Download a blob
    pub async fn get(&self, photo_id: PhotoId) -> Result<Bytes> {
        let response = self
            .http
            .get(format!("{}/get?id={photo_id}", self.base))
            .send()
            .await
            .map_err(map_transport_err)?;
        let response = Self::expect_ok(response, photo_id).await?;
        response.bytes().await.map_err(map_transport_err)
    }

    /// Tombstone a blob
    pub async fn delete(&self, photo_id: PhotoId) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/del?id={photo_id}", self.base))
            .send()
            .await
            .map_err(map_transport_err)?;
        Self::expect_ok(response, photo_id).await?;
        Ok(())
    }

    /// Ask this store to stream a blob to a peer store
    pub async fn copy_to(&self, photo_id: PhotoId, dest: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/copy?id={photo_id}&to={dest}", self.base))
            .send()
            .await
            .map_err(map_transport_err)?;
        Self::expect_ok(response, photo_id).await?;
        Ok(())
    }

    /// Fetch the store's current statistics
    pub async fn stats(&self) -> Result<StatsResponse> {
        let response = self
            .http
            .get(format!("{}/stats", self.base))
            .send()
            .await
            .map_err(map_transport_err)?;
        let response = Self::expect_ok(response, PhotoId::from_u64(0)).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    async fn expect_ok(response: reqwest::Response, photo_id: PhotoId) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::from_status(status.as_u16(), photo_id.as_u64(), &body))
    }
}
