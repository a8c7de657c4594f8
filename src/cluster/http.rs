//! HTTP Cluster Client
//!
//! Talks to the coordination service and to shard replicas over JSON/HTTP.
//! One `reqwest::Client` (and so one connection pool) per coordinator per process.

use super::client::{ClientProvider, CoordinationService, SearchClusterClient};
use super::protocol::*;
use crate::config::ClientSettings;
use crate::error::{ClientError, classify_status};
use crate::indexing::types::IndexableDocument;
use crate::topology::types::{CollectionState, ShardEndpoint};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub struct HttpClusterClient {
    http: reqwest::Client,
    coordinator_url: String,
}

impl HttpClusterClient {
    pub fn new(coordinator_url: &str, settings: &ClientSettings) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .build()
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        Ok(Self {
            http,
            coordinator_url: coordinator_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn coordinator_url(&self) -> &str {
        &self.coordinator_url
    }

    async fn post_json<T, R>(&self, url: String, payload: &T) -> Result<R, ClientError>
    where
        T: serde::Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.http.post(url).json(payload).send().await?;
        decode(response).await
    }
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        return Err(classify_status(status.as_u16(), message));
    }
    response
        .json::<R>()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))
}

#[async_trait]
impl CoordinationService for HttpClusterClient {
    async fn collection_state(
        &self,
        collection: &str,
    ) -> Result<Option<CollectionState>, ClientError> {
        let url = format!(
            "{}{}/{}",
            self.coordinator_url, ENDPOINT_COLLECTION_STATE, collection
        );
        let response = self.http.get(url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        decode(response).await.map(Some)
    }
}

#[async_trait]
impl SearchClusterClient for HttpClusterClient {
    async fn query_page(
        &self,
        endpoint: &ShardEndpoint,
        request: &PageRequest,
    ) -> Result<PageResponse, ClientError> {
        let url = collection_url(&endpoint.base_url, &request.collection, ENDPOINT_SELECT);
        tracing::trace!("POST {} (cursor {})", url, request.cursor);
        self.post_json(url, request).await
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        target: &UpdateTarget,
        docs: &[IndexableDocument],
    ) -> Result<BulkUpdateResponse, ClientError> {
        let (base_url, shard) = match target {
            UpdateTarget::Coordinator => {
                (format!("{}{}", self.coordinator_url, INDEX_PREFIX), None)
            }
            UpdateTarget::Shard(endpoint) => {
                (endpoint.base_url.clone(), Some(endpoint.shard_id.clone()))
            }
        };

        let payload = BulkUpdateRequest {
            collection: collection.to_string(),
            shard,
            docs: docs.to_vec(),
        };

        self.post_json(
            collection_url(&base_url, collection, ENDPOINT_UPDATE),
            &payload,
        )
        .await
    }

    async fn commit(&self, collection: &str) -> Result<(), ClientError> {
        let base_url = format!("{}{}", self.coordinator_url, INDEX_PREFIX);
        let response: CommitResponse = self
            .post_json(
                collection_url(&base_url, collection, ENDPOINT_COMMIT),
                &serde_json::json!({}),
            )
            .await?;

        if !response.success {
            return Err(ClientError::Server {
                status: 500,
                message: format!("commit on '{}' not acknowledged", collection),
            });
        }
        Ok(())
    }

    fn supports_shard_routing(&self) -> bool {
        true
    }
}

/// Process-local pool of HTTP clients, one per coordinator address.
pub struct HttpClientProvider {
    settings: ClientSettings,
    clients: DashMap<String, Arc<HttpClusterClient>>,
}

impl HttpClientProvider {
    pub fn new(settings: ClientSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            clients: DashMap::new(),
        })
    }

    pub fn http_client(&self, coordinator: &str) -> Result<Arc<HttpClusterClient>, ClientError> {
        if let Some(client) = self.clients.get(coordinator) {
            return Ok(client.value().clone());
        }

        let client = Arc::new(HttpClusterClient::new(coordinator, &self.settings)?);
        let client = self
            .clients
            .entry(coordinator.to_string())
            .or_insert(client)
            .value()
            .clone();

        tracing::debug!("Opened HTTP client pool for {}", coordinator);
        Ok(client)
    }

    pub fn pool_count(&self) -> usize {
        self.clients.len()
    }
}

impl ClientProvider for HttpClientProvider {
    fn client_for(&self, coordinator: &str) -> Result<Arc<dyn SearchClusterClient>, ClientError> {
        let client: Arc<dyn SearchClusterClient> = self.http_client(coordinator)?;
        Ok(client)
    }
}
