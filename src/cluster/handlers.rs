use super::memory::InMemoryCluster;
use super::protocol::{
    BulkUpdateRequest, BulkUpdateResponse, CommitResponse, ENDPOINT_COLLECTION_STATE,
    ENDPOINT_COMMIT, ENDPOINT_SELECT, ENDPOINT_UPDATE, ErrorResponse, INDEX_PREFIX, PageRequest,
    PageResponse, UpdateTarget,
};
use crate::error::ClientError;
use crate::topology::types::{CollectionState, ShardEndpoint};

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

type HandlerError = (StatusCode, Json<ErrorResponse>);

/// Serves an in-memory cluster: coordination reads plus shard select/update/commit.
pub fn router(cluster: Arc<InMemoryCluster>) -> Router {
    let collection_route = |endpoint: &str| format!("{}/:collection/{}", INDEX_PREFIX, endpoint);

    Router::new()
        .route(
            &format!("{}/:name", ENDPOINT_COLLECTION_STATE),
            get(handle_collection_state),
        )
        .route(&collection_route(ENDPOINT_SELECT), post(handle_select))
        .route(&collection_route(ENDPOINT_UPDATE), post(handle_update))
        .route(&collection_route(ENDPOINT_COMMIT), post(handle_commit))
        .layer(Extension(cluster))
}

fn error_response(err: ClientError) -> HandlerError {
    let status = match &err {
        ClientError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ClientError::Connect(_) => StatusCode::SERVICE_UNAVAILABLE,
        ClientError::Server { status, .. } | ClientError::Rejected { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        ClientError::Decode(_) => StatusCode::BAD_REQUEST,
        ClientError::UnknownCollection(_) => StatusCode::NOT_FOUND,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub async fn handle_collection_state(
    Extension(cluster): Extension<Arc<InMemoryCluster>>,
    Path(name): Path<String>,
) -> Result<Json<CollectionState>, HandlerError> {
    match cluster.state(&name) {
        Some(state) => Ok(Json(state)),
        None => Err(error_response(ClientError::UnknownCollection(name))),
    }
}

pub async fn handle_select(
    Extension(cluster): Extension<Arc<InMemoryCluster>>,
    Path(collection): Path<String>,
    Json(mut request): Json<PageRequest>,
) -> Result<Json<PageResponse>, HandlerError> {
    request.collection = collection;
    tracing::trace!(
        "select on {}/{} cursor={}",
        request.collection,
        request.shard,
        request.cursor
    );

    cluster
        .select(&request)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn handle_update(
    Extension(cluster): Extension<Arc<InMemoryCluster>>,
    Path(collection): Path<String>,
    Json(request): Json<BulkUpdateRequest>,
) -> Result<Json<BulkUpdateResponse>, HandlerError> {
    let target = match request.shard {
        Some(shard_id) => UpdateTarget::Shard(ShardEndpoint {
            shard_id,
            replica_id: String::new(),
            base_url: cluster.base_url().to_string(),
            leader: true,
        }),
        None => UpdateTarget::Coordinator,
    };

    match cluster.upsert(&collection, &target, &request.docs) {
        Ok(response) => {
            tracing::debug!(
                "Accepted {} docs into '{}' ({} rejected)",
                response.accepted,
                collection,
                response.rejected.len()
            );
            Ok(Json(response))
        }
        Err(e) => {
            tracing::warn!("Update on '{}' failed: {}", collection, e);
            Err(error_response(e))
        }
    }
}

pub async fn handle_commit(
    Extension(cluster): Extension<Arc<InMemoryCluster>>,
    Path(collection): Path<String>,
) -> Result<Json<CommitResponse>, HandlerError> {
    cluster
        .commit_all(&collection)
        .map(|_| Json(CommitResponse { success: true }))
        .map_err(error_response)
}
