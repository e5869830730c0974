use std::sync::Arc;

use agora_node::{Node, NodeStats};
use agora_protocol::HealthResponse;
use agora_store::Entity;
use agora_sync::SyncRound;
use agora_types::{ContentId, EntityId};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};

use crate::error::{ServerError, ServerResult};

pub type AppState = Arc<Node>;

pub async fn health_handler(State(node): State<AppState>) -> Json<HealthResponse> {
    let peers = node.connected_peers().await.len();
    Json(HealthResponse::ok(node.id().as_str(), peers))
}

pub async fn stats_handler(State(node): State<AppState>) -> ServerResult<Json<NodeStats>> {
    Ok(Json(node.stats()?))
}

pub async fn post_handler(
    State(node): State<AppState>,
    Path(id): Path<String>,
) -> ServerResult<Json<Entity>> {
    let id = parse_entity_id(&id)?;
    node.get_entity(&id)?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("entity {id}")))
}

/// Body of a live post, fetched from peers if this node lacks it.
pub async fn post_body_handler(
    State(node): State<AppState>,
    Path(id): Path<String>,
) -> ServerResult<Response> {
    let id = parse_entity_id(&id)?;
    let body = node.get_body_by_id(&id).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

pub async fn content_handler(
    State(node): State<AppState>,
    Path(cid): Path<String>,
) -> ServerResult<Response> {
    let cid = ContentId::parse(&cid).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let body = node.get_body_by_cid(cid).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

/// Run one anti-entropy round and report what it did.
pub async fn sync_handler(State(node): State<AppState>) -> ServerResult<Json<SyncRound>> {
    Ok(Json(node.sync_now().await?))
}

fn parse_entity_id(raw: &str) -> ServerResult<EntityId> {
    EntityId::parse(raw).map_err(|e| ServerError::BadRequest(e.to_string()))
}
