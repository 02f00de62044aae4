use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;

use super::{ApiError, AppState, attach_session_cookie, resolve_request, with_session_cookie};

pub async fn list(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    let items = state.context.list(&resolved.identity).await?;
    Ok(with_session_cookie(&resolved, json!({ "context_items": items })))
}

#[derive(Deserialize)]
pub struct CreateRequest {
    name: String,
    #[serde(default = "default_content_type")]
    content_type: String,
    content_text: String,
    description: Option<String>,
    source: Option<String>,
}

fn default_content_type() -> String {
    "text".to_string()
}

pub async fn create(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateRequest>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    let item = state
        .context
        .create(
            &resolved.identity,
            &body.name,
            body.description.as_deref(),
            &body.content_type,
            &body.content_text,
            body.source.as_deref(),
        )
        .await?;
    Ok(attach_session_cookie(
        &resolved,
        (StatusCode::CREATED, Json(json!({ "item": item }))).into_response(),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    let item = state.context.get(&resolved.identity, &id).await?;
    Ok(with_session_cookie(&resolved, json!({ "item": item })))
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    name: Option<String>,
    description: Option<String>,
    content_text: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateRequest>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    let item = state
        .context
        .update(
            &resolved.identity,
            &id,
            body.name.as_deref(),
            body.description.as_deref(),
            body.content_text.as_deref(),
        )
        .await?;
    Ok(with_session_cookie(&resolved, json!({ "item": item })))
}

pub async fn remove(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    state.context.delete(&resolved.identity, &id).await?;
    Ok(with_session_cookie(&resolved, json!({ "success": true })))
}

pub async fn stats(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    let stats = state.context.stats(&resolved.identity).await?;
    Ok(with_session_cookie(&resolved, json!({ "stats": stats })))
}

#[derive(Deserialize)]
pub struct AttachRequest {
    context_item_id: String,
    #[serde(default = "default_relevance")]
    relevance_score: f64,
}

fn default_relevance() -> f64 {
    1.0
}

pub async fn attach(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<AttachRequest>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    // Both sides must belong to the caller.
    let conversation = state
        .conversations
        .get(&resolved.identity, &conversation_id)
        .await?;
    state
        .context
        .attach(
            &resolved.identity,
            &conversation.id,
            &body.context_item_id,
            body.relevance_score,
        )
        .await?;
    Ok(with_session_cookie(&resolved, json!({ "success": true })))
}

pub async fn detach(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((conversation_id, item_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    let conversation = state
        .conversations
        .get(&resolved.identity, &conversation_id)
        .await?;
    state.context.detach(&conversation.id, &item_id).await?;
    Ok(with_session_cookie(&resolved, json!({ "success": true })))
}

pub async fn conversation_context(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_access(&resolved).await?;

    let conversation = state
        .conversations
        .get(&resolved.identity, &conversation_id)
        .await?;
    let context = state.context.conversation_context(&conversation.id).await?;
    Ok(with_session_cookie(&resolved, json!({ "context": context })))
}
