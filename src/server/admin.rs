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
    state.gate.require_authenticated(&resolved)?;

    let entries = state.whitelist.list().await?;
    Ok(with_session_cookie(
        &resolved,
        json!({ "whitelist": entries }),
    ))
}

#[derive(Deserialize)]
pub struct AddRequest {
    ip_address: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    added_by: String,
}

pub async fn add(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<AddRequest>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_authenticated(&resolved)?;

    let added_by = if body.added_by.is_empty() {
        "admin".to_string()
    } else {
        body.added_by
    };
    let entry = state
        .whitelist
        .add(&body.ip_address, &body.description, &added_by)
        .await?;
    Ok(attach_session_cookie(
        &resolved,
        (StatusCode::CREATED, Json(json!({ "entry": entry }))).into_response(),
    ))
}

pub async fn remove(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(ip): Path<String>,
) -> Result<Response, ApiError> {
    let resolved = resolve_request(&state, &headers, &connect_info);
    state.gate.require_authenticated(&resolved)?;

    state.whitelist.remove(&ip).await?;
    Ok(with_session_cookie(&resolved, json!({ "success": true })))
}
