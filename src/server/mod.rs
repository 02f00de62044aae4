mod admin;
mod auth;
mod chat;
mod context;

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use axum::routing::{delete, get, post};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

use crate::access::AccessGate;
use crate::access::auth::AuthService;
use crate::access::whitelist::Whitelist;
use crate::chat::ConversationStore;
use crate::context::ContextStore;
use crate::error::AccessError;
use crate::identity::{self, ResolvedIdentity, SESSION_COOKIE};
use crate::llm::ProviderRegistry;

const SESSION_COOKIE_MAX_AGE: u64 = 30 * 24 * 60 * 60;

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub gate: Arc<AccessGate>,
    pub whitelist: Whitelist,
    pub conversations: ConversationStore,
    pub context: ContextStore,
    pub llm: Arc<ProviderRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/status", get(auth::status))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/api/access/status", get(chat::access_status))
        .route("/api/chat", post(chat::chat))
        .route("/api/conversations", get(chat::list_conversations))
        .route(
            "/api/conversations/:id",
            get(chat::get_conversation).delete(chat::delete_conversation),
        )
        .route(
            "/api/conversations/:id/context",
            get(context::conversation_context).post(context::attach),
        )
        .route(
            "/api/conversations/:id/context/:item_id",
            delete(context::detach),
        )
        .route("/api/projects/:id/conversations", get(chat::project_conversations))
        .route("/api/context", get(context::list).post(context::create))
        .route("/api/context/stats", get(context::stats))
        .route(
            "/api/context/:id",
            get(context::get).put(context::update).delete(context::remove),
        )
        .route("/admin/whitelist", get(admin::list).post(admin::add))
        .route("/admin/whitelist/:ip", delete(admin::remove))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Domain errors rendered as the `{ "error": ..., "free_access"?: ... }`
/// JSON contract. One status per variant.
pub struct ApiError(AccessError);

impl From<AccessError> for ApiError {
    fn from(e: AccessError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self.0 {
            AccessError::Validation(message) => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            AccessError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                json!({ "error": format!("{} not found", what) }),
            ),
            AccessError::Conflict(what) => (
                StatusCode::CONFLICT,
                json!({ "error": format!("{} already exists", what) }),
            ),
            AccessError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Authentication required" }),
            ),
            AccessError::Denied { message, quota } => (
                StatusCode::FORBIDDEN,
                json!({ "error": message, "free_access": quota }),
            ),
            AccessError::Persistence(e) => {
                error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            AccessError::Provider(message) => {
                error!("Provider error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": message }))
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Resolves the request's identity from cookies, proxy headers and the peer
/// address.
pub fn resolve_request(
    state: &AppState,
    headers: &HeaderMap,
    ConnectInfo(addr): &ConnectInfo<SocketAddr>,
) -> ResolvedIdentity {
    identity::resolve(&state.auth, headers, addr.ip())
}

/// Serializes the body and, when identity resolution minted a session token,
/// attaches the durable `session_id` cookie. Idempotent per response: the
/// cookie is set only when the request carried none.
pub fn with_session_cookie<T: Serialize>(resolved: &ResolvedIdentity, body: T) -> Response {
    attach_session_cookie(resolved, Json(body).into_response())
}

/// Attaches the durable `session_id` cookie when identity resolution minted
/// a fresh token. Idempotent per response: the cookie is set only when the
/// request carried none.
pub fn attach_session_cookie(resolved: &ResolvedIdentity, mut response: Response) -> Response {
    if let Some(token) = &resolved.fresh_session_token {
        let cookie = format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            SESSION_COOKIE, token, SESSION_COOKIE_MAX_AGE
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}
