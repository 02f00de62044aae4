use axum::Json;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;

use super::{ApiError, AppState, resolve_request, with_session_cookie};
use crate::identity::{AUTH_COOKIE, cookie_value};

pub async fn status(
    State(state): State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let resolved = resolve_request(&state, &headers, &connect_info);
    let authenticated = state
        .auth
        .is_authenticated(cookie_value(&headers, AUTH_COOKIE).as_deref());

    with_session_cookie(
        &resolved,
        json!({
            "authenticated": authenticated,
            "auth_enabled": state.auth.is_enabled(),
        }),
    )
}

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    match state.auth.login(&body.password)? {
        Some(token) => {
            let mut response =
                Json(json!({ "success": true, "message": "Login successful" })).into_response();
            let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", AUTH_COOKIE, token);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Ok(response)
        }
        None => Ok(
            Json(json!({ "success": true, "message": "Authentication disabled" })).into_response(),
        ),
    }
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state
        .auth
        .logout(cookie_value(&headers, AUTH_COOKIE).as_deref());

    let mut response = Json(json!({ "success": true, "message": "Logged out" })).into_response();
    let clear = format!("{}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax", AUTH_COOKIE);
    if let Ok(value) = HeaderValue::from_str(&clear) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}
