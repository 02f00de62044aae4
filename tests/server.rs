use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode, header};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use tollgate::access::AccessGate;
use tollgate::access::auth::AuthService;
use tollgate::access::quota::FreeQuota;
use tollgate::access::whitelist::Whitelist;
use tollgate::chat::ConversationStore;
use tollgate::config::Config;
use tollgate::context::ContextStore;
use tollgate::llm::ProviderRegistry;
use tollgate::server::{self, AppState};

async fn app(auth_password: Option<&str>) -> Router {
    let pool = tollgate::store::connect_in_memory().await.unwrap();
    let config = Config {
        listen_addr: "127.0.0.1:0".to_string(),
        auth_password: auth_password.map(str::to_string),
        openai_api_key: None,
        anthropic_api_key: None,
        gemini_api_key: None,
        data_dir: std::path::PathBuf::from("."),
    };

    let auth = Arc::new(AuthService::new(config.auth_password.clone()));
    let whitelist = Whitelist::new(pool.clone());
    let quota = FreeQuota::new(pool.clone(), whitelist.clone());
    let gate = Arc::new(AccessGate::new(auth.clone(), quota));

    server::router(AppState {
        auth,
        gate,
        whitelist,
        conversations: ConversationStore::new(pool.clone()),
        context: ContextStore::new(pool.clone()),
        llm: Arc::new(ProviderRegistry::new(&config)),
    })
}

fn request(method: &str, uri: &str, cookie: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    let mut req = match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    // Stands in for the connection info axum::serve would provide.
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 44000))));
    req
}

fn session_cookie(response: &axum::response::Response) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .map(|v| v.to_str().unwrap().to_string())
}

#[tokio::test]
async fn access_status_mints_a_session_cookie() {
    let app = app(None).await;

    let response = app
        .oneshot(request("GET", "/api/access/status", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cookie = session_cookie(&response).expect("expected a Set-Cookie header");
    assert!(cookie.starts_with("session_id="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
}

#[tokio::test]
async fn session_cookie_is_not_reissued_when_presented() {
    let app = app(None).await;

    let response = app
        .clone()
        .oneshot(request("GET", "/api/access/status", None, None))
        .await
        .unwrap();
    let cookie = session_cookie(&response).unwrap();
    let pair = cookie.split(';').next().unwrap().to_string();

    let response = app
        .oneshot(request("GET", "/api/access/status", Some(&pair), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_cookie(&response).is_none());
}

// The admin surface participates in the same cookie contract as the rest
// of the API: a cookieless caller gets a durable session on every handler.
#[tokio::test]
async fn admin_handlers_mint_the_session_cookie_too() {
    let app = app(None).await;

    let response = app
        .clone()
        .oneshot(request("GET", "/admin/whitelist", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        session_cookie(&response)
            .is_some_and(|c| c.starts_with("session_id=")),
        "whitelist listing must mint a session cookie"
    );

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/admin/whitelist",
            None,
            Some(json!({ "ip_address": "198.51.100.9", "description": "office" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(session_cookie(&response).is_some());

    let response = app
        .oneshot(request("DELETE", "/admin/whitelist/198.51.100.9", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_cookie(&response).is_some());
}

#[tokio::test]
async fn admin_requires_auth_when_a_password_is_set() {
    let app = app(Some("hunter2")).await;

    let response = app
        .oneshot(request("GET", "/admin/whitelist", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_add_validates_and_conflicts() {
    let app = app(None).await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/admin/whitelist",
            None,
            Some(json!({ "ip_address": "not an ip" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let add = || {
        request(
            "POST",
            "/admin/whitelist",
            None,
            Some(json!({ "ip_address": "198.51.100.9" })),
        )
    };
    let response = app.clone().oneshot(add()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let response = app.clone().oneshot(add()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .oneshot(request("DELETE", "/admin/whitelist/203.0.113.200", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_needs_no_identity() {
    let app = app(None).await;
    let response = app
        .oneshot(request("GET", "/health", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_cookie(&response).is_none());
}
