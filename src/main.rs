use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tollgate::access::AccessGate;
use tollgate::access::auth::AuthService;
use tollgate::access::quota::FreeQuota;
use tollgate::access::whitelist::Whitelist;
use tollgate::chat::ConversationStore;
use tollgate::config::Config;
use tollgate::context::ContextStore;
use tollgate::llm::ProviderRegistry;
use tollgate::server::{self, AppState};
use tollgate::store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    if config.auth_password.is_none() {
        warn!("No auth password configured, running with authentication disabled");
    }

    let pool = store::connect(&config.data_dir).await?;

    let auth = Arc::new(AuthService::new(config.auth_password.clone()));
    let whitelist = Whitelist::new(pool.clone());
    let quota = FreeQuota::new(pool.clone(), whitelist.clone());
    let gate = Arc::new(AccessGate::new(auth.clone(), quota));
    let llm = Arc::new(ProviderRegistry::new(&config));
    let conversations = ConversationStore::new(pool.clone());
    let context = ContextStore::new(pool.clone());

    let state = AppState {
        auth,
        gate,
        whitelist,
        conversations,
        context,
        llm,
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Listening on {}", config.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    info!("Shutdown complete");
    Ok(())
}
