//! Thin `axum` surface over `braindrive-core`. Every handler translates
//! HTTP in/out of a `ToolLoop`/`JobManager` call; no domain logic lives
//! here, matching the teacher's `krusty-server` split between `AppState`
//! plumbing and route modules.

pub mod error;
pub mod provider;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use braindrive_core::provider::AiProvider;
use braindrive_core::AppContext;

/// Resolves the `AiProvider` a chat request should run against. The core
/// only depends on the trait (§4.4); wiring a concrete provider per
/// `(provider, settings_id, model)` is a deployment concern the thin HTTP
/// layer owns, the way the teacher's `create_ai_client` picks a client from
/// request-carried settings.
pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, provider: &str, settings_id: Option<&str>) -> Option<Arc<dyn AiProvider>>;
}

#[derive(Clone)]
pub struct AppState {
    pub context: Arc<AppContext>,
    pub providers: Arc<dyn ProviderResolver>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .nest("/v1", routes::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

pub async fn start_server(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "braindrive-server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
