//! Standalone binary entry point, grounded on the teacher's `main.rs`:
//! init tracing from `RUST_LOG`, build `AppState`, bind `PORT`, serve.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use braindrive_core::provider::AiProvider;
use braindrive_core::store::SqliteStore;
use braindrive_core::{AppConfig, AppContext, Clock, JobManagerConfig, SystemClock};
use braindrive_server::provider::OpenAiCompatibleProvider;
use braindrive_server::{start_server, AppState, ProviderResolver};

/// Resolves a provider name (`openai`, `ollama`, ...) to a base URL via
/// env vars, the way the teacher's server reads per-feature env toggles.
/// One concrete `AiProvider` is built per distinct base URL and reused.
struct EnvProviderResolver {
    providers: HashMap<String, Arc<dyn AiProvider>>,
}

impl EnvProviderResolver {
    fn from_env() -> Self {
        let mut providers: HashMap<String, Arc<dyn AiProvider>> = HashMap::new();
        if let Ok(base_url) = std::env::var("BRAINDRIVE_OPENAI_BASE_URL") {
            let api_key = std::env::var("BRAINDRIVE_OPENAI_API_KEY").ok();
            providers.insert(
                "openai".to_string(),
                Arc::new(OpenAiCompatibleProvider::new(base_url, api_key, Duration::from_secs(60))),
            );
        }
        if let Ok(base_url) = std::env::var("BRAINDRIVE_OLLAMA_BASE_URL") {
            providers.insert(
                "ollama".to_string(),
                Arc::new(OpenAiCompatibleProvider::new(base_url, None, Duration::from_secs(120))),
            );
        }
        Self { providers }
    }
}

impl ProviderResolver for EnvProviderResolver {
    fn resolve(&self, provider: &str, _settings_id: Option<&str>) -> Option<Arc<dyn AiProvider>> {
        self.providers.get(provider).cloned()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let db_path = std::env::var("BRAINDRIVE_DB_PATH").unwrap_or_else(|_| "braindrive.sqlite3".to_string());
    let store: Arc<dyn braindrive_core::Store> = Arc::new(SqliteStore::open(&db_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let config = AppConfig {
        job_manager: JobManagerConfig::default(),
        ..AppConfig::default()
    };
    let context = Arc::new(AppContext::new(Arc::clone(&store), clock, config));
    context
        .jobs
        .register_handler(
            Arc::new(braindrive_core::handlers::ModelInstallHandler::new()),
            braindrive_core::jobs::JobTypeMeta {
                display_name: "Install Ollama model".to_string(),
                description: "Pulls a model into a local Ollama server and waits for registration".to_string(),
                payload_schema: None,
                required_permissions: None,
                default_sandbox_profile: "none".to_string(),
            },
        )?;
    context.jobs.start();

    let state = AppState {
        context,
        providers: Arc::new(EnvProviderResolver::from_env()),
    };

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    start_server(state, addr).await
}
