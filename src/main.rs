use std::sync::Arc;

use tracing::info;

use chat_relay::agent::{Agent, EchoAgent, OllamaAgentService};
use chat_relay::config::{AgentBackend, ServerConfig};
use chat_relay::routes::router;
use chat_relay::service::gateway_service::AgentGateway;
use chat_relay::store::{InMemoryResponseStore, PgResponseStore, ResponseStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // ── Response store ────────────────────────────────────────────────────────
    let store: Arc<dyn ResponseStore> = match &config.database_url {
        Some(url) => Arc::new(PgResponseStore::connect(url, config.max_connections).await?),
        None => {
            info!("DATABASE_URL not set, keeping responses in memory");
            Arc::new(InMemoryResponseStore::new())
        }
    };

    // ── Agent ─────────────────────────────────────────────────────────────────
    let agent: Arc<dyn Agent> = match config.agent {
        AgentBackend::Ollama => {
            info!("Using Ollama model {} at {}", config.ollama_model, config.ollama_base_url);
            Arc::new(OllamaAgentService::new(&config.ollama_base_url, &config.ollama_model)?)
        }
        AgentBackend::Echo => Arc::new(EchoAgent),
    };

    let gateway = AgentGateway::new(store, agent, config.gateway.clone());
    let app = router(gateway);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
