//! API server binary

use anyhow::Result;
use clap::Parser;
use nlq_engine::agent::{standard_tools, Orchestrator};
use nlq_engine::config::AppConfig;
use nlq_engine::llm::OpenAiClient;
use nlq_engine::manager::ConnectionManager;
use nlq_engine::server::{self, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "nlq-engine")]
#[command(about = "Natural-language query engine over heterogeneous data backends")]
struct Args {
    /// Bind host (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Connection store path (overrides CONNECTION_STORE)
    #[arg(long)]
    connection_store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = AppConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(store) = args.connection_store {
        config.connection_store = store;
    }

    if config.llm_api_key == "dummy-api-key" {
        warn!("OPENAI_API_KEY not set - LLM calls will fail");
    }
    if config.kosis_api_key.is_empty() {
        warn!("KOSIS_OPEN_API_KEY not set - KOSIS tools will be rejected upstream");
    }

    let manager = Arc::new(ConnectionManager::new(config.connection_store.clone()));
    let loaded = manager.load().await?;
    info!("Loaded {} saved connections", loaded);

    let llm = Arc::new(OpenAiClient::new(
        config.llm_api_key.clone(),
        config.llm_model.clone(),
        config.llm_base_url.clone(),
    ));
    let tools = Arc::new(standard_tools(&manager, &config.kosis_api_key));
    let orchestrator = Arc::new(Orchestrator::new(
        llm,
        Arc::clone(&manager),
        tools,
        config.reflection_budget,
    ));

    let state = AppState { manager, orchestrator };
    server::serve(state, &config.host, config.port).await
}
