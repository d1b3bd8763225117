//! Application configuration
//!
//! Environment is read once at startup; nothing else in the crate touches
//! `std::env` after this.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// OpenAI-compatible API key for the planning/answer LLM
    pub llm_api_key: String,
    /// Model name passed through to the LLM provider
    pub llm_model: String,
    /// Base URL of the chat-completions provider
    pub llm_base_url: String,
    /// KOSIS open API key (empty string when unset)
    pub kosis_api_key: String,
    pub host: String,
    pub port: u16,
    /// Where connection configs are persisted as a JSON array
    pub connection_store: PathBuf,
    /// Maximum number of plans per request
    pub reflection_budget: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            llm_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "dummy-api-key".to_string()),
            llm_model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4".to_string()),
            llm_base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            kosis_api_key: std::env::var("KOSIS_OPEN_API_KEY").unwrap_or_default(),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            connection_store: std::env::var("CONNECTION_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("connections.json")),
            reflection_budget: std::env::var("REFLECTION_BUDGET")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(3),
        }
    }
}
