//! HTTP layer
//!
//! axum router exposing the OpenAI-compatible chat endpoint (with SSE
//! streaming), connection management REST, and the non-streaming agent query
//! endpoint. The transport maps each StreamEvent to exactly one SSE frame;
//! orchestration itself is transport-free.

mod agent_api;
mod chat;
mod connections;

use crate::agent::Orchestrator;
use crate::error::NlqError;
use crate::manager::ConnectionManager;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub orchestrator: Arc<Orchestrator>,
}

/// NlqError mapped onto HTTP status codes for handler use.
pub struct ApiError(pub NlqError);

impl From<NlqError> for ApiError {
    fn from(err: NlqError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NlqError::NotFound(_) => StatusCode::NOT_FOUND,
            NlqError::DuplicateId(_) => StatusCode::CONFLICT,
            NlqError::ConfigInvalid(_)
            | NlqError::UnsupportedKind(_)
            | NlqError::PlanInvalid(_)
            | NlqError::Json(_) => StatusCode::BAD_REQUEST,
            NlqError::NotConnected(_) => StatusCode::CONFLICT,
            NlqError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            NlqError::ConnectFailed(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "nlq-engine",
        "capabilities": ["general_chat", "data_analysis", "kosis_integration"],
        "endpoints": {
            "chat": "/v1/chat/completions",
            "agent": "/api/agent/query",
            "connections": "/api/database/connections",
            "health": "/health"
        }
    }))
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    let stats = state.manager.stats().await;
    Json(json!({
        "status": "healthy",
        "connections": stats.total_connections,
        "active_connection": stats.active_connection,
    }))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/api/agent/query", post(agent_api::agent_query))
        .route("/api/database/supported", get(connections::supported))
        .route("/api/database/connections/test", post(connections::test_config))
        .route(
            "/api/database/connections",
            post(connections::create).get(connections::list),
        )
        .route(
            "/api/database/connections/:id",
            get(connections::get_one)
                .put(connections::update)
                .delete(connections::remove),
        )
        .route("/api/database/connections/:id/activate", put(connections::activate))
        .route("/api/database/connections/:id/deactivate", put(connections::deactivate))
        .route("/api/database/connections/:id/refresh", post(connections::refresh))
        .route("/api/database/query", post(connections::query))
        .route("/api/database/schema", get(connections::schema))
        .route("/api/database/status", get(connections::status))
        .route("/api/database/health", get(connections::health_all))
        .route("/api/database/history", get(connections::history))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("nlq-engine listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
