//! Natural-language query endpoint
//!
//! Runs the orchestrator to completion and returns the aggregate result plus
//! the executed SQL as one JSON payload (no streaming).

use super::{ApiResult, AppState};
use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct AgentQueryRequest {
    pub question: String,
    #[serde(default)]
    pub connection_id: Option<String>,
}

pub async fn agent_query(
    State(state): State<AppState>,
    Json(request): Json<AgentQueryRequest>,
) -> ApiResult<Json<Value>> {
    info!("Agent query: {}", request.question);
    let aggregate = state
        .orchestrator
        .answer(&request.question, request.connection_id.as_deref())
        .await?;
    Ok(Json(json!({
        "success": aggregate.ok,
        "answer": aggregate.answer,
        "executed_sql": aggregate.executed_sql,
        "result": aggregate,
    })))
}
