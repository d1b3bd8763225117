//! Connection-management REST endpoints

use super::{ApiResult, AppState};
use crate::backend::{factory, ConnectionConfig, DocumentQuery, Query};
use crate::error::NlqError;
use axum::extract::{Path, Query as UrlQuery, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

pub async fn supported(State(_): State<AppState>) -> Json<Value> {
    let kinds: Vec<Value> = factory::supported_kinds()
        .into_iter()
        .map(|kind| {
            json!({
                "kind": kind,
                "installed": kind.installed(),
                "fields": factory::describe(kind),
            })
        })
        .collect();
    Json(json!({ "supported": kinds }))
}

pub async fn test_config(
    State(state): State<AppState>,
    Json(config): Json<ConnectionConfig>,
) -> ApiResult<Json<Value>> {
    let result = state.manager.test_config(&config).await?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

pub async fn create(
    State(state): State<AppState>,
    Json(config): Json<ConnectionConfig>,
) -> ApiResult<Json<Value>> {
    let id = state.manager.create(config).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

pub async fn list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "connections": state.manager.list().await }))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let info = state.manager.get(&id).await?;
    Ok(Json(serde_json::to_value(info).unwrap_or_default()))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<ConnectionConfig>,
) -> ApiResult<Json<Value>> {
    state.manager.update(&id, config).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn activate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.activate(&id).await?;
    Ok(Json(json!({ "success": true, "active": id })))
}

pub async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.deactivate(&id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.remove(&id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.refresh(&id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    /// SQL text or a structured document query
    pub query: Value,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Map<String, Value>>,
}

pub async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<Value>> {
    let query = match &request.query {
        Value::String(sql) => Query::Sql(sql.clone()),
        object @ Value::Object(_) => {
            let doc: DocumentQuery = serde_json::from_value(object.clone())
                .map_err(|e| NlqError::QueryFailed(format!("invalid structured query: {}", e)))?;
            Query::Document(doc)
        }
        _ => {
            return Err(NlqError::QueryFailed(
                "query must be a SQL string or a structured object".to_string(),
            )
            .into())
        }
    };

    let result = state
        .manager
        .execute(request.connection_id.as_deref(), query, request.params)
        .await?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct SchemaParams {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default = "default_true")]
    pub include_columns: bool,
}

fn default_true() -> bool {
    true
}

pub async fn schema(
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<SchemaParams>,
) -> ApiResult<Json<Value>> {
    let snapshot = state
        .manager
        .schema(params.connection_id.as_deref(), params.include_columns)
        .await?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.manager.stats().await).unwrap_or_default())
}

pub async fn health_all(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "connections": state.manager.health().await }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

pub async fn history(
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<HistoryParams>,
) -> Json<Value> {
    Json(json!({ "history": state.manager.history(params.limit).await }))
}
