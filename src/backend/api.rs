//! REST-API-as-table plumbing
//!
//! An API handler publishes a fixed set of virtual tables, each backed by one
//! endpoint. `SELECT ... FROM <table> WHERE field = value [AND ...]` picks the
//! endpoint via FROM and turns equality predicates into request parameters.
//! The JSON response is walked down a data path and flattened into rows.
//!
//! Transient network errors are not retried here; re-planning is the
//! orchestrator's call.

use super::{
    elapsed_ms, BackendKind, ColumnDescriptor, ConnectionConfig, DatabaseHandler, Query,
    QueryResult, Row, SchemaSnapshot, TableDescriptor, TestResult,
};
use crate::error::{NlqError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const API_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One virtual table and the endpoint behind it.
#[derive(Debug, Clone)]
pub struct ApiTable {
    pub name: String,
    pub url: String,
    pub method: String,
    pub description: String,
    /// Declared response columns, for schema output
    pub columns: Vec<ColumnDescriptor>,
    /// Parameters accepted as equality predicates
    pub params: Vec<String>,
    pub required_params: Vec<String>,
    /// Dot path into the response where the row data lives, e.g. "result.data"
    pub data_path: String,
}

/// Parsed form of a SQL-like query against a virtual table.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiSelect {
    pub table: String,
    /// Empty means star-projection
    pub projection: Vec<String>,
    pub predicates: Vec<(String, String)>,
    pub limit: Option<usize>,
}

/// Parse `SELECT <cols|*> FROM <table> [WHERE a = 'x' AND b = 2] [LIMIT n]`.
/// Only equality predicates joined by AND are supported.
pub fn parse_select(sql: &str) -> Result<ApiSelect> {
    let trimmed = sql.trim().trim_end_matches(';');
    let select_re = Regex::new(
        r"(?is)^\s*select\s+(?P<cols>.+?)\s+from\s+(?P<table>[a-zA-Z0-9_\.]+)(?:\s+where\s+(?P<where>.+?))?(?:\s+limit\s+(?P<limit>\d+))?\s*$",
    )
    .expect("select regex");

    let caps = select_re.captures(trimmed).ok_or_else(|| {
        NlqError::QueryFailed("only SELECT queries are supported against API tables".to_string())
    })?;

    let cols = caps.name("cols").map(|m| m.as_str().trim()).unwrap_or("*");
    let projection = if cols == "*" {
        Vec::new()
    } else {
        cols.split(',').map(|c| c.trim().to_string()).filter(|c| !c.is_empty()).collect()
    };

    let table = caps
        .name("table")
        .map(|m| m.as_str().to_lowercase())
        .ok_or_else(|| NlqError::QueryFailed("FROM clause is required".to_string()))?;

    let mut predicates = Vec::new();
    if let Some(where_clause) = caps.name("where") {
        let eq_re = Regex::new(r"(?i)\s+and\s+").expect("and regex");
        for part in eq_re.split(where_clause.as_str()) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                NlqError::QueryFailed(format!(
                    "only equality predicates are supported, got: {}",
                    part
                ))
            })?;
            let value = value.trim().trim_matches('\'').trim_matches('"').to_string();
            predicates.push((key.trim().to_string(), value));
        }
    }

    let limit = caps.name("limit").and_then(|m| m.as_str().parse().ok());

    Ok(ApiSelect { table, projection, predicates, limit })
}

/// Walk a dot path ("result.data") into a JSON response. Empty path returns
/// the value itself.
pub fn walk_data_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

/// Flatten one JSON object into a row: scalars keep their name, nested object
/// scalars get dotted names, arrays are stored serialised.
pub fn flatten_json_object(object: &serde_json::Map<String, Value>) -> Row {
    let mut row = Row::new();
    flatten_into(&mut row, "", object);
    row
}

fn flatten_into(row: &mut Row, prefix: &str, object: &serde_json::Map<String, Value>) {
    for (key, value) in object {
        let name = if prefix.is_empty() { key.clone() } else { format!("{}.{}", prefix, key) };
        match value {
            Value::Object(nested) => flatten_into(row, &name, nested),
            Value::Array(_) => {
                row.insert(name, Value::from(serde_json::to_string(value).unwrap_or_default()));
            }
            scalar => {
                row.insert(name, scalar.clone());
            }
        }
    }
}

/// Turn the extracted response payload into rows. Objects become one row;
/// arrays one row per object element.
pub fn payload_to_rows(payload: &Value) -> Vec<Row> {
    match payload {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_object().map(flatten_json_object))
            .collect(),
        Value::Object(object) => vec![flatten_json_object(object)],
        _ => Vec::new(),
    }
}

/// Build a QueryResult from flattened rows: union of observed columns,
/// missing cells null, optional projection and row limit applied.
pub fn rows_to_result(mut rows: Vec<Row>, select: &ApiSelect, execution_time_ms: u64) -> QueryResult {
    if let Some(limit) = select.limit {
        rows.truncate(limit);
    }

    if !select.projection.is_empty() {
        rows = rows
            .into_iter()
            .map(|row| {
                let mut projected = Row::new();
                for column in &select.projection {
                    projected
                        .insert(column.clone(), row.get(column).cloned().unwrap_or(Value::Null));
                }
                projected
            })
            .collect();
        return QueryResult::ok(select.projection.clone(), rows, execution_time_ms);
    }

    let mut columns: BTreeSet<String> = BTreeSet::new();
    for row in &rows {
        columns.extend(row.keys().cloned());
    }
    for row in &mut rows {
        for column in &columns {
            row.entry(column.clone()).or_insert(Value::Null);
        }
    }
    QueryResult::ok(columns.into_iter().collect(), rows, execution_time_ms)
}

/// Star-projection convenience over `rows_to_result`.
pub fn rows_to_star_result(rows: Vec<Row>, execution_time_ms: u64) -> QueryResult {
    let select = ApiSelect {
        table: String::new(),
        projection: Vec::new(),
        predicates: Vec::new(),
        limit: None,
    };
    rows_to_result(rows, &select, execution_time_ms)
}

/// Shared HTTP core for API handlers: a lazily-built client plus the virtual
/// table set.
pub struct ApiCore {
    pub tables: Vec<ApiTable>,
    client: RwLock<Option<reqwest::Client>>,
}

impl ApiCore {
    pub fn new(tables: Vec<ApiTable>) -> Self {
        Self { tables, client: RwLock::new(None) }
    }

    pub fn table(&self, name: &str) -> Option<&ApiTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub async fn connect(&self, headers: reqwest::header::HeaderMap) -> Result<()> {
        if self.client.read().await.is_some() {
            return Ok(());
        }
        let client = reqwest::Client::builder()
            .timeout(API_HTTP_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| NlqError::ConnectFailed(format!("http client: {}", e)))?;
        *self.client.write().await = Some(client);
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.client.write().await.take();
    }

    pub async fn is_connected(&self) -> bool {
        self.client.read().await.is_some()
    }

    /// Execute one endpoint call and return the extracted payload.
    pub async fn call(&self, table: &ApiTable, params: &[(String, String)]) -> Result<Value> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or_else(|| NlqError::NotConnected("api session not initialised".to_string()))?;

        debug!("API call {} {} ({} params)", table.method, table.url, params.len());
        let response = if table.method.eq_ignore_ascii_case("POST") {
            let body: serde_json::Map<String, Value> = params
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect();
            client.post(&table.url).json(&body).send().await?
        } else {
            client.get(&table.url).query(params).send().await?
        };

        let status = response.status();
        if !status.is_success() {
            return Err(NlqError::QueryFailed(format!(
                "API returned status {} for {}",
                status, table.name
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| NlqError::QueryFailed(format!("invalid JSON from API: {}", e)))?;

        walk_data_path(&body, &table.data_path)
            .cloned()
            .ok_or_else(|| {
                NlqError::QueryFailed(format!(
                    "response for {} has no data at path '{}'",
                    table.name, table.data_path
                ))
            })
    }
}

/// Generic REST handler: base URL, optional basic auth, optional API-key
/// header; virtual tables come from the connection config.
pub struct ExternalApiHandler {
    config: ConnectionConfig,
    core: ApiCore,
}

impl ExternalApiHandler {
    pub fn new(config: ConnectionConfig) -> Self {
        let base_url = config.base_url.clone().unwrap_or_default();
        let tables = config
            .tables
            .iter()
            .map(|t| ApiTable {
                name: t.name.to_lowercase(),
                url: format!("{}/{}", base_url.trim_end_matches('/'), t.path.trim_start_matches('/')),
                method: t.method.clone(),
                description: t.description.clone(),
                columns: Vec::new(),
                params: t.params.clone(),
                required_params: t.required_params.clone(),
                data_path: t.data_path.clone(),
            })
            .collect();
        Self { config, core: ApiCore::new(tables) }
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = &self.config.api_key {
            if let Ok(value) =
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        headers
    }
}

#[async_trait]
impl DatabaseHandler for ExternalApiHandler {
    fn kind(&self) -> BackendKind {
        BackendKind::ExternalApi
    }

    fn supported_operations(&self) -> Vec<String> {
        ["SELECT"].iter().map(|s| s.to_string()).collect()
    }

    async fn connect(&self) -> Result<()> {
        self.core.connect(self.headers()).await?;
        info!(
            "Connected to external API: {}",
            self.config.base_url.as_deref().unwrap_or("")
        );
        Ok(())
    }

    async fn disconnect(&self) {
        self.core.disconnect().await;
    }

    async fn is_connected(&self) -> bool {
        self.core.is_connected().await
    }

    async fn test(&self) -> TestResult {
        let start = Instant::now();
        let base_url = self.config.base_url.clone().unwrap_or_default();
        let client = match reqwest::Client::builder()
            .timeout(API_HTTP_TIMEOUT)
            .default_headers(self.headers())
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                return TestResult {
                    success: false,
                    message: format!("http client: {}", e),
                    latency_ms: elapsed_ms(start),
                    version: None,
                }
            }
        };
        match client.get(&base_url).send().await {
            Ok(response) if response.status().as_u16() < 500 => {
                let latency_ms = elapsed_ms(start);
                TestResult {
                    success: true,
                    message: format!(
                        "Connected successfully (status: {}, latency: {}ms)",
                        response.status(),
                        latency_ms
                    ),
                    latency_ms,
                    version: None,
                }
            }
            Ok(response) => TestResult {
                success: false,
                message: format!("API returned status {}", response.status()),
                latency_ms: elapsed_ms(start),
                version: None,
            },
            Err(e) => TestResult {
                success: false,
                message: format!("API unreachable: {}", e),
                latency_ms: elapsed_ms(start),
                version: None,
            },
        }
    }

    async fn schema(&self, include_columns: bool) -> Result<SchemaSnapshot> {
        let tables = self
            .core
            .tables
            .iter()
            .map(|t| TableDescriptor {
                name: t.name.clone(),
                schema_namespace: Some("api".to_string()),
                columns: if include_columns { t.columns.clone() } else { Vec::new() },
                row_count_estimate: None,
            })
            .collect();
        Ok(SchemaSnapshot { tables })
    }

    async fn execute(&self, query: Query, _params: Option<Row>) -> QueryResult {
        let start = Instant::now();
        let sql = match query.as_sql() {
            Some(sql) => sql,
            None => {
                return QueryResult::fail("api handler expects a SQL query", elapsed_ms(start))
            }
        };

        let select = match parse_select(sql) {
            Ok(select) => select,
            Err(e) => return QueryResult::fail(e.to_string(), elapsed_ms(start)),
        };

        let table = match self.core.table(&select.table) {
            Some(table) => table.clone(),
            None => {
                return QueryResult::fail(
                    format!("table '{}' not found", select.table),
                    elapsed_ms(start),
                )
            }
        };

        for required in &table.required_params {
            if !select.predicates.iter().any(|(k, _)| k == required) {
                return QueryResult::fail(
                    format!("required parameter {} missing", required),
                    elapsed_ms(start),
                );
            }
        }

        match self.core.call(&table, &select.predicates).await {
            Ok(payload) => rows_to_result(payload_to_rows(&payload), &select, elapsed_ms(start)),
            Err(e) => {
                warn!("External API call failed: {}", e);
                QueryResult::fail(e.to_string(), elapsed_ms(start))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_star_select_with_predicate() {
        let select = parse_select("SELECT * FROM statistics_search WHERE searchNm = '인구'").unwrap();
        assert_eq!(select.table, "statistics_search");
        assert!(select.projection.is_empty());
        assert_eq!(select.predicates, vec![("searchNm".to_string(), "인구".to_string())]);
        assert_eq!(select.limit, None);
    }

    #[test]
    fn test_parse_multiple_predicates_and_limit() {
        let select = parse_select(
            "select TBL_ID, TBL_NM from statistics_data where orgId = '101' AND tblId = 'DT_1B040A3' limit 10",
        )
        .unwrap();
        assert_eq!(select.table, "statistics_data");
        assert_eq!(select.projection, vec!["TBL_ID".to_string(), "TBL_NM".to_string()]);
        assert_eq!(select.predicates.len(), 2);
        assert_eq!(select.limit, Some(10));
    }

    #[test]
    fn test_parse_rejects_non_select() {
        assert!(parse_select("DELETE FROM statistics_search").is_err());
    }

    #[test]
    fn test_parse_rejects_inequality() {
        assert!(parse_select("SELECT * FROM t WHERE a > 3").is_err());
    }

    #[test]
    fn test_walk_data_path() {
        let body = serde_json::json!({"result": {"data": [{"a": 1}]}});
        let payload = walk_data_path(&body, "result.data").unwrap();
        assert!(payload.is_array());
        assert!(walk_data_path(&body, "result.missing").is_none());
    }

    #[test]
    fn test_rows_to_result_projects_and_fills_nulls() {
        let rows = payload_to_rows(&serde_json::json!([
            {"a": 1, "b": {"c": 2}},
            {"a": 3}
        ]));
        let select = ApiSelect {
            table: "t".to_string(),
            projection: Vec::new(),
            predicates: Vec::new(),
            limit: None,
        };
        let result = rows_to_result(rows, &select, 0);
        assert_eq!(result.columns, vec!["a".to_string(), "b.c".to_string()]);
        assert_eq!(result.rows[1].get("b.c"), Some(&Value::Null));
    }
}
