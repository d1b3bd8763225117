//! Backend handler layer
//!
//! Every data source (SQL engines, the document store, REST APIs) sits
//! behind the same `DatabaseHandler` contract. Handlers never propagate
//! errors from `execute`; failures come back as `QueryResult` with
//! `success = false` so the orchestrator can decide what to do.

pub mod api;
pub mod factory;
pub mod kosis;
pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type Row = serde_json::Map<String, Value>;

/// Closed set of backend kinds. Adding a backend is a code change, not a
/// runtime registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Mysql,
    Postgresql,
    Mongodb,
    Sqlite,
    KosisApi,
    ExternalApi,
    Redis,
    Oracle,
    Mssql,
}

impl BackendKind {
    pub const ALL: [BackendKind; 9] = [
        BackendKind::Mysql,
        BackendKind::Postgresql,
        BackendKind::Mongodb,
        BackendKind::Sqlite,
        BackendKind::KosisApi,
        BackendKind::ExternalApi,
        BackendKind::Redis,
        BackendKind::Oracle,
        BackendKind::Mssql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Mysql => "mysql",
            BackendKind::Postgresql => "postgresql",
            BackendKind::Mongodb => "mongodb",
            BackendKind::Sqlite => "sqlite",
            BackendKind::KosisApi => "kosis_api",
            BackendKind::ExternalApi => "external_api",
            BackendKind::Redis => "redis",
            BackendKind::Oracle => "oracle",
            BackendKind::Mssql => "mssql",
        }
    }

    /// Whether a handler for this kind is installed in this build. The other
    /// kinds still show up in `describe` output so the UI can render them.
    pub fn installed(&self) -> bool {
        !matches!(self, BackendKind::Redis | BackendKind::Oracle | BackendKind::Mssql)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqliteMode {
    Readonly,
    Readwrite,
    Readwritecreate,
}

impl Default for SqliteMode {
    fn default() -> Self {
        SqliteMode::Readwrite
    }
}

/// A virtual table declared in an `external_api` connection config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTableConfig {
    pub name: String,
    /// Path appended to the connection's base URL
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub description: String,
    /// Parameters accepted as equality predicates
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Dot path into the JSON response where row data lives, e.g. "result.data"
    #[serde(default)]
    pub data_path: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Immutable connection settings. One flat record for every kind; which
/// fields matter is decided per kind by the factory's validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    /// Schema namespace for relational backends (postgres defaults to "public")
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default, alias = "connectionString")]
    pub connection_string: Option<String>,
    #[serde(default, alias = "authSource")]
    pub auth_source: Option<String>,
    #[serde(default, alias = "filePath")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub mode: Option<SqliteMode>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Virtual tables for `external_api` connections
    #[serde(default)]
    pub tables: Vec<ApiTableConfig>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Configured,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Tabular result of any handler operation. When `success` is true every row
/// carries a value (possibly null) for every listed column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn ok(columns: Vec<String>, rows: Vec<Row>, execution_time_ms: u64) -> Self {
        let row_count = rows.len();
        Self { success: true, columns, rows, row_count, execution_time_ms, error: None }
    }

    pub fn fail(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            execution_time_ms,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_string: String,
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_namespace: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count_estimate: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableDescriptor>,
}

impl SchemaSnapshot {
    /// Compact text rendering handed to the LLM during planning.
    pub fn summary(&self) -> String {
        if self.tables.is_empty() {
            return "none".to_string();
        }
        let mut parts = Vec::new();
        for table in &self.tables {
            let mut line = match &table.schema_namespace {
                Some(ns) => format!("- {}.{}", ns, table.name),
                None => format!("- {}", table.name),
            };
            if let Some(estimate) = table.row_count_estimate {
                line.push_str(&format!(" (~{} rows)", estimate));
            }
            if !table.columns.is_empty() {
                let cols: Vec<String> = table
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.type_string))
                    .collect();
                line.push_str(&format!(": {}", cols.join(", ")));
            }
            parts.push(line);
        }
        parts.join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub message: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Structured query for the document handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentQuery {
    #[serde(default = "default_operation")]
    pub operation: String,
    pub collection: String,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub projection: Option<Value>,
    #[serde(default)]
    pub pipeline: Option<Vec<Value>>,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn default_operation() -> String {
    "find".to_string()
}

/// Query input accepted by `execute`. SQL handlers take the text form; the
/// document handler takes the structured form (and will parse a JSON string
/// into it as a convenience).
#[derive(Debug, Clone)]
pub enum Query {
    Sql(String),
    Document(DocumentQuery),
}

impl Query {
    pub fn as_sql(&self) -> Option<&str> {
        match self {
            Query::Sql(sql) => Some(sql),
            Query::Document(_) => None,
        }
    }
}

/// The uniform query contract. Handlers guard their own driver-level state,
/// so every method takes `&self` and instances are safe to share across
/// requests.
#[async_trait]
pub trait DatabaseHandler: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Informational verb set, e.g. SELECT/INSERT for relational backends.
    fn supported_operations(&self) -> Vec<String>;

    async fn connect(&self) -> Result<()>;

    /// Idempotent; disconnecting a disconnected handler is a no-op.
    async fn disconnect(&self);

    async fn is_connected(&self) -> bool;

    /// Cheap round-trip without persisting anything.
    async fn test(&self) -> TestResult;

    /// With `include_columns = false` the handler must not issue per-column
    /// metadata queries; it returns a fast table list instead.
    async fn schema(&self, include_columns: bool) -> Result<SchemaSnapshot>;

    async fn execute(&self, query: Query, params: Option<Row>) -> QueryResult;
}

pub(crate) fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Rewrite `:name` placeholders into driver placeholders in the order they
/// appear in the SQL, collecting bind values in that same order. Names not
/// present in the params map are left untouched.
pub(crate) fn rewrite_named_params<F>(sql: &str, params: &Row, placeholder: F) -> (String, Vec<Value>)
where
    F: Fn(usize) -> String,
{
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == ':'
            && i + 1 < chars.len()
            && (chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_')
        {
            let mut j = i + 1;
            while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            let name: String = chars[i + 1..j].iter().collect();
            if let Some(value) = params.get(&name) {
                values.push(value.clone());
                out.push_str(&placeholder(values.len()));
                i = j;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    (out, values)
}
