//! SQLite handler
//!
//! File-backed databases opened through a sqlx pool. The config `mode` maps
//! onto read-only / read-write / create-if-missing open flags.

use super::{
    elapsed_ms, BackendKind, ColumnDescriptor, ConnectionConfig, DatabaseHandler, Query,
    QueryResult, Row, SchemaSnapshot, SqliteMode, TableDescriptor, TestResult,
};
use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as SqlxRow, SqlitePool, TypeInfo};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct SqliteHandler {
    config: ConnectionConfig,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteHandler {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config, pool: RwLock::new(None) }
    }

    fn open_options(&self) -> Result<SqliteConnectOptions> {
        let path = self
            .config
            .file_path
            .as_deref()
            .ok_or_else(|| NlqError::ConfigInvalid("missing required fields: filePath".to_string()))?;
        let mode = self.config.mode.unwrap_or_default();
        Ok(SqliteConnectOptions::new()
            .filename(path)
            .read_only(mode == SqliteMode::Readonly)
            .create_if_missing(mode == SqliteMode::Readwritecreate))
    }

    async fn acquire_pool(&self) -> Result<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| NlqError::NotConnected(self.config.id.clone()))
    }

    async fn table_columns(&self, pool: &SqlitePool, table: &str) -> Result<Vec<ColumnDescriptor>> {
        // PRAGMA table_info: cid, name, type, notnull, dflt_value, pk
        let rows = sqlx::query(&format!("PRAGMA table_info(\"{}\")", table.replace('"', "")))
            .fetch_all(pool)
            .await
            .map_err(|e| NlqError::QueryFailed(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| ColumnDescriptor {
                name: row.try_get::<String, _>(1).unwrap_or_default(),
                type_string: row.try_get::<String, _>(2).unwrap_or_default(),
                nullable: row.try_get::<i64, _>(3).map(|v| v == 0).unwrap_or(true),
                primary_key: row.try_get::<i64, _>(5).map(|v| v > 0).unwrap_or(false),
            })
            .collect())
    }
}

fn sqlite_cell_to_json(row: &SqliteRow, index: usize) -> Value {
    use sqlx::ValueRef;
    let raw = match row.try_get_raw(index) {
        Ok(raw) => raw,
        Err(_) => return Value::Null,
    };
    if raw.is_null() {
        return Value::Null;
    }
    let type_name = raw.type_info().name().to_string();
    drop(raw);

    match type_name.as_str() {
        "BOOLEAN" => row.try_get::<bool, _>(index).map(Value::from).unwrap_or(Value::Null),
        "INTEGER" => row.try_get::<i64, _>(index).map(Value::from).unwrap_or(Value::Null),
        "REAL" | "NUMERIC" => row.try_get::<f64, _>(index).map(Value::from).unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(index)
            .map(Value::from)
            .or_else(|_| row.try_get::<i64, _>(index).map(Value::from))
            .or_else(|_| row.try_get::<f64, _>(index).map(Value::from))
            .unwrap_or(Value::Null),
    }
}

fn sqlite_row_to_json(row: &SqliteRow) -> Row {
    let mut map = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), sqlite_cell_to_json(row, index));
    }
    map
}

fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    values: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for value in values {
        query = match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
            Value::Number(n) => query.bind(n.as_f64()),
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn is_row_returning(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH") || upper.starts_with("PRAGMA")
}

#[async_trait]
impl DatabaseHandler for SqliteHandler {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn supported_operations(&self) -> Vec<String> {
        ["SELECT", "INSERT", "UPDATE", "DELETE", "AGGREGATE"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn connect(&self) -> Result<()> {
        if self.pool.read().await.is_some() {
            return Ok(());
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(self.open_options()?)
            .await
            .map_err(|e| NlqError::ConnectFailed(format!("sqlite: {}", e)))?;

        info!(
            "Connected to SQLite: {}",
            self.config.file_path.as_deref().unwrap_or("")
        );
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!("Disconnected from SQLite");
        }
    }

    async fn is_connected(&self) -> bool {
        self.pool.read().await.is_some()
    }

    async fn test(&self) -> TestResult {
        let start = Instant::now();
        let options = match self.open_options() {
            Ok(options) => options,
            Err(e) => {
                return TestResult {
                    success: false,
                    message: e.to_string(),
                    latency_ms: elapsed_ms(start),
                    version: None,
                }
            }
        };
        match SqlitePoolOptions::new().max_connections(1).connect_with(options).await {
            Ok(pool) => {
                let version: Option<String> =
                    sqlx::query_scalar("SELECT sqlite_version()").fetch_one(&pool).await.ok();
                pool.close().await;
                let latency_ms = elapsed_ms(start);
                TestResult {
                    success: true,
                    message: format!("Connected successfully (latency: {}ms)", latency_ms),
                    latency_ms,
                    version: version.map(|v| format!("SQLite {}", v)),
                }
            }
            Err(e) => TestResult {
                success: false,
                message: format!("sqlite: {}", e),
                latency_ms: elapsed_ms(start),
                version: None,
            },
        }
    }

    async fn schema(&self, include_columns: bool) -> Result<SchemaSnapshot> {
        let pool = self.acquire_pool().await?;
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| NlqError::QueryFailed(e.to_string()))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0).map_err(|e| NlqError::QueryFailed(e.to_string()))?;
            let columns = if include_columns {
                self.table_columns(&pool, &name).await?
            } else {
                Vec::new()
            };
            tables.push(TableDescriptor {
                name,
                schema_namespace: None,
                columns,
                row_count_estimate: None,
            });
        }
        Ok(SchemaSnapshot { tables })
    }

    async fn execute(&self, query: Query, params: Option<Row>) -> QueryResult {
        let start = Instant::now();
        let sql = match query.as_sql() {
            Some(sql) => sql.to_string(),
            None => return QueryResult::fail("sqlite expects a SQL query", elapsed_ms(start)),
        };
        let pool = match self.acquire_pool().await {
            Ok(pool) => pool,
            Err(e) => return QueryResult::fail(e.to_string(), elapsed_ms(start)),
        };

        let (sql, values) = match &params {
            Some(map) => super::rewrite_named_params(&sql, map, |_| "?".to_string()),
            None => (sql, Vec::new()),
        };

        if is_row_returning(&sql) {
            let query = bind_values(sqlx::query(&sql), &values);
            match query.fetch_all(&pool).await {
                Ok(rows) => {
                    let columns = rows
                        .first()
                        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
                        .unwrap_or_default();
                    let rows: Vec<Row> = rows.iter().map(sqlite_row_to_json).collect();
                    QueryResult::ok(columns, rows, elapsed_ms(start))
                }
                Err(e) => {
                    warn!("SQLite query failed: {}", e);
                    QueryResult::fail(format!("SQLITE error: {}", e), elapsed_ms(start))
                }
            }
        } else {
            let query = bind_values(sqlx::query(&sql), &values);
            match query.execute(&pool).await {
                Ok(done) => {
                    let mut result = QueryResult::ok(Vec::new(), Vec::new(), elapsed_ms(start));
                    result.row_count = done.rows_affected() as usize;
                    result
                }
                Err(e) => QueryResult::fail(format!("SQLITE error: {}", e), elapsed_ms(start)),
            }
        }
    }
}
