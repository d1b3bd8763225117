//! MySQL handler

use super::{
    elapsed_ms, BackendKind, ColumnDescriptor, ConnectionConfig, DatabaseHandler, Query,
    QueryResult, Row, SchemaSnapshot, TableDescriptor, TestResult,
};
use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{Column, MySqlPool, Row as SqlxRow, TypeInfo};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct MySqlHandler {
    config: ConnectionConfig,
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlHandler {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config, pool: RwLock::new(None) }
    }

    fn dsn(&self) -> String {
        let mut dsn = format!(
            "mysql://{}:{}@{}:{}/{}",
            self.config.username.as_deref().unwrap_or(""),
            self.config.password.as_deref().unwrap_or(""),
            self.config.host.as_deref().unwrap_or("localhost"),
            self.config.port.unwrap_or(3306),
            self.config.database.as_deref().unwrap_or("")
        );
        if self.config.ssl {
            dsn.push_str("?ssl-mode=REQUIRED");
        }
        dsn
    }

    async fn acquire_pool(&self) -> Result<MySqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| NlqError::NotConnected(self.config.id.clone()))
    }

    async fn table_columns(&self, pool: &MySqlPool, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let rows = sqlx::query(
            "SELECT column_name, data_type, is_nullable, column_key \
             FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(pool)
        .await
        .map_err(|e| NlqError::QueryFailed(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| ColumnDescriptor {
                name: row.try_get::<String, _>(0).unwrap_or_default(),
                type_string: row.try_get::<String, _>(1).unwrap_or_default(),
                nullable: row.try_get::<String, _>(2).map(|v| v == "YES").unwrap_or(true),
                primary_key: row.try_get::<String, _>(3).map(|v| v == "PRI").unwrap_or(false),
            })
            .collect())
    }
}

fn mysql_cell_to_json(row: &MySqlRow, index: usize) -> Value {
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
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(index).map(Value::from).unwrap_or(Value::Null)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => row.try_get::<u64, _>(index).map(Value::from).unwrap_or(Value::Null),
        "FLOAT" => row.try_get::<f32, _>(index).map(Value::from).unwrap_or(Value::Null),
        "DOUBLE" => row.try_get::<f64, _>(index).map(Value::from).unwrap_or(Value::Null),
        "DECIMAL" => row
            .try_get::<sqlx::types::BigDecimal, _>(index)
            .ok()
            .and_then(|d| d.to_string().parse::<f64>().ok())
            .map(Value::from)
            .unwrap_or(Value::Null),
        "JSON" => row.try_get::<Value, _>(index).unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(index)
            .map(|d| Value::from(d.to_string()))
            .unwrap_or(Value::Null),
        "DATETIME" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|d| Value::from(d.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|d| Value::from(d.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => row.try_get::<String, _>(index).map(Value::from).unwrap_or(Value::Null),
    }
}

fn mysql_row_to_json(row: &MySqlRow) -> Row {
    let mut map = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), mysql_cell_to_json(row, index));
    }
    map
}

fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    values: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
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
    upper.starts_with("SELECT")
        || upper.starts_with("WITH")
        || upper.starts_with("SHOW")
        || upper.starts_with("DESCRIBE")
        || upper.starts_with("EXPLAIN")
}

#[async_trait]
impl DatabaseHandler for MySqlHandler {
    fn kind(&self) -> BackendKind {
        BackendKind::Mysql
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
        let pool = MySqlPoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.dsn())
            .await
            .map_err(|e| NlqError::ConnectFailed(format!("mysql: {}", e)))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| NlqError::ConnectFailed(format!("mysql: {}", e)))?;

        info!(
            "Connected to MySQL: {}:{}/{}",
            self.config.host.as_deref().unwrap_or("localhost"),
            self.config.port.unwrap_or(3306),
            self.config.database.as_deref().unwrap_or("")
        );
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!("Disconnected from MySQL");
        }
    }

    async fn is_connected(&self) -> bool {
        self.pool.read().await.is_some()
    }

    async fn test(&self) -> TestResult {
        let start = Instant::now();
        match MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.dsn())
            .await
        {
            Ok(pool) => {
                let version: Option<String> =
                    sqlx::query_scalar("SELECT VERSION()").fetch_one(&pool).await.ok();
                pool.close().await;
                let latency_ms = elapsed_ms(start);
                TestResult {
                    success: true,
                    message: format!("Connected successfully (latency: {}ms)", latency_ms),
                    latency_ms,
                    version,
                }
            }
            Err(e) => TestResult {
                success: false,
                message: format!("mysql: {}", e),
                latency_ms: elapsed_ms(start),
                version: None,
            },
        }
    }

    async fn schema(&self, include_columns: bool) -> Result<SchemaSnapshot> {
        let pool = self.acquire_pool().await?;
        let rows = sqlx::query(
            "SELECT table_name, table_rows FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| NlqError::QueryFailed(e.to_string()))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0).map_err(|e| NlqError::QueryFailed(e.to_string()))?;
            let row_count_estimate: Option<i64> = row.try_get::<Option<u64>, _>(1).ok().flatten().map(|v| v as i64);
            let columns = if include_columns {
                self.table_columns(&pool, &name).await?
            } else {
                Vec::new()
            };
            tables.push(TableDescriptor {
                name,
                schema_namespace: self.config.database.clone(),
                columns,
                row_count_estimate,
            });
        }
        Ok(SchemaSnapshot { tables })
    }

    async fn execute(&self, query: Query, params: Option<Row>) -> QueryResult {
        let start = Instant::now();
        let sql = match query.as_sql() {
            Some(sql) => sql.to_string(),
            None => return QueryResult::fail("mysql expects a SQL query", elapsed_ms(start)),
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
                    let rows: Vec<Row> = rows.iter().map(mysql_row_to_json).collect();
                    QueryResult::ok(columns, rows, elapsed_ms(start))
                }
                Err(e) => {
                    warn!("MySQL query failed: {}", e);
                    QueryResult::fail(format!("MYSQL error: {}", e), elapsed_ms(start))
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
                Err(e) => QueryResult::fail(format!("MYSQL error: {}", e), elapsed_ms(start)),
            }
        }
    }
}
