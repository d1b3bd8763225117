//! PostgreSQL handler
//!
//! One pooled connection per Connection. The fast schema path (no columns)
//! reads live-tuple estimates from the statistics catalogue instead of
//! counting; tables without a statistics row are skipped, not listed with
//! unknown counts.

use super::{
    elapsed_ms, BackendKind, ColumnDescriptor, ConnectionConfig, DatabaseHandler, Query,
    QueryResult, Row, SchemaSnapshot, TableDescriptor, TestResult,
};
use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row as SqlxRow, TypeInfo};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct PostgresHandler {
    config: ConnectionConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresHandler {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config, pool: RwLock::new(None) }
    }

    fn dsn(&self) -> String {
        let mut dsn = format!(
            "postgres://{}:{}@{}:{}/{}",
            self.config.username.as_deref().unwrap_or(""),
            self.config.password.as_deref().unwrap_or(""),
            self.config.host.as_deref().unwrap_or("localhost"),
            self.config.port.unwrap_or(5432),
            self.config.database.as_deref().unwrap_or("")
        );
        if self.config.ssl {
            dsn.push_str("?sslmode=require");
        }
        dsn
    }

    fn namespace(&self) -> String {
        self.config.schema.clone().unwrap_or_else(|| "public".to_string())
    }

    async fn acquire_pool(&self) -> Result<PgPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| NlqError::NotConnected(self.config.id.clone()))
    }

    /// Live-tuple estimates keyed by table name, from pg_stat_user_tables.
    async fn row_count_estimates(&self, pool: &PgPool) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT relname, n_live_tup FROM pg_stat_user_tables WHERE schemaname = $1",
        )
        .bind(self.namespace())
        .fetch_all(pool)
        .await
        .map_err(|e| NlqError::QueryFailed(e.to_string()))?;

        let mut map = HashMap::new();
        for row in rows {
            let name: String = row.try_get(0).map_err(|e| NlqError::QueryFailed(e.to_string()))?;
            let count: i64 = row.try_get(1).unwrap_or(0);
            map.insert(name, count);
        }
        Ok(map)
    }

    async fn table_columns(&self, pool: &PgPool, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let rows = sqlx::query(
            r#"
            SELECT
                c.column_name,
                c.data_type,
                c.is_nullable,
                COALESCE(tc.constraint_type, '') AS constraint_type
            FROM information_schema.columns c
            LEFT JOIN information_schema.key_column_usage kcu
                ON c.table_name = kcu.table_name
                AND c.column_name = kcu.column_name
                AND c.table_schema = kcu.table_schema
            LEFT JOIN information_schema.table_constraints tc
                ON kcu.constraint_name = tc.constraint_name
                AND kcu.table_schema = tc.table_schema
                AND tc.constraint_type = 'PRIMARY KEY'
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
            "#,
        )
        .bind(self.namespace())
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
                primary_key: row
                    .try_get::<String, _>(3)
                    .map(|v| v == "PRIMARY KEY")
                    .unwrap_or(false),
            })
            .collect())
    }
}

fn pg_cell_to_json(row: &PgRow, index: usize) -> Value {
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
        "BOOL" => row.try_get::<bool, _>(index).map(Value::from).unwrap_or(Value::Null),
        "INT2" => row.try_get::<i16, _>(index).map(Value::from).unwrap_or(Value::Null),
        "INT4" => row.try_get::<i32, _>(index).map(Value::from).unwrap_or(Value::Null),
        "INT8" => row.try_get::<i64, _>(index).map(Value::from).unwrap_or(Value::Null),
        "FLOAT4" => row.try_get::<f32, _>(index).map(Value::from).unwrap_or(Value::Null),
        "FLOAT8" => row.try_get::<f64, _>(index).map(Value::from).unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<sqlx::types::BigDecimal, _>(index)
            .ok()
            .and_then(|d| d.to_string().parse::<f64>().ok())
            .map(Value::from)
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row.try_get::<Value, _>(index).unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(index)
            .map(|d| Value::from(d.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|d| Value::from(d.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|d| Value::from(d.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => row.try_get::<String, _>(index).map(Value::from).unwrap_or(Value::Null),
    }
}

fn pg_row_to_json(row: &PgRow) -> Row {
    let mut map = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), pg_cell_to_json(row, index));
    }
    map
}

fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    values: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
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
        || upper.starts_with("EXPLAIN")
        || upper.starts_with("RETURNING")
}

#[async_trait]
impl DatabaseHandler for PostgresHandler {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgresql
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
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.dsn())
            .await
            .map_err(|e| NlqError::ConnectFailed(format!("postgresql: {}", e)))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| NlqError::ConnectFailed(format!("postgresql: {}", e)))?;

        info!(
            "Connected to PostgreSQL: {}:{}/{}",
            self.config.host.as_deref().unwrap_or("localhost"),
            self.config.port.unwrap_or(5432),
            self.config.database.as_deref().unwrap_or("")
        );
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!("Disconnected from PostgreSQL");
        }
    }

    async fn is_connected(&self) -> bool {
        self.pool.read().await.is_some()
    }

    async fn test(&self) -> TestResult {
        let start = Instant::now();
        match sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.dsn())
            .await
        {
            Ok(pool) => {
                let version: Option<String> = sqlx::query_scalar("SELECT version()")
                    .fetch_one(&pool)
                    .await
                    .ok();
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
                message: format!("postgresql: {}", e),
                latency_ms: elapsed_ms(start),
                version: None,
            },
        }
    }

    async fn schema(&self, include_columns: bool) -> Result<SchemaSnapshot> {
        let pool = self.acquire_pool().await?;
        let namespace = self.namespace();
        let estimates = self.row_count_estimates(&pool).await?;

        if !include_columns {
            // Fast path: the statistics catalogue alone. Anything without a
            // stats row is skipped entirely.
            let mut tables: Vec<TableDescriptor> = estimates
                .into_iter()
                .map(|(name, estimate)| TableDescriptor {
                    name,
                    schema_namespace: Some(namespace.clone()),
                    columns: Vec::new(),
                    row_count_estimate: Some(estimate),
                })
                .collect();
            tables.sort_by(|a, b| a.name.cmp(&b.name));
            return Ok(SchemaSnapshot { tables });
        }

        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .bind(&namespace)
        .fetch_all(&pool)
        .await
        .map_err(|e| NlqError::QueryFailed(e.to_string()))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0).map_err(|e| NlqError::QueryFailed(e.to_string()))?;
            let columns = self.table_columns(&pool, &name).await?;
            tables.push(TableDescriptor {
                row_count_estimate: estimates.get(&name).copied(),
                name,
                schema_namespace: Some(namespace.clone()),
                columns,
            });
        }
        Ok(SchemaSnapshot { tables })
    }

    async fn execute(&self, query: Query, params: Option<Row>) -> QueryResult {
        let start = Instant::now();
        let sql = match query.as_sql() {
            Some(sql) => sql.to_string(),
            None => return QueryResult::fail("postgresql expects a SQL query", elapsed_ms(start)),
        };
        let pool = match self.acquire_pool().await {
            Ok(pool) => pool,
            Err(e) => return QueryResult::fail(e.to_string(), elapsed_ms(start)),
        };

        let (sql, values) = match &params {
            Some(map) => super::rewrite_named_params(&sql, map, |n| format!("${}", n)),
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
                    let rows: Vec<Row> = rows.iter().map(pg_row_to_json).collect();
                    QueryResult::ok(columns, rows, elapsed_ms(start))
                }
                Err(e) => {
                    warn!("PostgreSQL query failed: {}", e);
                    QueryResult::fail(format!("POSTGRESQL error: {}", e), elapsed_ms(start))
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
                Err(e) => QueryResult::fail(format!("POSTGRESQL error: {}", e), elapsed_ms(start)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_row_returning() {
        assert!(is_row_returning("SELECT 1"));
        assert!(is_row_returning("  with x as (select 1) select * from x"));
        assert!(!is_row_returning("INSERT INTO t VALUES (1)"));
    }
}
