//! Tabular workspace
//!
//! Per-request in-memory SQL context. Results from any handler are registered
//! as named tables so later steps can join and aggregate across sources. The
//! engine is an in-memory SQLite connection behind a mutex; tables live for
//! the duration of one orchestrator run.

use crate::backend::{QueryResult, Row};
use crate::error::{NlqError, Result};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info};

const MAX_TABLE_NAME_LEN: usize = 63;
const CHART_ROW_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Line,
    Bar,
    Pie,
    Doughnut,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartHint {
    #[serde(default)]
    pub chart_kind: Option<ChartKind>,
    #[serde(default)]
    pub label_column: Option<String>,
    #[serde(default)]
    pub value_columns: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartDataset {
    pub label: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartData {
    pub chart_kind: ChartKind,
    pub labels: Vec<String>,
    pub datasets: Vec<ChartDataset>,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSummary {
    pub columns: Vec<String>,
    pub row_count: usize,
}

enum ColumnAffinity {
    Integer,
    Real,
    Text,
}

impl ColumnAffinity {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnAffinity::Integer => "INTEGER",
            ColumnAffinity::Real => "REAL",
            ColumnAffinity::Text => "TEXT",
        }
    }
}

pub struct Workspace {
    conn: Mutex<Connection>,
    /// source name -> final table name
    registered: Mutex<HashMap<String, String>>,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn), registered: Mutex::new(HashMap::new()) })
    }

    /// Register a query result as a table. Returns the final table name.
    /// Registering the same source name again replaces the table.
    pub fn register(&self, source_name: &str, result: &QueryResult) -> Result<String> {
        let table_name = self.assign_table_name(source_name)?;

        let columns = if result.columns.is_empty() {
            // Derive from rows when the handler did not report columns.
            let mut seen = Vec::new();
            for row in &result.rows {
                for key in row.keys() {
                    if !seen.contains(key) {
                        seen.push(key.clone());
                    }
                }
            }
            seen
        } else {
            result.columns.clone()
        };

        if columns.is_empty() {
            return Err(NlqError::WorkspaceSql(format!(
                "cannot register '{}': result has no columns",
                source_name
            )));
        }

        let affinities: Vec<ColumnAffinity> =
            columns.iter().map(|c| infer_affinity(c, &result.rows)).collect();

        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.execute(&format!("DROP TABLE IF EXISTS \"{}\"", table_name), [])?;

        let column_defs: Vec<String> = columns
            .iter()
            .zip(&affinities)
            .map(|(name, affinity)| format!("\"{}\" {}", escape_ident(name), affinity.sql_type()))
            .collect();
        conn.execute(
            &format!("CREATE TABLE \"{}\" ({})", table_name, column_defs.join(", ")),
            [],
        )?;

        let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
        let insert = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            table_name,
            columns
                .iter()
                .map(|c| format!("\"{}\"", escape_ident(c)))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&insert)?;
        for row in &result.rows {
            let values: Vec<rusqlite::types::Value> = columns
                .iter()
                .map(|c| json_to_sql_value(row.get(c).unwrap_or(&Value::Null)))
                .collect();
            stmt.execute(rusqlite::params_from_iter(values))?;
        }
        drop(stmt);
        drop(conn);

        info!(
            "Registered workspace table {} ({} rows, {} columns)",
            table_name,
            result.rows.len(),
            columns.len()
        );
        Ok(table_name)
    }

    fn assign_table_name(&self, source_name: &str) -> Result<String> {
        let mut registered = self.registered.lock().map_err(|_| poisoned())?;
        if let Some(existing) = registered.get(source_name) {
            return Ok(existing.clone());
        }

        let base = normalize_table_name(source_name);
        let taken: Vec<&String> = registered.values().collect();
        let mut candidate = base.clone();
        let mut suffix = 2;
        while taken.contains(&&candidate) {
            let tail = format!("_{}", suffix);
            let head_len = MAX_TABLE_NAME_LEN.saturating_sub(tail.len()).min(base.len());
            candidate = format!("{}{}", &base[..head_len], tail);
            suffix += 1;
        }
        registered.insert(source_name.to_string(), candidate.clone());
        Ok(candidate)
    }

    /// Run SQL against the workspace tables.
    pub fn sql(&self, query: &str) -> Result<QueryResult> {
        let start = Instant::now();
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let mut stmt = conn.prepare(query)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let column_count = columns.len();

        let mut rows_out: Vec<Row> = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut map = Row::new();
            for (i, name) in columns.iter().enumerate().take(column_count) {
                map.insert(name.clone(), sql_value_to_json(row.get_ref(i)?));
            }
            rows_out.push(map);
        }
        debug!("Workspace SQL returned {} rows", rows_out.len());
        Ok(QueryResult::ok(columns, rows_out, start.elapsed().as_millis() as u64))
    }

    /// Table name -> columns and row count; the context handed to the LLM
    /// when it has to write SQL.
    pub fn describe(&self) -> Result<BTreeMap<String, TableSummary>> {
        let registered = self.registered.lock().map_err(|_| poisoned())?;
        let table_names: Vec<String> = registered.values().cloned().collect();
        drop(registered);

        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let mut out = BTreeMap::new();
        for name in table_names {
            let row_count: usize = conn
                .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", name), [], |r| {
                    r.get::<_, i64>(0)
                })
                .map(|n| n as usize)?;
            let mut stmt = conn.prepare(&format!("SELECT * FROM \"{}\" LIMIT 0", name))?;
            let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            drop(stmt);
            out.insert(name, TableSummary { columns, row_count });
        }
        Ok(out)
    }

    /// Text rendering of `describe` for prompts; "empty" when no tables.
    pub fn describe_text(&self) -> String {
        match self.describe() {
            Ok(tables) if !tables.is_empty() => tables
                .iter()
                .map(|(name, summary)| {
                    format!("- {} ({} rows): {}", name, summary.row_count, summary.columns.join(", "))
                })
                .collect::<Vec<_>>()
                .join("\n"),
            _ => "empty".to_string(),
        }
    }

    pub fn table_names(&self) -> Vec<String> {
        self.registered
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Project a finished table into chart-ready form.
    ///
    /// Selection policy: hint columns win; otherwise the first non-numeric
    /// column becomes labels and every numeric column a dataset. Line for
    /// time/period labels, bar for categorical comparisons, pie when a single
    /// dataset reads as shares of a whole.
    pub fn chartify(&self, table_name: &str, hint: &ChartHint) -> Result<ChartData> {
        let result = self.sql(&format!(
            "SELECT * FROM \"{}\" LIMIT {}",
            escape_ident(table_name),
            CHART_ROW_LIMIT
        ))?;
        if result.rows.is_empty() {
            return Err(NlqError::WorkspaceSql(format!("table '{}' is empty", table_name)));
        }

        let numeric: Vec<String> = result
            .columns
            .iter()
            .filter(|c| column_is_numeric(c, &result.rows))
            .cloned()
            .collect();

        let label_column = hint
            .label_column
            .clone()
            .filter(|c| result.columns.contains(c))
            .or_else(|| result.columns.iter().find(|c| !numeric.contains(c)).cloned())
            .or_else(|| result.columns.first().cloned())
            .ok_or_else(|| NlqError::WorkspaceSql("no label column available".to_string()))?;

        let value_columns: Vec<String> = if hint.value_columns.is_empty() {
            numeric.iter().filter(|c| **c != label_column).cloned().collect()
        } else {
            hint.value_columns
                .iter()
                .filter(|c| result.columns.contains(*c))
                .cloned()
                .collect()
        };
        if value_columns.is_empty() {
            return Err(NlqError::WorkspaceSql(format!(
                "table '{}' has no numeric columns to chart",
                table_name
            )));
        }

        let labels: Vec<String> = result
            .rows
            .iter()
            .map(|row| display_value(row.get(&label_column).unwrap_or(&Value::Null)))
            .collect();

        let datasets: Vec<ChartDataset> = value_columns
            .iter()
            .map(|column| ChartDataset {
                label: column.clone(),
                values: result
                    .rows
                    .iter()
                    .map(|row| row.get(column).and_then(Value::as_f64).unwrap_or(0.0))
                    .collect(),
            })
            .collect();

        let chart_kind = hint.chart_kind.unwrap_or_else(|| {
            if looks_temporal(&label_column) {
                ChartKind::Line
            } else if datasets.len() == 1 && looks_like_shares(&datasets[0].values) {
                ChartKind::Pie
            } else {
                ChartKind::Bar
            }
        });

        Ok(ChartData {
            chart_kind,
            labels,
            datasets,
            title: hint.title.clone().unwrap_or_else(|| table_name.to_string()),
        })
    }
}

fn poisoned() -> NlqError {
    NlqError::WorkspaceSql("workspace lock poisoned".to_string())
}

/// Lowercase, map non-identifier chars to underscore, keep within the
/// identifier length limit.
pub fn normalize_table_name(name: &str) -> String {
    let mut normalized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if normalized.is_empty() || normalized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        normalized = format!("t_{}", normalized);
    }
    normalized.truncate(MAX_TABLE_NAME_LEN);
    normalized
}

fn escape_ident(name: &str) -> String {
    name.replace('"', "")
}

fn infer_affinity(column: &str, rows: &[Row]) -> ColumnAffinity {
    let mut all_integer = true;
    let mut all_numeric = true;
    let mut saw_value = false;

    for row in rows {
        match row.get(column) {
            None | Some(Value::Null) => continue,
            Some(Value::Number(n)) => {
                saw_value = true;
                if !n.is_i64() && !n.is_u64() {
                    all_integer = false;
                }
            }
            Some(Value::Bool(_)) => {
                saw_value = true;
            }
            Some(_) => {
                saw_value = true;
                all_integer = false;
                all_numeric = false;
            }
        }
    }

    if !saw_value {
        ColumnAffinity::Text
    } else if all_integer {
        ColumnAffinity::Integer
    } else if all_numeric {
        ColumnAffinity::Real
    } else {
        ColumnAffinity::Text
    }
}

fn json_to_sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        // JSON-like cells are stored serialised.
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn sql_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(_) => Value::Null,
    }
}

fn column_is_numeric(column: &str, rows: &[Row]) -> bool {
    let mut saw_value = false;
    for row in rows {
        match row.get(column) {
            None | Some(Value::Null) => continue,
            Some(Value::Number(_)) => saw_value = true,
            Some(_) => return false,
        }
    }
    saw_value
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn looks_temporal(column: &str) -> bool {
    let lower = column.to_lowercase();
    ["year", "date", "month", "time", "period", "prd"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// One dataset whose values read as percentage shares of a whole.
fn looks_like_shares(values: &[f64]) -> bool {
    if values.is_empty() || values.iter().any(|v| *v < 0.0) {
        return false;
    }
    let total: f64 = values.iter().sum();
    (total - 100.0).abs() <= 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_rows(columns: &[&str], rows: Vec<Vec<Value>>) -> QueryResult {
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|cells| {
                columns
                    .iter()
                    .zip(cells)
                    .map(|(c, v)| (c.to_string(), v))
                    .collect()
            })
            .collect();
        QueryResult::ok(columns.iter().map(|c| c.to_string()).collect(), rows, 0)
    }

    #[test]
    fn test_normalize_table_name() {
        assert_eq!(normalize_table_name("Step1_Fetch KOSIS!"), "step1_fetch_kosis_");
        assert_eq!(normalize_table_name("1abc"), "t_1abc");
        let long = "x".repeat(100);
        assert_eq!(normalize_table_name(&long).len(), MAX_TABLE_NAME_LEN);
    }

    #[test]
    fn test_register_and_query() {
        let ws = Workspace::new().unwrap();
        let result = result_with_rows(
            &["year", "population"],
            vec![
                vec![Value::from("2020"), Value::from(51829023)],
                vec![Value::from("2021"), Value::from(51638809)],
            ],
        );
        let table = ws.register("step1_fetch_kosis_data", &result).unwrap();
        assert_eq!(table, "step1_fetch_kosis_data");

        let out = ws.sql("SELECT COUNT(*) AS n FROM step1_fetch_kosis_data").unwrap();
        assert_eq!(out.rows[0].get("n"), Some(&Value::from(2)));
    }

    #[test]
    fn test_register_is_idempotent_and_replaces() {
        let ws = Workspace::new().unwrap();
        let first = result_with_rows(&["a"], vec![vec![Value::from(1)]]);
        ws.register("t", &first).unwrap();
        ws.register("t", &first).unwrap();
        let out = ws.sql("SELECT COUNT(*) AS n FROM t").unwrap();
        assert_eq!(out.rows[0].get("n"), Some(&Value::from(1)));

        let second = result_with_rows(&["a"], vec![vec![Value::from(7)], vec![Value::from(8)]]);
        ws.register("t", &second).unwrap();
        let out = ws.sql("SELECT COUNT(*) AS n FROM t").unwrap();
        assert_eq!(out.rows[0].get("n"), Some(&Value::from(2)));
    }

    #[test]
    fn test_name_collision_gets_suffix() {
        let ws = Workspace::new().unwrap();
        let result = result_with_rows(&["a"], vec![vec![Value::from(1)]]);
        let first = ws.register("my table", &result).unwrap();
        let second = ws.register("my-table", &result).unwrap();
        assert_eq!(first, "my_table");
        assert_eq!(second, "my_table_2");
    }

    #[test]
    fn test_type_inference() {
        let ws = Workspace::new().unwrap();
        let result = result_with_rows(
            &["i", "r", "t"],
            vec![
                vec![Value::from(1), Value::from(1.5), Value::from("x")],
                vec![Value::Null, Value::from(2), Value::from("y")],
            ],
        );
        ws.register("typed", &result).unwrap();
        let out = ws
            .sql("SELECT type FROM pragma_table_info('typed') ORDER BY cid")
            .unwrap();
        let types: Vec<String> = out
            .rows
            .iter()
            .map(|r| r.get("type").and_then(Value::as_str).unwrap_or("").to_string())
            .collect();
        assert_eq!(types, vec!["INTEGER", "REAL", "TEXT"]);
    }

    #[test]
    fn test_cross_table_join() {
        let ws = Workspace::new().unwrap();
        let gdp = result_with_rows(
            &["year", "gdp"],
            vec![
                vec![Value::from("2020"), Value::from(1900.0)],
                vec![Value::from("2021"), Value::from(2000.0)],
            ],
        );
        let pop = result_with_rows(
            &["year", "population"],
            vec![
                vec![Value::from("2020"), Value::from(50.0)],
                vec![Value::from("2021"), Value::from(51.0)],
            ],
        );
        ws.register("step1_fetch", &gdp).unwrap();
        ws.register("step2_fetch", &pop).unwrap();

        let out = ws
            .sql(
                "SELECT a.year, a.gdp / b.population AS per_capita \
                 FROM step1_fetch a JOIN step2_fetch b USING (year) ORDER BY a.year",
            )
            .unwrap();
        assert_eq!(out.row_count, 2);
        assert_eq!(out.rows[0].get("per_capita"), Some(&Value::from(38.0)));
    }

    #[test]
    fn test_describe_lists_tables() {
        let ws = Workspace::new().unwrap();
        let result = result_with_rows(&["a", "b"], vec![vec![Value::from(1), Value::from(2)]]);
        ws.register("step1_query", &result).unwrap();
        let tables = ws.describe().unwrap();
        let summary = tables.get("step1_query").unwrap();
        assert_eq!(summary.row_count, 1);
        assert_eq!(summary.columns, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_chartify_temporal_defaults_to_line() {
        let ws = Workspace::new().unwrap();
        let result = result_with_rows(
            &["year", "gdp"],
            vec![
                vec![Value::from("2020"), Value::from(1900.0)],
                vec![Value::from("2021"), Value::from(2000.0)],
            ],
        );
        ws.register("gdp_by_year", &result).unwrap();
        let chart = ws.chartify("gdp_by_year", &ChartHint::default()).unwrap();
        assert_eq!(chart.chart_kind, ChartKind::Line);
        assert_eq!(chart.labels, vec!["2020".to_string(), "2021".to_string()]);
        assert_eq!(chart.datasets.len(), 1);
        assert_eq!(chart.datasets[0].values, vec![1900.0, 2000.0]);
    }

    #[test]
    fn test_chartify_share_values_become_pie() {
        let ws = Workspace::new().unwrap();
        let result = result_with_rows(
            &["region", "share"],
            vec![
                vec![Value::from("capital"), Value::from(60.0)],
                vec![Value::from("rest"), Value::from(40.0)],
            ],
        );
        ws.register("shares", &result).unwrap();
        let chart = ws.chartify("shares", &ChartHint::default()).unwrap();
        assert_eq!(chart.chart_kind, ChartKind::Pie);
    }

    #[test]
    fn test_chartify_respects_hint() {
        let ws = Workspace::new().unwrap();
        let result = result_with_rows(
            &["label", "v1", "v2"],
            vec![vec![Value::from("a"), Value::from(1.0), Value::from(2.0)]],
        );
        ws.register("hinted", &result).unwrap();
        let hint = ChartHint {
            chart_kind: Some(ChartKind::Doughnut),
            label_column: Some("label".to_string()),
            value_columns: vec!["v2".to_string()],
            title: Some("My Chart".to_string()),
        };
        let chart = ws.chartify("hinted", &hint).unwrap();
        assert_eq!(chart.chart_kind, ChartKind::Doughnut);
        assert_eq!(chart.datasets.len(), 1);
        assert_eq!(chart.datasets[0].label, "v2");
        assert_eq!(chart.title, "My Chart");
    }
}
