//! KOSIS API handler
//!
//! Exposes the Korean national statistics portal as a set of virtual tables.
//! The API key travels as a request parameter, not a header. For
//! `statistics_data` the handler supplies safe defaults for `objL1` and
//! `itmId` when the caller omits them, so partial queries still succeed;
//! whether those defaults hold for every statistical table is upstream policy
//! this handler inherits.

use super::api::{parse_select, payload_to_rows, rows_to_result, ApiCore, ApiTable, API_HTTP_TIMEOUT};
use super::{
    elapsed_ms, BackendKind, ColumnDescriptor, ConnectionConfig, DatabaseHandler, Query,
    QueryResult, Row, SchemaSnapshot, TableDescriptor, TestResult,
};
use crate::error::{NlqError, Result};
use serde_json::Value;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const KOSIS_BASE_URL: &str = "https://kosis.kr/openapi";

/// Default breakdown dimension: whole country.
const DEFAULT_OBJ_L1: &str = "00";
/// Default item id: the population total item, the most common request.
const DEFAULT_ITM_ID: &str = "T20";

pub struct KosisHandler {
    config: ConnectionConfig,
    core: ApiCore,
    base_url: String,
}

fn string_columns(names: &[(&str, &str)]) -> Vec<ColumnDescriptor> {
    names
        .iter()
        .map(|(name, type_string)| ColumnDescriptor {
            name: name.to_string(),
            type_string: type_string.to_string(),
            nullable: true,
            primary_key: false,
        })
        .collect()
}

fn kosis_tables(base_url: &str) -> Vec<ApiTable> {
    vec![
        ApiTable {
            name: "statistics_search".to_string(),
            url: format!("{}/statisticsSearch.do", base_url),
            method: "GET".to_string(),
            description: "Keyword search across statistical tables".to_string(),
            columns: string_columns(&[
                ("TBL_ID", "string"),
                ("TBL_NM", "string"),
                ("ORG_NM", "string"),
                ("TBL_ENG_NM", "string"),
                ("CYCLE", "string"),
                ("SURVEY_YN", "string"),
                ("LOAD_DT", "string"),
            ]),
            params: vec!["searchNm".to_string()],
            required_params: vec!["searchNm".to_string()],
            data_path: String::new(),
        },
        ApiTable {
            name: "statistics_list".to_string(),
            url: format!("{}/statisticsList.do", base_url),
            method: "GET".to_string(),
            description: "Browse the statistics catalogue tree".to_string(),
            columns: string_columns(&[
                ("LIST_ID", "string"),
                ("LIST_NM", "string"),
                ("ORG_ID", "string"),
                ("ORG_NM", "string"),
                ("TBL_ID", "string"),
                ("TBL_NM", "string"),
            ]),
            params: vec!["vwCd".to_string(), "parentListId".to_string()],
            required_params: Vec::new(),
            data_path: String::new(),
        },
        ApiTable {
            name: "statistics_data".to_string(),
            url: format!("{}/statisticsParameterData.do", base_url),
            method: "GET".to_string(),
            description: "Fetch observations from one statistical table".to_string(),
            columns: string_columns(&[
                ("PRD_DE", "string"),
                ("PRD_SE", "string"),
                ("ITM_NM", "string"),
                ("ITM_ID", "string"),
                ("UNIT_NM", "string"),
                ("DT", "number"),
                ("C1", "string"),
                ("C1_NM", "string"),
            ]),
            params: vec![
                "orgId".to_string(),
                "tblId".to_string(),
                "prdSe".to_string(),
                "startPrdDe".to_string(),
                "endPrdDe".to_string(),
                "objL1".to_string(),
                "objL2".to_string(),
                "objL3".to_string(),
                "itmId".to_string(),
            ],
            required_params: vec!["orgId".to_string(), "tblId".to_string()],
            data_path: String::new(),
        },
        ApiTable {
            name: "statistics_bigdata".to_string(),
            url: format!("{}/statisticsBigData.do", base_url),
            method: "GET".to_string(),
            description: "Bulk download for registered user statistics".to_string(),
            columns: Vec::new(),
            params: vec!["userStatsId".to_string(), "format".to_string()],
            required_params: vec!["userStatsId".to_string()],
            data_path: String::new(),
        },
        ApiTable {
            name: "statistics_explanation".to_string(),
            url: format!("{}/statisticsDetail.do", base_url),
            method: "GET".to_string(),
            description: "Survey explanation for one statistic".to_string(),
            columns: string_columns(&[
                ("TBL_ID", "string"),
                ("TBL_NM", "string"),
                ("ORG_NM", "string"),
                ("SURVEY_NM", "string"),
                ("SURVEY_CYCLE", "string"),
            ]),
            params: vec!["statId".to_string()],
            required_params: vec!["statId".to_string()],
            data_path: String::new(),
        },
        ApiTable {
            name: "statistics_table_detail".to_string(),
            url: format!("{}/statisticsList.do", base_url),
            method: "GET".to_string(),
            description: "Classification and item codes for one table".to_string(),
            columns: Vec::new(),
            params: vec!["tblId".to_string()],
            required_params: vec!["tblId".to_string()],
            data_path: String::new(),
        },
        ApiTable {
            name: "statistics_main_indicator".to_string(),
            url: format!("{}/statisticsMainIndicator.do", base_url),
            method: "GET".to_string(),
            description: "Headline national indicators".to_string(),
            columns: Vec::new(),
            params: Vec::new(),
            required_params: Vec::new(),
            data_path: String::new(),
        },
    ]
}

impl KosisHandler {
    pub fn new(config: ConnectionConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| KOSIS_BASE_URL.to_string());
        let core = ApiCore::new(kosis_tables(&base_url));
        Self { config, core, base_url }
    }

    fn api_key(&self) -> String {
        self.config.api_key.clone().unwrap_or_default()
    }

    /// Translate equality predicates into the request parameter set for one
    /// virtual table, layering in the fixed KOSIS parameters and handler
    /// defaults.
    pub fn prepare_params(&self, table: &str, predicates: &[(String, String)]) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = vec![
            ("method".to_string(), "getList".to_string()),
            ("apiKey".to_string(), self.api_key()),
            ("format".to_string(), "json".to_string()),
            ("jsonVD".to_string(), "Y".to_string()),
        ];

        let has = |key: &str| predicates.iter().any(|(k, _)| k == key);

        match table {
            "statistics_search" => {
                params.push(("searchYN".to_string(), "Y".to_string()));
            }
            "statistics_list" => {
                if !has("vwCd") {
                    params.push(("vwCd".to_string(), "MT_ZTITLE".to_string()));
                }
                if !has("parentListId") {
                    params.push(("parentListId".to_string(), "MT_ZTITLE".to_string()));
                }
            }
            "statistics_data" => {
                if !has("objL1") {
                    debug!("statistics_data: defaulting objL1 to {}", DEFAULT_OBJ_L1);
                    params.push(("objL1".to_string(), DEFAULT_OBJ_L1.to_string()));
                }
                if !has("itmId") {
                    debug!("statistics_data: defaulting itmId to {}", DEFAULT_ITM_ID);
                    params.push(("itmId".to_string(), DEFAULT_ITM_ID.to_string()));
                }
                if !has("prdSe") {
                    params.push(("prdSe".to_string(), "Y".to_string()));
                }
                // Without an explicit range, ask for the latest five periods.
                if !has("startPrdDe") && !has("endPrdDe") {
                    params.push(("newEstPrdCnt".to_string(), "5".to_string()));
                }
            }
            "statistics_table_detail" => {
                params.push(("vwCd".to_string(), "MT_GTITLE01".to_string()));
            }
            _ => {}
        }

        for (key, value) in predicates {
            params.push((key.clone(), value.clone()));
        }
        params
    }
}

/// Normalise one KOSIS row: empty strings become null and the DT value column
/// becomes numeric where it parses.
pub(crate) fn normalize_kosis_row(mut row: Row) -> Row {
    for (key, value) in row.iter_mut() {
        if let Value::String(s) = value {
            if s.is_empty() {
                *value = Value::Null;
            } else if key == "DT" {
                if let Ok(n) = s.parse::<i64>() {
                    *value = Value::from(n);
                } else if let Ok(f) = s.parse::<f64>() {
                    *value = Value::from(f);
                }
            }
        }
    }
    row
}

#[async_trait]
impl DatabaseHandler for KosisHandler {
    fn kind(&self) -> BackendKind {
        BackendKind::KosisApi
    }

    fn supported_operations(&self) -> Vec<String> {
        ["SELECT"].iter().map(|s| s.to_string()).collect()
    }

    async fn connect(&self) -> Result<()> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("nlq-engine/0.1"),
        );
        self.core.connect(headers).await?;
        info!("Connected to KOSIS API at {}", self.base_url);
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
        let client = match reqwest::Client::builder().timeout(API_HTTP_TIMEOUT).build() {
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

        let params = self.prepare_params("statistics_list", &[]);
        match client
            .get(format!("{}/statisticsList.do", self.base_url))
            .query(&params)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let latency_ms = elapsed_ms(start);
                match response.json::<Value>().await {
                    Ok(_) => TestResult {
                        success: true,
                        message: format!("KOSIS API connected successfully (latency: {}ms)", latency_ms),
                        latency_ms,
                        version: Some("KOSIS OpenAPI v1.0".to_string()),
                    },
                    Err(_) => TestResult {
                        success: false,
                        message: "Invalid API key or access denied".to_string(),
                        latency_ms,
                        version: None,
                    },
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
                message: format!("KOSIS API unreachable: {}", e),
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
                schema_namespace: Some("kosis".to_string()),
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
            None => return QueryResult::fail("kosis handler expects a SQL query", elapsed_ms(start)),
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

        // Required params the defaults cannot cover.
        let request_params = self.prepare_params(&table.name, &select.predicates);
        for required in &table.required_params {
            if !request_params.iter().any(|(k, v)| k == required && !v.is_empty()) {
                return QueryResult::fail(
                    format!("required parameter {} missing", required),
                    elapsed_ms(start),
                );
            }
        }

        match self.core.call(&table, &request_params).await {
            Ok(payload) => {
                let rows: Vec<Row> =
                    payload_to_rows(&payload).into_iter().map(normalize_kosis_row).collect();
                rows_to_result(rows, &select, elapsed_ms(start))
            }
            Err(e) => {
                warn!("KOSIS call failed for {}: {}", table.name, e);
                QueryResult::fail(e.to_string(), elapsed_ms(start))
            }
        }
    }
}
