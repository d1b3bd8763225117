//! Tool layer
//!
//! Tools are what plan steps of kind `tool_call` invoke. The registry is the
//! union of handler-backed tools (execute against the active connection) and
//! statically registered ones like the KOSIS fetcher. Tool specs double as
//! the descriptions the LLM sees while planning.

use crate::backend::api::{payload_to_rows, rows_to_star_result};
use crate::backend::kosis::{normalize_kosis_row, KOSIS_BASE_URL};
use crate::backend::{Query, QueryResult, Row};
use crate::error::{NlqError, Result};
use crate::manager::ConnectionManager;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub required: bool,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ToolParameter {
    fn new(name: &str, param_type: &str, required: bool, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type: param_type.to_string(),
            required,
            description: description.to_string(),
            default: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSpec {
    /// One-tool rendering for the planning prompt.
    pub fn render(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|p| {
                format!(
                    "{}: {}{} - {}",
                    p.name,
                    p.param_type,
                    if p.required { " (required)" } else { "" },
                    p.description
                )
            })
            .collect();
        format!("- {}: {}\n  parameters: [{}]", self.name, self.description, params.join("; "))
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn invoke(&self, arguments: &Row) -> Result<QueryResult>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn push(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.spec().name == name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn specs_text(&self) -> String {
        if self.tools.is_empty() {
            return "none".to_string();
        }
        self.specs().iter().map(ToolSpec::render).collect::<Vec<_>>().join("\n")
    }

    /// Check a tool-call argument map against the tool's parameter schema:
    /// required present, primitive types matching.
    pub fn validate_arguments(&self, tool_name: &str, arguments: &Row) -> Result<()> {
        let tool = self
            .get(tool_name)
            .ok_or_else(|| NlqError::PlanInvalid(format!("unknown tool '{}'", tool_name)))?;
        let spec = tool.spec();

        for parameter in &spec.parameters {
            match arguments.get(&parameter.name) {
                None | Some(Value::Null) => {
                    if parameter.required {
                        return Err(NlqError::PlanInvalid(format!(
                            "tool '{}' is missing required argument '{}'",
                            tool_name, parameter.name
                        )));
                    }
                }
                Some(value) => {
                    let ok = match parameter.param_type.as_str() {
                        "string" => value.is_string(),
                        "number" => value.is_number() || value.is_string(),
                        "boolean" => value.is_boolean(),
                        _ => true,
                    };
                    if !ok {
                        return Err(NlqError::PlanInvalid(format!(
                            "tool '{}' argument '{}' should be a {}",
                            tool_name, parameter.name, parameter.param_type
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Handler-backed tool: run SQL on the active connection.
pub struct ExecuteSqlTool {
    manager: Arc<ConnectionManager>,
}

impl ExecuteSqlTool {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for ExecuteSqlTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "execute_sql".to_string(),
            description: "Execute a SQL query against the active connection and return rows"
                .to_string(),
            parameters: vec![ToolParameter::new(
                "sql",
                "string",
                true,
                "The SQL statement to run",
            )],
        }
    }

    async fn invoke(&self, arguments: &Row) -> Result<QueryResult> {
        let sql = arguments
            .get("sql")
            .and_then(Value::as_str)
            .ok_or_else(|| NlqError::ToolCallFailed("execute_sql needs a 'sql' string".to_string()))?;
        self.manager.execute(None, Query::Sql(sql.to_string()), None).await
    }
}

/// Statically registered tool: fetch observations from a KOSIS statistical
/// table without needing a kosis_api connection. Mirrors the handler's
/// default policy for omitted dimensions.
pub struct FetchKosisTool {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl FetchKosisTool {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, KOSIS_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { api_key, base_url, client }
    }
}

#[async_trait]
impl Tool for FetchKosisTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "fetch_kosis_data".to_string(),
            description: "Fetch statistics from a KOSIS table (population: orgId=101 tblId=DT_1B040A3)"
                .to_string(),
            parameters: vec![
                ToolParameter::new("orgId", "string", true, "Organisation id, e.g. 101"),
                ToolParameter::new("tblId", "string", true, "Statistical table id, e.g. DT_1B040A3"),
                ToolParameter::new("prdSe", "string", false, "Period kind: Y, Q, M or D"),
                ToolParameter::new("startPrdDe", "string", false, "Start period, e.g. 2020"),
                ToolParameter::new("endPrdDe", "string", false, "End period, e.g. 2024"),
                ToolParameter::new("itmId", "string", false, "Item id, defaults to T20"),
                ToolParameter::new("objL1", "string", false, "First breakdown code, defaults to 00"),
            ],
        }
    }

    async fn invoke(&self, arguments: &Row) -> Result<QueryResult> {
        let start = Instant::now();
        let get = |key: &str| -> Option<String> {
            arguments.get(key).and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };

        let org_id = get("orgId")
            .ok_or_else(|| NlqError::ToolCallFailed("required parameter orgId missing".to_string()))?;
        let tbl_id = get("tblId")
            .ok_or_else(|| NlqError::ToolCallFailed("required parameter tblId missing".to_string()))?;

        let mut params: Vec<(String, String)> = vec![
            ("method".to_string(), "getList".to_string()),
            ("apiKey".to_string(), self.api_key.clone()),
            ("format".to_string(), "json".to_string()),
            ("jsonVD".to_string(), "Y".to_string()),
            ("orgId".to_string(), org_id),
            ("tblId".to_string(), tbl_id),
            ("prdSe".to_string(), get("prdSe").unwrap_or_else(|| "Y".to_string())),
            ("itmId".to_string(), get("itmId").unwrap_or_else(|| "T20".to_string())),
            ("objL1".to_string(), get("objL1").unwrap_or_else(|| "00".to_string())),
        ];
        match (get("startPrdDe"), get("endPrdDe")) {
            (Some(start_prd), Some(end_prd)) => {
                params.push(("startPrdDe".to_string(), start_prd));
                params.push(("endPrdDe".to_string(), end_prd));
            }
            _ => params.push(("newEstPrdCnt".to_string(), "5".to_string())),
        }

        let response = self
            .client
            .get(format!("{}/statisticsParameterData.do", self.base_url))
            .query(&params)
            .send()
            .await
            .map_err(|e| NlqError::ToolCallFailed(format!("KOSIS request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(NlqError::ToolCallFailed(format!(
                "KOSIS returned status {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| NlqError::ToolCallFailed(format!("invalid JSON from KOSIS: {}", e)))?;

        // Error replies come back as an object with an err field.
        if let Some(err) = body.get("err").and_then(Value::as_str) {
            return Err(NlqError::ToolCallFailed(format!("KOSIS error: {}", err)));
        }

        let rows: Vec<Row> = payload_to_rows(&body).into_iter().map(normalize_kosis_row).collect();
        info!("fetch_kosis_data returned {} rows", rows.len());
        Ok(rows_to_star_result(rows, start.elapsed().as_millis() as u64))
    }
}
