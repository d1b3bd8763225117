//! Planning
//!
//! Prompt construction and strict validation of LLM-produced plans. Anything
//! coming back from the model is untrusted input: it is parsed against the
//! step schema and rejected before execution when a tool is unknown, a
//! required argument is missing, or a referenced table is not produced by an
//! earlier step.

use crate::agent::tools::ToolRegistry;
use crate::error::{NlqError, Result};
use crate::llm::{extract_json, ChatMessage};
use crate::workspace::{normalize_table_name, ChartHint};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ToolCall,
    Query,
    Visualization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    /// The original system called this field `params`; models trained on
    /// that prompt shape still emit it.
    #[serde(default, alias = "params")]
    pub arguments: serde_json::Map<String, Value>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default, alias = "subquestion")]
    pub question: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default, alias = "chart_hint")]
    pub chart: Option<ChartHint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Step {
    /// Workspace table name this step will produce, if any.
    pub fn produced_table(&self) -> Option<String> {
        match self.kind {
            StepKind::ToolCall => self
                .tool_name
                .as_ref()
                .map(|tool| normalize_table_name(&format!("step{}_{}", self.index, tool))),
            StepKind::Query => Some(normalize_table_name(&format!("step{}_query", self.index))),
            StepKind::Visualization => None,
        }
    }
}

/// One prior attempt, fed back to the LLM during reflection.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub plan_json: String,
    pub failed_step: Option<usize>,
    pub error: String,
}

/// Parse an LLM response into a plan. Indices are assigned contiguously from
/// 1 when the model leaves them out; explicit indices must already be
/// contiguous.
pub fn parse_plan(raw: &str) -> Result<Plan> {
    let json = extract_json(raw);
    let mut plan: Plan = serde_json::from_str(&json)
        .map_err(|e| NlqError::PlanInvalid(format!("malformed plan JSON: {}", e)))?;

    let all_defaulted = plan.steps.iter().all(|s| s.index == 0);
    if all_defaulted {
        for (i, step) in plan.steps.iter_mut().enumerate() {
            step.index = i + 1;
        }
    }
    Ok(plan)
}

/// Validate a plan against the tool registry and the tables that already
/// exist in the workspace.
pub fn validate_plan(
    plan: &Plan,
    registry: &ToolRegistry,
    existing_tables: &[String],
) -> Result<()> {
    if plan.steps.is_empty() {
        return Err(NlqError::PlanInvalid("plan has no steps".to_string()));
    }

    for (i, step) in plan.steps.iter().enumerate() {
        if step.index != i + 1 {
            return Err(NlqError::PlanInvalid(format!(
                "step indices are not contiguous: expected {} got {}",
                i + 1,
                step.index
            )));
        }
    }

    let step_table_re = Regex::new(r"\bstep\d+_[a-zA-Z0-9_]+").expect("step table regex");
    let mut available: BTreeSet<String> = existing_tables.iter().cloned().collect();

    for step in &plan.steps {
        match step.kind {
            StepKind::ToolCall => {
                let tool_name = step.tool_name.as_deref().ok_or_else(|| {
                    NlqError::PlanInvalid(format!("step {} has no tool_name", step.index))
                })?;
                registry.validate_arguments(tool_name, &step.arguments)?;
            }
            StepKind::Query => {
                let has_sql = step.sql.as_deref().is_some_and(|s| !s.trim().is_empty());
                let has_question = step.question.as_deref().is_some_and(|q| !q.trim().is_empty())
                    || !step.description.trim().is_empty();
                if !has_sql && !has_question {
                    return Err(NlqError::PlanInvalid(format!(
                        "query step {} has neither inline SQL nor a subquestion",
                        step.index
                    )));
                }
                if let Some(sql) = &step.sql {
                    for reference in step_table_re.find_iter(sql) {
                        let name = normalize_table_name(reference.as_str());
                        if !available.contains(&name) {
                            return Err(NlqError::PlanInvalid(format!(
                                "query step {} references table '{}' that no earlier step produces",
                                step.index, name
                            )));
                        }
                    }
                }
            }
            StepKind::Visualization => {
                let table = step.table.as_deref().ok_or_else(|| {
                    NlqError::PlanInvalid(format!(
                        "visualization step {} names no table",
                        step.index
                    ))
                })?;
                let name = normalize_table_name(table);
                if !available.contains(&name) {
                    return Err(NlqError::PlanInvalid(format!(
                        "visualization step {} references table '{}' that no earlier step produces",
                        step.index, name
                    )));
                }
            }
        }
        if let Some(produced) = step.produced_table() {
            available.insert(produced);
        }
    }
    Ok(())
}

const PLAN_RULES: &str = r#"You are a data analysis planner.

Return ONLY a JSON object of this shape, no prose, no markdown fences:
{
  "steps": [
    {"type": "tool_call", "description": "...", "tool_name": "<one of the tools>", "arguments": {"key": "value"}},
    {"type": "query", "description": "...", "sql": "SELECT ..." },
    {"type": "query", "description": "...", "question": "natural-language subquestion"},
    {"type": "visualization", "description": "...", "table": "step2_query", "chart": {"chart_kind": "line"}}
  ]
}

Rules:
1. tool_call steps gather data; each result becomes a workspace table named step<N>_<tool_name>.
2. query steps run SQL over workspace tables only (results become step<N>_query).
3. A query or visualization step may only reference tables produced by earlier steps or already in the workspace.
4. Collect data before analysing it; visualize last.

Verified KOSIS tables:
- population: orgId="101", tblId="DT_1B040A3", itmId="T20", objL1="00"
- GDP: orgId="101", tblId="DT_1DA7001"
- consumer prices: orgId="101", tblId="DT_1DD0001""#;

pub fn plan_prompt(
    question: &str,
    schema_summary: &str,
    tool_specs: &str,
    workspace_describe: &str,
) -> Vec<ChatMessage> {
    let system = format!(
        "{}\n\nAvailable tools:\n{}\n\nActive connection schema:\n{}\n\nWorkspace tables so far:\n{}",
        PLAN_RULES, tool_specs, schema_summary, workspace_describe
    );
    vec![ChatMessage::system(system), ChatMessage::user(format!("Question: {}", question))]
}

pub fn reflection_prompt(
    question: &str,
    schema_summary: &str,
    tool_specs: &str,
    workspace_describe: &str,
    history: &[AttemptRecord],
) -> Vec<ChatMessage> {
    let mut attempts = String::new();
    for (i, record) in history.iter().enumerate() {
        attempts.push_str(&format!(
            "Attempt {}: plan={} failed_step={} error={}\n",
            i + 1,
            record.plan_json,
            record.failed_step.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            record.error
        ));
    }

    let system = format!(
        "{}\n\nAvailable tools:\n{}\n\nActive connection schema:\n{}\n\nWorkspace tables so far (already usable, do not re-fetch them):\n{}",
        PLAN_RULES, tool_specs, schema_summary, workspace_describe
    );
    let user = format!(
        "All previous attempts:\n{}\nQuestion: {}\n\nReturn a REVISED plan that continues from the current workspace state. \
         Do not repeat the failed plan unchanged; fix the error above (fill in missing arguments, \
         pick different tables, or change strategy).",
        attempts, question
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

pub fn sql_prompt(subquestion: &str, workspace_describe: &str) -> Vec<ChatMessage> {
    let system = format!(
        "You are a SQL generator for an in-memory SQLite workspace.\n\
         Rules:\n\
         1. Use only the tables and columns below.\n\
         2. Return exactly one SELECT statement, nothing else.\n\
         3. KOSIS data: PRD_DE is the period, DT is the numeric value.\n\n\
         Workspace tables:\n{}",
        workspace_describe
    );
    vec![ChatMessage::system(system), ChatMessage::user(format!("Task: {}", subquestion))]
}

pub fn answer_prompt(question: &str, executed_sql: &[String], result_digest: &str) -> Vec<ChatMessage> {
    let system = "You are a helpful data assistant. Answer the user's question directly from the \
                  query results. Include the actual values, format large numbers readably, and \
                  say clearly when no data was found.";
    let user = format!(
        "Question: {}\n\nExecuted SQL:\n{}\n\nResults:\n{}\n\nAnswer:",
        question,
        executed_sql.join("\n"),
        result_digest
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::{Tool, ToolParameter, ToolSpec};
    use crate::backend::{QueryResult, Row};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FakeFetch;

    #[async_trait]
    impl Tool for FakeFetch {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "fetch_kosis_data".to_string(),
                description: "fetch".to_string(),
                parameters: vec![
                    ToolParameter {
                        name: "orgId".to_string(),
                        param_type: "string".to_string(),
                        required: true,
                        description: String::new(),
                        default: None,
                    },
                    ToolParameter {
                        name: "tblId".to_string(),
                        param_type: "string".to_string(),
                        required: true,
                        description: String::new(),
                        default: None,
                    },
                ],
            }
        }

        async fn invoke(&self, _arguments: &Row) -> crate::error::Result<QueryResult> {
            Ok(QueryResult::ok(Vec::new(), Vec::new(), 0))
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(vec![Arc::new(FakeFetch)])
    }

    fn tool_step_json() -> &'static str {
        r#"{"type": "tool_call", "description": "fetch", "tool_name": "fetch_kosis_data",
            "arguments": {"orgId": "101", "tblId": "DT_1B040A3"}}"#
    }

    #[test]
    fn test_parse_assigns_contiguous_indices() {
        let plan = parse_plan(&format!(
            r#"{{"steps": [{}, {{"type": "query", "description": "analyse", "question": "total?"}}]}}"#,
            tool_step_json()
        ))
        .unwrap();
        assert_eq!(plan.steps[0].index, 1);
        assert_eq!(plan.steps[1].index, 2);
    }

    #[test]
    fn test_parse_accepts_params_alias() {
        let plan = parse_plan(
            r#"{"steps": [{"type": "tool_call", "tool_name": "fetch_kosis_data",
                "params": {"orgId": "101", "tblId": "DT_1B040A3"}}]}"#,
        )
        .unwrap();
        assert_eq!(plan.steps[0].arguments.get("orgId"), Some(&Value::from("101")));
    }

    #[test]
    fn test_empty_plan_is_rejected() {
        let plan = parse_plan(r#"{"steps": []}"#).unwrap();
        let err = validate_plan(&plan, &registry(), &[]).unwrap_err();
        assert!(matches!(err, NlqError::PlanInvalid(_)));
    }

    #[test]
    fn test_unknown_tool_is_rejected() {
        let plan = parse_plan(
            r#"{"steps": [{"type": "tool_call", "tool_name": "imaginary", "arguments": {}}]}"#,
        )
        .unwrap();
        assert!(validate_plan(&plan, &registry(), &[]).is_err());
    }

    #[test]
    fn test_empty_arguments_with_required_params_rejected() {
        let plan = parse_plan(
            r#"{"steps": [{"type": "tool_call", "tool_name": "fetch_kosis_data", "arguments": {}}]}"#,
        )
        .unwrap();
        let err = validate_plan(&plan, &registry(), &[]).unwrap_err();
        assert!(err.to_string().contains("orgId"));
    }

    #[test]
    fn test_dangling_table_reference_rejected_before_execution() {
        let plan = parse_plan(&format!(
            r#"{{"steps": [{},
                {{"type": "query", "description": "analyse", "sql": "SELECT * FROM step99_foo"}}]}}"#,
            tool_step_json()
        ))
        .unwrap();
        let err = validate_plan(&plan, &registry(), &[]).unwrap_err();
        assert!(err.to_string().contains("step99_foo"));
    }

    #[test]
    fn test_forward_references_within_plan_resolve() {
        let plan = parse_plan(&format!(
            r#"{{"steps": [{},
                {{"type": "query", "description": "analyse", "sql": "SELECT * FROM step1_fetch_kosis_data"}},
                {{"type": "visualization", "description": "chart", "table": "step2_query"}}]}}"#,
            tool_step_json()
        ))
        .unwrap();
        assert!(validate_plan(&plan, &registry(), &[]).is_ok());
    }

    #[test]
    fn test_visualization_can_use_existing_workspace_table() {
        let plan = parse_plan(
            r#"{"steps": [{"type": "visualization", "description": "chart", "table": "earlier_table"}]}"#,
        )
        .unwrap();
        assert!(validate_plan(&plan, &registry(), &["earlier_table".to_string()]).is_ok());
        assert!(validate_plan(&plan, &registry(), &[]).is_err());
    }

    #[test]
    fn test_non_contiguous_explicit_indices_rejected() {
        let plan = parse_plan(
            r#"{"steps": [
                {"index": 1, "type": "query", "description": "a", "question": "q"},
                {"index": 3, "type": "query", "description": "b", "question": "q"}]}"#,
        )
        .unwrap();
        let err = validate_plan(&plan, &registry(), &[]).unwrap_err();
        assert!(err.to_string().contains("contiguous"));
    }
}
