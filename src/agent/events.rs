//! Stream events
//!
//! The closed set of typed progress messages a request emits. The transport
//! layer maps each variant to exactly one server-sent-event frame; the
//! orchestrator never sees transport concerns.

use crate::agent::planner::StepKind;
use crate::backend::QueryResult;
use crate::workspace::{ChartData, TableSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub index: usize,
    pub kind: StepKind,
    pub description: String,
}

/// Aggregate payload of one request: the natural-language answer, every table
/// the run produced, and the SQL that was actually executed. Tables produced
/// before a later failure are preserved here so the caller can display them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AggregateResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableSummary>,
    #[serde(default)]
    pub executed_sql: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartData>,
    /// Content of the last table the run produced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<QueryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start,
    Planning {
        steps: Vec<PlannedStep>,
    },
    StepStarted {
        index: usize,
        kind: StepKind,
        description: String,
    },
    ToolCall {
        tool_name: String,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Query {
        sql: String,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Visualization {
        chart_data: ChartData,
    },
    Result {
        #[serde(rename = "final")]
        payload: AggregateResult,
    },
    Error {
        message: String,
    },
    Done,
}
