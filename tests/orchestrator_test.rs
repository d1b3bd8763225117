//! End-to-end orchestrator traces with a scripted LLM and in-memory tools:
//! happy path, reflection recovery, budget exhaustion, cancellation, and the
//! event-ordering guarantee.

use async_trait::async_trait;
use nlq_engine::agent::events::{StepStatus, StreamEvent};
use nlq_engine::agent::tools::{Tool, ToolParameter, ToolRegistry, ToolSpec};
use nlq_engine::agent::Orchestrator;
use nlq_engine::backend::{QueryResult, Row};
use nlq_engine::llm::{ChatMessage, LanguageModel};
use nlq_engine::manager::ConnectionManager;
use nlq_engine::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// LanguageModel that replays a fixed script; repeats the last response once
/// the script runs out.
struct ScriptedLlm {
    responses: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.lock().unwrap();
        let response = responses
            .get(index)
            .or_else(|| responses.last())
            .cloned()
            .unwrap_or_default();
        Ok(response)
    }
}

/// Tool returning two canned user rows.
struct UsersTool {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for UsersTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "fetch_users".to_string(),
            description: "fetch user rows".to_string(),
            parameters: Vec::new(),
        }
    }

    async fn invoke(&self, _arguments: &Row) -> Result<QueryResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let rows: Vec<Row> = vec![
            serde_json::from_value(serde_json::json!({"id": 1, "name": "kim"})).unwrap(),
            serde_json::from_value(serde_json::json!({"id": 2, "name": "lee"})).unwrap(),
        ];
        Ok(QueryResult::ok(vec!["id".to_string(), "name".to_string()], rows, 1))
    }
}

/// Tool that fails until `failures` invocations have happened, mimicking a
/// backend rejecting a call for a missing dimension.
struct FlakyTool {
    failures: usize,
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for FlakyTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "fetch_stats".to_string(),
            description: "fetch statistics".to_string(),
            parameters: vec![ToolParameter {
                name: "tblId".to_string(),
                param_type: "string".to_string(),
                required: true,
                description: "table id".to_string(),
                default: None,
            }],
        }
    }

    async fn invoke(&self, _arguments: &Row) -> Result<QueryResult> {
        let attempt = self.invocations.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Ok(QueryResult::fail("required parameter objL1 missing", 1))
        } else {
            let rows: Vec<Row> = vec![
                serde_json::from_value(serde_json::json!({"PRD_DE": "2020", "DT": 51829023})).unwrap(),
            ];
            Ok(QueryResult::ok(vec!["PRD_DE".to_string(), "DT".to_string()], rows, 1))
        }
    }
}

/// Tool returning text-only rows; charting its table fails for lack of a
/// numeric column.
struct NamesTool;

#[async_trait]
impl Tool for NamesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "fetch_names".to_string(),
            description: "fetch name rows".to_string(),
            parameters: Vec::new(),
        }
    }

    async fn invoke(&self, _arguments: &Row) -> Result<QueryResult> {
        let rows: Vec<Row> = vec![
            serde_json::from_value(serde_json::json!({"name": "kim", "city": "seoul"})).unwrap(),
            serde_json::from_value(serde_json::json!({"name": "lee", "city": "busan"})).unwrap(),
        ];
        Ok(QueryResult::ok(vec!["name".to_string(), "city".to_string()], rows, 1))
    }
}

/// Tool that hangs long enough for the caller to cancel mid-execute.
struct SlowTool {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for SlowTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "slow_fetch".to_string(),
            description: "slow fetch".to_string(),
            parameters: Vec::new(),
        }
    }

    async fn invoke(&self, _arguments: &Row) -> Result<QueryResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(20)).await;
        Ok(QueryResult::ok(Vec::new(), Vec::new(), 0))
    }
}

fn orchestrator_with(
    llm: ScriptedLlm,
    tools: Vec<Arc<dyn Tool>>,
    budget: usize,
    dir: &tempfile::TempDir,
) -> Arc<Orchestrator> {
    let manager = Arc::new(ConnectionManager::new(dir.path().join("connections.json")));
    Arc::new(Orchestrator::new(
        Arc::new(llm),
        manager,
        Arc::new(ToolRegistry::new(tools)),
        budget,
    ))
}

async fn collect_events(mut rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn event_name(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::Start => "start",
        StreamEvent::Planning { .. } => "planning",
        StreamEvent::StepStarted { .. } => "step_started",
        StreamEvent::ToolCall { .. } => "tool_call",
        StreamEvent::Query { .. } => "query",
        StreamEvent::Visualization { .. } => "visualization",
        StreamEvent::Result { .. } => "result",
        StreamEvent::Error { .. } => "error",
        StreamEvent::Done => "done",
    }
}

const HAPPY_PLAN: &str = r#"{"steps": [
    {"type": "tool_call", "description": "fetch users", "tool_name": "fetch_users", "arguments": {}},
    {"type": "query", "description": "count users", "sql": "SELECT COUNT(*) AS count FROM step1_fetch_users"}
]}"#;

#[tokio::test]
async fn test_happy_path_emits_ordered_trace() {
    let dir = tempfile::tempdir().unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let llm = ScriptedLlm::new(vec![HAPPY_PLAN, "There are 2 users."]);
    let orchestrator = orchestrator_with(
        llm,
        vec![Arc::new(UsersTool { invocations: Arc::clone(&invocations) })],
        3,
        &dir,
    );

    let (rx, _token) = orchestrator.run("how many users are in the data?".to_string());
    let events = collect_events(rx).await;

    let names: Vec<&str> = events.iter().map(event_name).collect();
    assert_eq!(
        names,
        vec!["start", "planning", "step_started", "tool_call", "step_started", "query", "result", "done"]
    );

    // done appears exactly once and last
    assert_eq!(names.iter().filter(|n| **n == "done").count(), 1);

    let StreamEvent::Query { sql, status, data } = &events[5] else {
        panic!("expected query event");
    };
    assert!(sql.contains("COUNT(*)"));
    assert_eq!(*status, StepStatus::Completed);
    assert_eq!(data.as_ref().unwrap()["row_count"], Value::from(1));

    let StreamEvent::Result { payload } = &events[6] else {
        panic!("expected result event");
    };
    assert!(payload.ok);
    assert_eq!(payload.answer.as_deref(), Some("There are 2 users."));
    assert!(payload.tables.contains_key("step1_fetch_users"));
    assert!(payload.tables.contains_key("step2_query"));
    assert_eq!(payload.executed_sql.len(), 1);

    // The final table carries the count itself.
    let data = payload.data.as_ref().unwrap();
    assert_eq!(data.columns, vec!["count".to_string()]);
    assert_eq!(data.rows[0].get("count"), Some(&Value::from(2)));

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

const CHART_PLAN: &str = r#"{"steps": [
    {"type": "tool_call", "description": "fetch users", "tool_name": "fetch_users", "arguments": {}},
    {"type": "query", "description": "count users", "sql": "SELECT COUNT(*) AS count FROM step1_fetch_users"},
    {"type": "visualization", "description": "chart users", "table": "step1_fetch_users",
     "chart": {"chart_kind": "bar", "title": "Users"}}
]}"#;

#[tokio::test]
async fn test_visualization_step_emits_chart_before_result() {
    let dir = tempfile::tempdir().unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let llm = ScriptedLlm::new(vec![CHART_PLAN, "Charted 2 users."]);
    let orchestrator = orchestrator_with(
        llm,
        vec![Arc::new(UsersTool { invocations })],
        3,
        &dir,
    );

    let (rx, _token) = orchestrator.run("chart the user data".to_string());
    let events = collect_events(rx).await;

    let names: Vec<&str> = events.iter().map(event_name).collect();
    assert_eq!(
        names,
        vec![
            "start",
            "planning",
            "step_started",
            "tool_call",
            "step_started",
            "query",
            "step_started",
            "visualization",
            "result",
            "done"
        ]
    );

    let StreamEvent::Visualization { chart_data } = &events[7] else {
        panic!("expected visualization event");
    };
    assert_eq!(chart_data.title, "Users");
    assert_eq!(chart_data.labels, vec!["kim".to_string(), "lee".to_string()]);
    assert_eq!(chart_data.datasets.len(), 1);

    // The chart also lands in the aggregate payload.
    let StreamEvent::Result { payload } = &events[8] else {
        panic!("expected result event");
    };
    assert!(payload.ok);
    assert!(payload.chart.is_some());
}

const BAD_CHART_PLAN: &str = r#"{"steps": [
    {"type": "tool_call", "description": "fetch names", "tool_name": "fetch_names", "arguments": {}},
    {"type": "visualization", "description": "chart names", "table": "step1_fetch_names"}
]}"#;

#[tokio::test]
async fn test_failed_visualization_reflects_without_error_event() {
    let dir = tempfile::tempdir().unwrap();
    let user_invocations = Arc::new(AtomicUsize::new(0));
    // Plan 1 charts a table with no numeric columns and fails; the revised
    // plan fetches chartable rows instead.
    let llm = ScriptedLlm::new(vec![BAD_CHART_PLAN, CHART_PLAN, "Charted 2 users."]);
    let orchestrator = orchestrator_with(
        llm,
        vec![
            Arc::new(NamesTool),
            Arc::new(UsersTool { invocations: Arc::clone(&user_invocations) }),
        ],
        3,
        &dir,
    );

    let (rx, _token) = orchestrator.run("chart the user data".to_string());
    let events = collect_events(rx).await;
    let names: Vec<&str> = events.iter().map(event_name).collect();

    // The failed chartify is folded into reflection: no top-level error
    // event anywhere, two plans, one successful visualization, result + done.
    assert!(!names.contains(&"error"));
    assert_eq!(names.iter().filter(|n| **n == "planning").count(), 2);
    assert_eq!(names.iter().filter(|n| **n == "visualization").count(), 1);
    assert_eq!(names[names.len() - 2], "result");
    assert_eq!(*names.last().unwrap(), "done");

    let StreamEvent::Result { payload } = &events[names.len() - 2] else {
        panic!("expected result event");
    };
    assert!(payload.ok);
    assert!(payload.chart.is_some());
    assert_eq!(user_invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_visualization_failing_every_plan_exhausts_budget() {
    let dir = tempfile::tempdir().unwrap();
    // Every plan ends in the same unchartable visualization.
    let llm = ScriptedLlm::new(vec![BAD_CHART_PLAN]);
    let orchestrator = orchestrator_with(llm, vec![Arc::new(NamesTool)], 2, &dir);

    let (rx, _token) = orchestrator.run("chart the name data".to_string());
    let events = collect_events(rx).await;
    let names: Vec<&str> = events.iter().map(event_name).collect();

    assert_eq!(names.iter().filter(|n| **n == "planning").count(), 2);
    assert!(!names.contains(&"visualization"));
    assert!(!names.contains(&"result"));
    // The only error event is the terminal one, directly before done.
    assert_eq!(names.iter().filter(|n| **n == "error").count(), 1);
    assert_eq!(names[names.len() - 2], "error");
    assert_eq!(*names.last().unwrap(), "done");

    let StreamEvent::Error { message } = &events[names.len() - 2] else {
        panic!("expected error event");
    };
    assert!(message.contains("budget"));
}

#[tokio::test]
async fn test_general_question_bypasses_plan_loop() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::new(vec!["Hello! Ask me about your data."]);
    let orchestrator = orchestrator_with(llm, Vec::new(), 3, &dir);

    let (rx, _token) = orchestrator.run("hello there!".to_string());
    let events = collect_events(rx).await;
    let names: Vec<&str> = events.iter().map(event_name).collect();
    assert_eq!(names, vec!["start", "result", "done"]);
}

const FLAKY_PLAN: &str = r#"{"steps": [
    {"type": "tool_call", "description": "fetch stats", "tool_name": "fetch_stats",
     "arguments": {"tblId": "DT_1B040A3"}}
]}"#;

#[tokio::test]
async fn test_reflection_recovers_after_step_failure() {
    let dir = tempfile::tempdir().unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    // Plan 1 fails at the tool, plan 2 (identical here) succeeds because the
    // tool recovers; last response is the prose answer.
    let llm = ScriptedLlm::new(vec![FLAKY_PLAN, FLAKY_PLAN, "Population fetched."]);
    let orchestrator = orchestrator_with(
        llm,
        vec![Arc::new(FlakyTool { failures: 1, invocations: Arc::clone(&invocations) })],
        3,
        &dir,
    );

    let (rx, _token) = orchestrator.run("population statistics please".to_string());
    let events = collect_events(rx).await;
    let names: Vec<&str> = events.iter().map(event_name).collect();

    assert_eq!(names.iter().filter(|n| **n == "planning").count(), 2);
    assert_eq!(*names.last().unwrap(), "done");

    // First tool_call errored, second completed.
    let statuses: Vec<StepStatus> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolCall { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![StepStatus::Error, StepStatus::Completed]);

    let StreamEvent::Result { payload } = &events[names.len() - 2] else {
        panic!("expected result before done");
    };
    assert!(payload.ok);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_budget_exhausted_emits_error_not_result() {
    let dir = tempfile::tempdir().unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    // The tool never recovers; the scripted LLM keeps returning the same plan.
    let llm = ScriptedLlm::new(vec![FLAKY_PLAN]);
    let orchestrator = orchestrator_with(
        llm,
        vec![Arc::new(FlakyTool { failures: usize::MAX, invocations: Arc::clone(&invocations) })],
        3,
        &dir,
    );

    let (rx, _token) = orchestrator.run("population statistics please".to_string());
    let events = collect_events(rx).await;
    let names: Vec<&str> = events.iter().map(event_name).collect();

    // No more than N plans.
    assert_eq!(names.iter().filter(|n| **n == "planning").count(), 3);
    assert!(!names.contains(&"result"));
    assert_eq!(*names.last().unwrap(), "done");

    let error_message = events
        .iter()
        .rev()
        .find_map(|e| match e {
            StreamEvent::Error { message } => Some(message.clone()),
            _ => None,
        })
        .expect("error event");
    assert!(error_message.contains("budget"));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

const SLOW_PLAN: &str = r#"{"steps": [
    {"type": "tool_call", "description": "slow fetch", "tool_name": "slow_fetch", "arguments": {}}
]}"#;

#[tokio::test]
async fn test_cancellation_mid_execute_ends_with_cancelled_then_done() {
    let dir = tempfile::tempdir().unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let llm = ScriptedLlm::new(vec![SLOW_PLAN]);
    let orchestrator = orchestrator_with(
        llm,
        vec![Arc::new(SlowTool { invocations: Arc::clone(&invocations) })],
        3,
        &dir,
    );

    let (mut rx, token) = orchestrator.run("fetch population data slowly".to_string());

    // Wait until the slow tool is in flight, then cancel.
    let mut seen = Vec::new();
    while let Some(event) = rx.recv().await {
        let name = event_name(&event);
        seen.push(event);
        if name == "step_started" {
            token.cancel();
            break;
        }
    }
    while let Some(event) = rx.recv().await {
        seen.push(event);
    }

    let names: Vec<&str> = seen.iter().map(event_name).collect();
    assert_eq!(names[names.len() - 2], "error");
    assert_eq!(names[names.len() - 1], "done");
    let StreamEvent::Error { message } = &seen[names.len() - 2] else {
        panic!("expected error event");
    };
    assert_eq!(message, "cancelled");

    // No further handler calls occur once cancelled.
    assert!(invocations.load(Ordering::SeqCst) <= 1);
}

#[tokio::test]
async fn test_invalid_plans_consume_budget_without_planning_events() {
    let dir = tempfile::tempdir().unwrap();
    // Three malformed plans in a row: unknown tool, empty plan, junk.
    let llm = ScriptedLlm::new(vec![
        r#"{"steps": [{"type": "tool_call", "tool_name": "imaginary", "arguments": {}}]}"#,
        r#"{"steps": []}"#,
        "not json at all",
    ]);
    let orchestrator = orchestrator_with(llm, Vec::new(), 3, &dir);

    let (rx, _token) = orchestrator.run("statistics please".to_string());
    let events = collect_events(rx).await;
    let names: Vec<&str> = events.iter().map(event_name).collect();

    assert!(!names.contains(&"planning"));
    assert!(!names.contains(&"result"));
    assert_eq!(*names.last().unwrap(), "done");
    let StreamEvent::Error { message } = &events[names.len() - 2] else {
        panic!("expected error");
    };
    assert!(message.contains("budget"));
}

#[tokio::test]
async fn test_non_streaming_answer_returns_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let llm = ScriptedLlm::new(vec![HAPPY_PLAN, "There are 2 users."]);
    let orchestrator = orchestrator_with(
        llm,
        vec![Arc::new(UsersTool { invocations })],
        3,
        &dir,
    );

    let aggregate = orchestrator.answer("how many users?", None).await.unwrap();
    assert!(aggregate.ok);
    assert_eq!(aggregate.answer.as_deref(), Some("There are 2 users."));
    assert_eq!(aggregate.executed_sql, vec!["SELECT COUNT(*) AS count FROM step1_fetch_users".to_string()]);
}
