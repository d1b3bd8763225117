//! Wire format of stream events: one JSON object per event with a snake_case
//! type tag, matching what the SSE layer emits frame by frame.

use nlq_engine::agent::events::{AggregateResult, StepStatus, StreamEvent};
use nlq_engine::agent::planner::StepKind;
use serde_json::{json, Value};

fn to_json(event: &StreamEvent) -> Value {
    serde_json::to_value(event).unwrap()
}

#[test]
fn test_simple_events_serialise_with_type_tags() {
    assert_eq!(to_json(&StreamEvent::Start), json!({"type": "start"}));
    assert_eq!(to_json(&StreamEvent::Done), json!({"type": "done"}));
    assert_eq!(
        to_json(&StreamEvent::Error { message: "cancelled".to_string() }),
        json!({"type": "error", "message": "cancelled"})
    );
}

#[test]
fn test_step_events_carry_index_kind_description() {
    let event = StreamEvent::StepStarted {
        index: 2,
        kind: StepKind::Query,
        description: "count users".to_string(),
    };
    assert_eq!(
        to_json(&event),
        json!({
            "type": "step_started",
            "index": 2,
            "kind": "query",
            "description": "count users"
        })
    );
}

#[test]
fn test_tool_call_event_statuses() {
    let completed = StreamEvent::ToolCall {
        tool_name: "fetch_kosis_data".to_string(),
        status: StepStatus::Completed,
        data: Some(json!({"table_name": "step1_fetch_kosis_data", "row_count": 5})),
    };
    let value = to_json(&completed);
    assert_eq!(value["type"], "tool_call");
    assert_eq!(value["status"], "completed");
    assert_eq!(value["data"]["row_count"], 5);

    let errored = StreamEvent::ToolCall {
        tool_name: "fetch_kosis_data".to_string(),
        status: StepStatus::Error,
        data: None,
    };
    let value = to_json(&errored);
    assert_eq!(value["status"], "error");
    assert!(value.get("data").is_none());
}

#[test]
fn test_query_event_exposes_executed_sql() {
    let event = StreamEvent::Query {
        sql: "SELECT * FROM statistics_search WHERE searchNm = '인구'".to_string(),
        status: StepStatus::Completed,
        data: None,
    };
    let value = to_json(&event);
    assert_eq!(value["type"], "query");
    assert_eq!(value["sql"], "SELECT * FROM statistics_search WHERE searchNm = '인구'");
}

#[test]
fn test_result_event_nests_payload_under_final() {
    let event = StreamEvent::Result {
        payload: AggregateResult {
            ok: true,
            answer: Some("done".to_string()),
            ..AggregateResult::default()
        },
    };
    let value = to_json(&event);
    assert_eq!(value["type"], "result");
    assert_eq!(value["final"]["ok"], true);
    assert_eq!(value["final"]["answer"], "done");
}

#[test]
fn test_events_round_trip() {
    let event = StreamEvent::Error { message: "boom".to_string() };
    let json = serde_json::to_string(&event).unwrap();
    let back: StreamEvent = serde_json::from_str(&json).unwrap();
    assert!(matches!(back, StreamEvent::Error { message } if message == "boom"));
}
