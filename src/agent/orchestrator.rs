//! Plan–execute–reflect orchestrator
//!
//! Drives one request through routing, planning, sequential step execution
//! and bounded reflection, emitting every state transition as a typed stream
//! event. Events for a single request are totally ordered; `done` is emitted
//! exactly once and last. Cancellation propagates to whichever call is in
//! flight and short-circuits reflection unconditionally.

use crate::agent::events::{AggregateResult, PlannedStep, StepStatus, StreamEvent};
use crate::agent::planner::{
    self, answer_prompt, plan_prompt, reflection_prompt, sql_prompt, AttemptRecord, Plan, Step,
    StepKind,
};
use crate::agent::router::{classify, Route};
use crate::agent::tools::{ExecuteSqlTool, FetchKosisTool, ToolRegistry};
use crate::backend::QueryResult;
use crate::error::{NlqError, Result};
use crate::llm::{extract_sql, ChatMessage, LanguageModel};
use crate::manager::ConnectionManager;
use crate::workspace::{normalize_table_name, ChartData, ChartHint, Workspace};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LLM_TIMEOUT: Duration = Duration::from_secs(60);
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 64;
const ANSWER_ROW_SAMPLE: usize = 5;

/// Everything a running request mutates, kept together so failure paths can
/// still assemble the aggregate payload with partial results.
struct RunContext {
    workspace: Workspace,
    executed_sql: Vec<String>,
    last_chart: Option<ChartData>,
    last_result: Option<QueryResult>,
}

impl RunContext {
    fn aggregate(&self, ok: bool, answer: Option<String>, error: Option<String>) -> AggregateResult {
        AggregateResult {
            ok,
            answer,
            tables: self.workspace.describe().unwrap_or_default(),
            executed_sql: self.executed_sql.clone(),
            chart: self.last_chart.clone(),
            data: self.last_result.clone(),
            error,
        }
    }
}

#[derive(Clone)]
struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    /// A dropped receiver means nobody is listening anymore; treat it the
    /// same as cancellation.
    async fn send(&self, event: StreamEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| NlqError::Cancelled)
    }
}

/// Race a future against the cancellation token.
async fn checked<T, F>(token: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(NlqError::Cancelled),
        result = future => result,
    }
}

pub struct Orchestrator {
    llm: Arc<dyn LanguageModel>,
    manager: Arc<ConnectionManager>,
    tools: Arc<ToolRegistry>,
    budget: usize,
}

/// The default tool set: handler-backed SQL plus the static KOSIS fetcher.
pub fn standard_tools(manager: &Arc<ConnectionManager>, kosis_api_key: &str) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.push(Arc::new(ExecuteSqlTool::new(Arc::clone(manager))));
    registry.push(Arc::new(FetchKosisTool::new(kosis_api_key.to_string())));
    registry
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        manager: Arc<ConnectionManager>,
        tools: Arc<ToolRegistry>,
        budget: usize,
    ) -> Self {
        Self { llm, manager, tools, budget: budget.max(1) }
    }

    /// Start a request and stream its events. The caller may cancel through
    /// the returned token at any time; the stream then ends with
    /// error("cancelled") followed by done.
    pub fn run(self: Arc<Self>, question: String) -> (mpsc::Receiver<StreamEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        let task_token = token.clone();
        tokio::spawn(async move {
            self.drive(question, EventSink { tx }, task_token).await;
        });
        (rx, token)
    }

    /// Run to completion without streaming, returning the aggregate payload.
    pub async fn answer(&self, question: &str, connection_id: Option<&str>) -> Result<AggregateResult> {
        if let Some(id) = connection_id {
            self.manager.activate(id).await?;
        }
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        let drain = async {
            while rx.recv().await.is_some() {}
        };
        let (aggregate, _) = tokio::join!(self.drive(question.to_string(), EventSink { tx }, token), drain);
        Ok(aggregate)
    }

    async fn drive(&self, question: String, sink: EventSink, token: CancellationToken) -> AggregateResult {
        match self.drive_inner(&question, &sink, &token).await {
            Ok(aggregate) => aggregate,
            Err(_) => {
                // Cancelled (or the listener went away): exactly one trailing
                // error("cancelled") + done.
                let _ = sink.tx.send(StreamEvent::Error { message: "cancelled".to_string() }).await;
                let _ = sink.tx.send(StreamEvent::Done).await;
                info!("Request cancelled");
                AggregateResult {
                    ok: false,
                    error: Some("cancelled".to_string()),
                    ..AggregateResult::default()
                }
            }
        }
    }

    /// Inner driver. Every non-cancellation failure is converted into either
    /// reflection or a terminal error event; `Err` escapes only for
    /// cancellation.
    async fn drive_inner(
        &self,
        question: &str,
        sink: &EventSink,
        token: &CancellationToken,
    ) -> Result<AggregateResult> {
        sink.send(StreamEvent::Start).await?;
        debug!("state: routing");

        if classify(question) == Route::General {
            return self.answer_general(question, sink, token).await;
        }

        let mut ctx = match Workspace::new() {
            Ok(workspace) => RunContext {
                workspace,
                executed_sql: Vec::new(),
                last_chart: None,
                last_result: None,
            },
            Err(e) => {
                let message = format!("failed to open workspace: {}", e);
                sink.send(StreamEvent::Error { message: message.clone() }).await?;
                sink.send(StreamEvent::Done).await?;
                return Ok(AggregateResult { ok: false, error: Some(message), ..AggregateResult::default() });
            }
        };

        let schema_summary = self.manager.active_schema_summary().await;
        let tool_specs = self.tools.specs_text();
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut plans_made = 0usize;

        loop {
            debug!("state: planning (plans so far: {})", plans_made);
            let plan = match self
                .obtain_plan(question, &schema_summary, &tool_specs, &ctx, &mut history, &mut plans_made, token)
                .await?
            {
                Some(plan) => plan,
                None => return self.finish_budget_exhausted(&ctx, &history, sink).await,
            };

            sink.send(StreamEvent::Planning {
                steps: plan
                    .steps
                    .iter()
                    .map(|s| PlannedStep {
                        index: s.index,
                        kind: s.kind,
                        description: s.description.clone(),
                    })
                    .collect(),
            })
            .await?;

            let mut failure: Option<(usize, String)> = None;
            for step in &plan.steps {
                debug!("state: executing_step({})", step.index);
                sink.send(StreamEvent::StepStarted {
                    index: step.index,
                    kind: step.kind,
                    description: step.description.clone(),
                })
                .await?;

                match self.execute_step(step, &mut ctx, sink, token).await {
                    Ok(()) => {}
                    Err(NlqError::Cancelled) => return Err(NlqError::Cancelled),
                    Err(e) => {
                        warn!("Step {} failed: {}", step.index, e);
                        failure = Some((step.index, e.to_string()));
                        break;
                    }
                }
            }

            match failure {
                None => return self.finish_success(question, &ctx, sink, token).await,
                Some((failed_step, error)) => {
                    debug!("state: reflecting");
                    history.push(AttemptRecord {
                        plan_json: serde_json::to_string(&plan).unwrap_or_default(),
                        failed_step: Some(failed_step),
                        error,
                    });
                    // Workspace tables produced so far stay usable; the next
                    // plan continues from the current state.
                }
            }
        }
    }

    async fn answer_general(
        &self,
        question: &str,
        sink: &EventSink,
        token: &CancellationToken,
    ) -> Result<AggregateResult> {
        debug!("state: finalising (general)");
        let messages = vec![
            ChatMessage::system(
                "You are a helpful assistant for a data analysis service. Answer conversationally. \
                 When a question would benefit from actual data, mention that the user can ask a \
                 data question to query connected sources.",
            ),
            ChatMessage::user(question),
        ];
        match self.ask_llm(&messages, token).await {
            Ok(text) => {
                let aggregate = AggregateResult {
                    ok: true,
                    answer: Some(text),
                    ..AggregateResult::default()
                };
                sink.send(StreamEvent::Result { payload: aggregate.clone() }).await?;
                sink.send(StreamEvent::Done).await?;
                Ok(aggregate)
            }
            Err(NlqError::Cancelled) => Err(NlqError::Cancelled),
            Err(e) => {
                let message = e.to_string();
                sink.send(StreamEvent::Error { message: message.clone() }).await?;
                sink.send(StreamEvent::Done).await?;
                Ok(AggregateResult { ok: false, error: Some(message), ..AggregateResult::default() })
            }
        }
    }

    /// Produce the next validated plan, spending budget on every LLM plan
    /// production (including ones that fail validation). Returns None when
    /// the budget is exhausted.
    #[allow(clippy::too_many_arguments)]
    async fn obtain_plan(
        &self,
        question: &str,
        schema_summary: &str,
        tool_specs: &str,
        ctx: &RunContext,
        history: &mut Vec<AttemptRecord>,
        plans_made: &mut usize,
        token: &CancellationToken,
    ) -> Result<Option<Plan>> {
        loop {
            if *plans_made >= self.budget {
                return Ok(None);
            }
            let describe = ctx.workspace.describe_text();
            let messages = if history.is_empty() {
                plan_prompt(question, schema_summary, tool_specs, &describe)
            } else {
                reflection_prompt(question, schema_summary, tool_specs, &describe, history)
            };
            *plans_made += 1;

            let raw = match self.ask_llm(&messages, token).await {
                Ok(raw) => raw,
                Err(NlqError::Cancelled) => return Err(NlqError::Cancelled),
                Err(e) => {
                    warn!("Plan generation failed: {}", e);
                    history.push(AttemptRecord {
                        plan_json: "(no plan produced)".to_string(),
                        failed_step: None,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let existing = ctx.workspace.table_names();
            match planner::parse_plan(&raw)
                .and_then(|plan| planner::validate_plan(&plan, &self.tools, &existing).map(|_| plan))
            {
                Ok(plan) => {
                    info!("Accepted plan with {} steps", plan.steps.len());
                    return Ok(Some(plan));
                }
                Err(e) => {
                    warn!("Plan rejected: {}", e);
                    history.push(AttemptRecord {
                        plan_json: crate::llm::extract_json(&raw),
                        failed_step: None,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    async fn execute_step(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        sink: &EventSink,
        token: &CancellationToken,
    ) -> Result<()> {
        match step.kind {
            StepKind::ToolCall => self.execute_tool_call(step, ctx, sink, token).await,
            StepKind::Query => self.execute_query(step, ctx, sink, token).await,
            StepKind::Visualization => self.execute_visualization(step, ctx, sink).await,
        }
    }

    async fn execute_tool_call(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        sink: &EventSink,
        token: &CancellationToken,
    ) -> Result<()> {
        let tool_name = step.tool_name.clone().unwrap_or_default();
        let tool = match self.tools.get(&tool_name) {
            Some(tool) => tool,
            None => {
                let error = format!("unknown tool '{}'", tool_name);
                sink.send(StreamEvent::ToolCall {
                    tool_name,
                    status: StepStatus::Error,
                    data: Some(json!({ "error": error })),
                })
                .await?;
                return Err(NlqError::PlanInvalid(error));
            }
        };

        let invocation = async {
            tokio::time::timeout(TOOL_TIMEOUT, tool.invoke(&step.arguments))
                .await
                .map_err(|_| {
                    NlqError::Timeout(format!(
                        "tool '{}' exceeded {}s",
                        tool_name,
                        TOOL_TIMEOUT.as_secs()
                    ))
                })?
        };

        match checked(token, invocation).await {
            Ok(result) if result.success => {
                let source = format!("step{}_{}", step.index, tool_name);
                match ctx.workspace.register(&source, &result) {
                    Ok(table_name) => {
                        // Surface the SQL a handler-backed tool actually ran.
                        let mut data = json!({
                            "table_name": table_name,
                            "row_count": result.row_count,
                        });
                        if let Some(sql) = step.arguments.get("sql").and_then(|v| v.as_str()) {
                            data["sql"] = json!(sql);
                        }
                        sink.send(StreamEvent::ToolCall {
                            tool_name,
                            status: StepStatus::Completed,
                            data: Some(data),
                        })
                        .await?;
                        ctx.last_result = Some(result);
                        Ok(())
                    }
                    Err(e) => {
                        let error = e.to_string();
                        sink.send(StreamEvent::ToolCall {
                            tool_name,
                            status: StepStatus::Error,
                            data: Some(json!({ "error": error })),
                        })
                        .await?;
                        Err(e)
                    }
                }
            }
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "tool returned no data".to_string());
                sink.send(StreamEvent::ToolCall {
                    tool_name,
                    status: StepStatus::Error,
                    data: Some(json!({ "error": error })),
                })
                .await?;
                Err(NlqError::QueryFailed(error))
            }
            Err(NlqError::Cancelled) => Err(NlqError::Cancelled),
            Err(e) => {
                let error = e.to_string();
                sink.send(StreamEvent::ToolCall {
                    tool_name,
                    status: StepStatus::Error,
                    data: Some(json!({ "error": error })),
                })
                .await?;
                Err(e)
            }
        }
    }

    async fn execute_query(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        sink: &EventSink,
        token: &CancellationToken,
    ) -> Result<()> {
        let sql = match step.sql.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(inline) => inline.to_string(),
            None => {
                let subquestion = step
                    .question
                    .clone()
                    .unwrap_or_else(|| step.description.clone());
                let messages = sql_prompt(&subquestion, &ctx.workspace.describe_text());
                match self.ask_llm(&messages, token).await {
                    Ok(raw) => extract_sql(&raw),
                    Err(NlqError::Cancelled) => return Err(NlqError::Cancelled),
                    Err(e) => {
                        // No SQL was produced, but the failed step must still
                        // show up in the stream.
                        sink.send(StreamEvent::Query {
                            sql: String::new(),
                            status: StepStatus::Error,
                            data: Some(json!({ "error": e.to_string() })),
                        })
                        .await?;
                        return Err(e);
                    }
                }
            }
        };

        match ctx.workspace.sql(&sql) {
            Ok(result) => {
                ctx.executed_sql.push(sql.clone());
                let source = format!("step{}_query", step.index);
                let table_name = match ctx.workspace.register(&source, &result) {
                    Ok(name) => Some(name),
                    // A valid result with zero columns cannot be a table;
                    // the query itself still succeeded.
                    Err(_) => None,
                };
                sink.send(StreamEvent::Query {
                    sql,
                    status: StepStatus::Completed,
                    data: Some(json!({
                        "table_name": table_name,
                        "row_count": result.row_count,
                    })),
                })
                .await?;
                ctx.last_result = Some(result);
                Ok(())
            }
            Err(e) => {
                ctx.executed_sql.push(sql.clone());
                let error = e.to_string();
                sink.send(StreamEvent::Query {
                    sql,
                    status: StepStatus::Error,
                    data: Some(json!({ "error": error })),
                })
                .await?;
                Err(e)
            }
        }
    }

    async fn execute_visualization(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        sink: &EventSink,
    ) -> Result<()> {
        let table = normalize_table_name(step.table.as_deref().unwrap_or_default());
        let hint = step.chart.clone().unwrap_or_else(ChartHint::default);
        match ctx.workspace.chartify(&table, &hint) {
            Ok(chart) => {
                sink.send(StreamEvent::Visualization { chart_data: chart.clone() }).await?;
                ctx.last_chart = Some(chart);
                Ok(())
            }
            // The event set has no visualization error variant and the
            // top-level error event is terminal, so a failed chart goes
            // straight into reflection history without an emission.
            Err(e) => Err(e),
        }
    }

    async fn finish_success(
        &self,
        question: &str,
        ctx: &RunContext,
        sink: &EventSink,
        token: &CancellationToken,
    ) -> Result<AggregateResult> {
        debug!("state: finalising");
        let digest = result_digest(&ctx.last_result);
        let messages = answer_prompt(question, &ctx.executed_sql, &digest);
        let answer = match self.ask_llm(&messages, token).await {
            Ok(text) => Some(text),
            Err(NlqError::Cancelled) => return Err(NlqError::Cancelled),
            Err(e) => {
                // The run itself succeeded; a missing prose summary is not
                // worth failing it over.
                warn!("Answer generation failed: {}", e);
                None
            }
        };

        let aggregate = ctx.aggregate(true, answer, None);
        sink.send(StreamEvent::Result { payload: aggregate.clone() }).await?;
        sink.send(StreamEvent::Done).await?;
        debug!("state: done");
        Ok(aggregate)
    }

    async fn finish_budget_exhausted(
        &self,
        ctx: &RunContext,
        history: &[AttemptRecord],
        sink: &EventSink,
    ) -> Result<AggregateResult> {
        debug!("state: finalising (budget exhausted)");
        let attempts: Vec<String> = history
            .iter()
            .enumerate()
            .map(|(i, record)| format!("attempt {}: {}", i + 1, record.error))
            .collect();
        let message = format!(
            "reflection budget exhausted after {} plans; {}",
            self.budget,
            attempts.join("; ")
        );
        sink.send(StreamEvent::Error { message: message.clone() }).await?;
        sink.send(StreamEvent::Done).await?;
        debug!("state: done");
        Ok(ctx.aggregate(false, None, Some(message)))
    }

    async fn ask_llm(&self, messages: &[ChatMessage], token: &CancellationToken) -> Result<String> {
        let call = async {
            tokio::time::timeout(LLM_TIMEOUT, self.llm.chat(messages))
                .await
                .map_err(|_| NlqError::Timeout(format!("LLM call exceeded {}s", LLM_TIMEOUT.as_secs())))?
        };
        checked(token, call).await
    }
}

fn result_digest(result: &Option<QueryResult>) -> String {
    match result {
        None => "no data produced".to_string(),
        Some(result) if result.rows.is_empty() => "query returned no rows".to_string(),
        Some(result) => {
            let mut out = format!("columns: {}\n", result.columns.join(", "));
            for row in result.rows.iter().take(ANSWER_ROW_SAMPLE) {
                out.push_str(&serde_json::to_string(row).unwrap_or_default());
                out.push('\n');
            }
            if result.rows.len() > ANSWER_ROW_SAMPLE {
                out.push_str(&format!("... {} rows total", result.rows.len()));
            }
            out
        }
    }
}
