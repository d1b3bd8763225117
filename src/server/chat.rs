//! OpenAI-compatible chat endpoint
//!
//! Accepts {messages, model, stream}. With stream=true every StreamEvent
//! becomes one `data: <json>` frame, terminated by `data: [DONE]`.

use super::{ApiError, AppState};
use crate::agent::StreamEvent;
use crate::error::NlqError;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ChatMessageBody {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessageBody>,
    #[serde(default)]
    pub stream: bool,
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let question = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .ok_or_else(|| NlqError::QueryFailed("no user message found".to_string()))?;

    info!("Chat request: {}", question);
    let model = request.model.unwrap_or_else(|| "nlq-engine".to_string());

    if request.stream {
        let (rx, _token) = Arc::clone(&state.orchestrator).run(question);
        let frames = ReceiverStream::new(rx)
            .map(|event: StreamEvent| {
                let payload = serde_json::to_string(&event)
                    .unwrap_or_else(|_| "{\"type\":\"error\"}".to_string());
                Ok::<Event, Infallible>(Event::default().data(payload))
            })
            .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))));
        return Ok(Sse::new(frames).keep_alive(KeepAlive::default()).into_response());
    }

    let aggregate = state.orchestrator.answer(&question, None).await?;
    let content = aggregate
        .answer
        .clone()
        .or_else(|| aggregate.error.clone())
        .unwrap_or_else(|| "no answer produced".to_string());

    let now = Utc::now().timestamp();
    Ok(Json(json!({
        "id": format!("chatcmpl-{}", now),
        "object": "chat.completion",
        "created": now,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "nlq": aggregate,
    }))
    .into_response())
}
