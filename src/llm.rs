//! LLM client
//!
//! Thin chat-completions client plus the `LanguageModel` seam the agent is
//! written against. Everything the model returns is treated as untrusted text;
//! callers parse and validate before acting on it.

use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// The contract between the core and any LLM provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self { client, api_key, model, base_url }
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.1,
            "max_tokens": 1500
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NlqError::Timeout("LLM call exceeded 60s".to_string())
                } else {
                    NlqError::Llm(format!("LLM API call failed: {}", e))
                }
            })?;

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NlqError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| NlqError::Llm("No content in LLM response".to_string()))?;

        debug!("LLM returned {} chars", content.len());
        Ok(content.to_string())
    }
}

/// Extract a JSON object or array from an LLM response, tolerating markdown
/// code fences and surrounding prose.
pub fn extract_json(response: &str) -> String {
    let json_start = match (response.find('{'), response.find('[')) {
        (Some(obj), Some(arr)) => Some(obj.min(arr)),
        (obj, arr) => obj.or(arr),
    };
    let json_end = match (response.rfind('}'), response.rfind(']')) {
        (Some(obj), Some(arr)) => Some(obj.max(arr)),
        (obj, arr) => obj.or(arr),
    };

    if let (Some(start), Some(end)) = (json_start, json_end) {
        if start < end {
            return response[start..=end].to_string();
        }
    }

    if let Some(start) = response.find("```json") {
        let after_start = &response[start + 7..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim().to_string();
        }
    }
    if let Some(start) = response.find("```") {
        let after_start = &response[start + 3..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim().to_string();
        }
    }
    response.trim().to_string()
}

/// Extract a SQL statement from an LLM response. Handles ```sql fences and
/// responses that wrap the statement in prose.
pub fn extract_sql(response: &str) -> String {
    if let Some(start) = response.find("```sql") {
        let after_start = &response[start + 6..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim().trim_end_matches(';').to_string();
        }
    }
    if let Some(start) = response.find("```") {
        let after_start = &response[start + 3..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim().trim_end_matches(';').to_string();
        }
    }
    let upper = response.to_uppercase();
    if let Some(idx) = upper.find("SELECT").or_else(|| upper.find("WITH ")) {
        return response[idx..].trim().trim_end_matches(';').to_string();
    }
    response.trim().trim_end_matches(';').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_block() {
        let response = "Here's the JSON:\n```json\n{\"steps\": []}\n```";
        let extracted = extract_json(response);
        assert!(extracted.contains("steps"));
        assert!(serde_json::from_str::<serde_json::Value>(&extracted).is_ok());
    }

    #[test]
    fn test_extract_json_from_prose() {
        let response = "Sure thing. {\"a\": 1} Hope that helps!";
        assert_eq!(extract_json(response), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_sql_from_fence() {
        let response = "```sql\nSELECT COUNT(*) FROM users;\n```";
        assert_eq!(extract_sql(response), "SELECT COUNT(*) FROM users");
    }

    #[test]
    fn test_extract_sql_from_prose() {
        let response = "The query is: SELECT y FROM t WHERE x = 1;";
        assert_eq!(extract_sql(response), "SELECT y FROM t WHERE x = 1");
    }
}
