//! LLM providers.
//!
//! The orchestrator talks to providers through [`LlmProvider`]; content
//! comes back as blocks so tool calls and text interleave naturally.

pub mod claude;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use claude::ClaudeClient;

/// JSON-schema description of one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A block of assistant output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

/// One conversation turn. `content` holds provider-format blocks: plain
/// text for user/assistant turns, `tool_result` blocks for tool feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Value::String(text.into()),
        }
    }

    pub fn assistant_blocks(blocks: &[ContentBlock]) -> Self {
        Self {
            role: "assistant".to_string(),
            content: serde_json::to_value(blocks).unwrap_or(Value::Null),
        }
    }

    /// Tool results travel back as a user turn of `tool_result` blocks.
    pub fn tool_results(results: Vec<(String, Value, bool)>) -> Self {
        let blocks: Vec<Value> = results
            .into_iter()
            .map(|(tool_use_id, content, is_error)| {
                serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content.to_string(),
                    "is_error": is_error,
                })
            })
            .collect();
        Self {
            role: "user".to_string(),
            content: Value::Array(blocks),
        }
    }
}

/// A single completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
}

/// Provider abstraction the orchestrator loop drives.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Vec<ContentBlock>>;
}

/// Scripted provider for tests: returns canned block sequences in order,
/// then empty text.
pub struct ScriptedProvider {
    responses: std::sync::Mutex<std::collections::VecDeque<Vec<ContentBlock>>>,
    pub requests: std::sync::Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Vec<ContentBlock>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Vec<ContentBlock>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(next.unwrap_or_else(|| {
            vec![ContentBlock::Text {
                text: "Done.".to_string(),
            }]
        }))
    }
}
