//! Claude messages-API client.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{AgentermError, Result};
use crate::providers::{ChatMessage, CompletionRequest, ContentBlock, LlmProvider, ToolSchema};

/// Per-call timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Backoff ceiling for transport retries.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Transport retry attempts before the round is abandoned.
const MAX_ATTEMPTS: u32 = 5;

/// Claude API request format
#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
}

#[derive(Debug, Serialize)]
struct ApiTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

/// Claude API response format
#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Claude API client with capped-backoff retries on transport failures.
pub struct ClaudeClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl ClaudeClient {
    /// Create a client; falls back to `ANTHROPIC_API_KEY` when no key is
    /// passed.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        let api_key = api_key
            .or_else(|| env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| {
                AgentermError::validation(
                    "ANTHROPIC_API_KEY not found; set it in the environment or the config file",
                )
            })?;

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AgentermError::Transport {
                message: format!("failed to build HTTP client: {}", e),
                source: Some(Box::new(e)),
            })?;

        Ok(Self {
            client,
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn call_once(&self, request: &CompletionRequest) -> Result<Vec<ContentBlock>> {
        let tools: Vec<ApiTool<'_>> = request
            .tools
            .iter()
            .map(|t: &ToolSchema| ApiTool {
                name: &t.name,
                description: &t.description,
                input_schema: &t.input_schema,
            })
            .collect();
        let body = ApiRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: &request.messages,
            tools,
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentermError::Transport {
                message: format!("request to Claude API failed: {}", e),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            // 5xx and 429 are transport-kind: the caller may retry.
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(AgentermError::transport(format!(
                    "Claude API error ({}): {}",
                    status, error_text
                )));
            }
            return Err(AgentermError::state(format!(
                "Claude API error ({}): {}",
                status, error_text
            )));
        }

        let parsed: ApiResponse = response.json().await.map_err(|e| AgentermError::Transport {
            message: format!("failed to parse Claude API response: {}", e),
            source: Some(Box::new(e)),
        })?;

        Ok(parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ApiBlock::Text { text } => Some(ContentBlock::Text { text }),
                ApiBlock::ToolUse { id, name, input } => {
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                ApiBlock::Other => None,
            })
            .collect())
    }
}

#[async_trait]
impl LlmProvider for ClaudeClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Vec<ContentBlock>> {
        let mut backoff = Duration::from_secs(1);
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.call_once(&request).await {
                Ok(blocks) => return Ok(blocks),
                Err(e) if e.should_retry() && attempt < MAX_ATTEMPTS => {
                    warn!(attempt, "transient provider failure, retrying: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| AgentermError::transport("provider retries exhausted")))
    }
}
