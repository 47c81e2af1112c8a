//! The per-project orchestrator: one bounded LLM tool loop per user
//! message, turning intent into scheduler-gated actions with full
//! auditability.

pub mod prompt;
pub mod skills;
pub mod tools;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{MessageRole, OrchestratorMessage};
use crate::orchestrator::prompt::{PromptInputs, approval_granted, system_prompt};
use crate::orchestrator::tools::{ToolContext, execute, is_known_tool, is_mutating, tool_schemas};
use crate::protocol::StreamEvent;
use crate::providers::{ChatMessage, CompletionRequest, ContentBlock, LlmProvider};

/// Orchestrator tuning knobs, sourced from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_history: usize,
    pub max_tool_rounds: u32,
    pub max_tokens: u32,
    pub approval_keywords: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_history: 40,
            max_tool_rounds: 12,
            max_tokens: 4096,
            approval_keywords: crate::config::default_approval_keywords(),
        }
    }
}

/// Summarizes history beyond the prompt window. The strategy is pluggable;
/// the core only defines the interface.
#[async_trait]
pub trait HistorySummarizer: Send + Sync {
    /// Reduce `messages` to a single system-role digest under
    /// `budget_chars`.
    async fn summarize(
        &self,
        messages: &[OrchestratorMessage],
        budget_chars: usize,
    ) -> Result<String>;
}

/// Default summarizer: keeps the most recent content up to the budget.
pub struct TruncatingSummarizer;

#[async_trait]
impl HistorySummarizer for TruncatingSummarizer {
    async fn summarize(
        &self,
        messages: &[OrchestratorMessage],
        budget_chars: usize,
    ) -> Result<String> {
        let mut digest = String::new();
        for message in messages.iter().rev() {
            let line = format!(
                "[{:?}] {}\n",
                message.role,
                message.content.as_str().unwrap_or("(structured)")
            );
            if digest.len() + line.len() > budget_chars {
                break;
            }
            digest.insert_str(0, &line);
        }
        Ok(format!("Earlier conversation (condensed):\n{}", digest))
    }
}

/// The tool-calling loop driver.
pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: OrchestratorSettings) -> Self {
        Self { provider, settings }
    }

    /// Run one chat request. Stream events are emitted in order; the
    /// stream always terminates with `done` or `error`.
    pub async fn handle_message(
        &self,
        ctx: &ToolContext,
        user_message: &str,
        stream: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        let result = self.run_loop(ctx, user_message, &stream).await;
        match &result {
            Ok(()) => {
                let _ = stream.send(StreamEvent::Done);
            }
            Err(e) => {
                // Clients must never hang on a silent truncation.
                let _ = stream.send(StreamEvent::Error {
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_loop(
        &self,
        ctx: &ToolContext,
        user_message: &str,
        stream: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        let project_id = ctx.project.id;
        ctx.store
            .append_message(OrchestratorMessage::new(
                project_id,
                MessageRole::User,
                Value::String(user_message.to_string()),
            ))
            .await?;

        let approved = approval_granted(user_message, &self.settings.approval_keywords);
        info!(project = %project_id, approved, "orchestrator request");

        ctx.sync_session_rows().await?;
        let tasks = ctx.store.list_tasks(project_id).await?;
        let session_snapshots = ctx.sessions.list();
        let playbook = ctx
            .project
            .playbook_id
            .as_deref()
            .and_then(|id| ctx.registry.playbook(id));
        let skills = ctx.skills.summaries();
        let system = system_prompt(&PromptInputs {
            project: &ctx.project,
            tasks: &tasks,
            sessions: &session_snapshots,
            agents: ctx.registry.agents().collect(),
            playbook,
            skills: &skills,
        });

        let mut messages = self.load_history(ctx).await?;
        messages.push(ChatMessage::user_text(user_message));

        let tool_schemas = tool_schemas();
        for _round in 0..self.settings.max_tool_rounds {
            let blocks = self
                .provider
                .complete(CompletionRequest {
                    model: ctx.project.profile.model.clone(),
                    system: system.clone(),
                    messages: messages.clone(),
                    tools: tool_schemas.clone(),
                    max_tokens: self.settings.max_tokens,
                })
                .await?;

            let mut tool_results: Vec<(String, Value, bool)> = Vec::new();
            for block in &blocks {
                match block {
                    ContentBlock::Text { text } => {
                        let _ = stream.send(StreamEvent::Token { text: text.clone() });
                        ctx.store
                            .append_message(OrchestratorMessage::new(
                                project_id,
                                MessageRole::Assistant,
                                Value::String(text.clone()),
                            ))
                            .await?;
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        let _ = stream.send(StreamEvent::ToolCall {
                            name: name.clone(),
                            args: input.clone(),
                        });
                        ctx.store
                            .append_message(OrchestratorMessage::new(
                                project_id,
                                MessageRole::ToolCall,
                                json!({"name": name, "args": input}),
                            ))
                            .await?;

                        let (result, is_error) =
                            self.invoke_tool(ctx, name, input, approved).await;
                        let _ = stream.send(if is_error {
                            StreamEvent::tool_err(error_text(&result))
                        } else {
                            StreamEvent::tool_ok(result.clone())
                        });
                        ctx.store
                            .append_message(OrchestratorMessage::new(
                                project_id,
                                MessageRole::ToolResult,
                                json!({"name": name, "result": result, "is_error": is_error}),
                            ))
                            .await?;
                        tool_results.push((id.clone(), result, is_error));
                    }
                }
            }

            if tool_results.is_empty() {
                return Ok(());
            }
            messages.push(ChatMessage::assistant_blocks(&blocks));
            messages.push(ChatMessage::tool_results(tool_results));
        }

        warn!(project = %project_id, "tool round budget exhausted");
        Ok(())
    }

    /// Execute one tool call, mapping gate denials and failures onto
    /// structured tool results rather than loop errors.
    async fn invoke_tool(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: &Value,
        approved: bool,
    ) -> (Value, bool) {
        if !is_known_tool(name) {
            return (Value::String(format!("unknown tool: {}", name)), true);
        }
        if is_mutating(name) && !approved {
            // The LLM receives the block reason and can ask the user.
            return (
                json!({"error": "approval_required",
                       "detail": "mutating tools need explicit user confirmation"}),
                true,
            );
        }
        match execute(ctx, name, args).await {
            Ok(result) => (result, false),
            Err(e) => {
                warn!(tool = name, "tool failed: {}", e);
                (Value::String(e.to_string()), true)
            }
        }
    }

    /// Most recent user/assistant turns, oldest first. Tool entries stay
    /// in the audit log but are not replayed to the provider.
    async fn load_history(&self, ctx: &ToolContext) -> Result<Vec<ChatMessage>> {
        let history = ctx
            .store
            .list_messages(ctx.project.id, self.settings.max_history)
            .await?;
        Ok(history
            .into_iter()
            .filter_map(|m| match m.role {
                MessageRole::User => m
                    .content
                    .as_str()
                    .map(|s| ChatMessage::user_text(s.to_string())),
                MessageRole::Assistant => m.content.as_str().map(|s| ChatMessage {
                    role: "assistant".to_string(),
                    content: Value::String(s.to_string()),
                }),
                MessageRole::ToolCall | MessageRole::ToolResult => None,
            })
            .collect())
    }
}

/// Human-readable error text for a failed tool result.
fn error_text(result: &Value) -> String {
    result
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| result.as_str().map(str::to_string))
        .unwrap_or_else(|| result.to_string())
}

/// Background trigger: polls session status transitions and invokes the
/// orchestrator with a synthetic status-check message.
pub struct EventTrigger {
    orchestrator: Arc<Orchestrator>,
    ctx: ToolContext,
    poll_interval: std::time::Duration,
    /// Every Nth poll fires a periodic check even without transitions.
    periodic_every: u32,
}

impl EventTrigger {
    pub fn new(orchestrator: Arc<Orchestrator>, ctx: ToolContext) -> Self {
        Self {
            orchestrator,
            ctx,
            poll_interval: std::time::Duration::from_secs(15),
            periodic_every: 20,
        }
    }

    /// Run until cancelled. Synthetic requests drain their own stream.
    pub async fn run(self, cancel: tokio_util::sync::CancellationToken) {
        use std::collections::HashMap;
        let mut last: HashMap<String, agent_session::SessionState> = HashMap::new();
        let mut ticks: u32 = 0;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            ticks = ticks.wrapping_add(1);

            let mut reasons: Vec<String> = Vec::new();
            for snapshot in self.ctx.sessions.list() {
                let prev = last.insert(snapshot.id.clone(), snapshot.state);
                match (prev, snapshot.state) {
                    (Some(p), next) if p != next => {
                        let idle_left = p == agent_session::SessionState::Idle;
                        let review_ready = next == agent_session::SessionState::WaitingReview;
                        if idle_left || review_ready {
                            reasons.push(format!(
                                "session {} moved {:?} -> {:?}",
                                snapshot.id, p, next
                            ));
                        }
                    }
                    _ => {}
                }
            }
            if reasons.is_empty() && ticks % self.periodic_every != 0 {
                continue;
            }

            let note = if reasons.is_empty() {
                "Periodic status check: review session progress and unblock stalled work."
                    .to_string()
            } else {
                format!("Status check: {}", reasons.join("; "))
            };
            let (tx, mut rx) = mpsc::unbounded_channel();
            let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
            if let Err(e) = self
                .orchestrator
                .handle_message(&self.ctx, &note, tx)
                .await
            {
                warn!("status-check round failed: {}", e);
            }
            let _ = drain.await;
        }
    }
}
