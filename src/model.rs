//! Core entities.
//!
//! Storage layout is owned by the repository layer; these are the semantic
//! shapes the orchestrator, scheduler, and coordinator work with.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A project under orchestration: one repository, one orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub repo_path: PathBuf,
    pub playbook_id: Option<String>,
    pub profile: OrchestratorProfile,
    pub created_at: DateTime<Utc>,
}

/// Per-project orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorProfile {
    pub provider: String,
    pub model: String,
    /// Concurrent session cap for this project.
    pub max_parallel: usize,
    /// Gate for `project_blocked` notifications.
    pub notify_on_blocked: bool,
}

impl Default for OrchestratorProfile {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_parallel: 4,
            notify_on_blocked: true,
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    ReviewPending,
    ReviewRunning,
    ReviewChangesRequested,
    ReviewPassed,
    Completed,
    Failed,
}

/// A unit of work, optionally bound to a worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub worktree_id: Option<Uuid>,
    pub spec_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(project_id: Uuid, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            worktree_id: None,
            spec_path: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Worktree lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Merged,
    Removed,
}

/// An isolated git working tree under `<repo>/.worktrees/<slug>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub id: Uuid,
    pub project_id: Uuid,
    pub branch_name: String,
    pub path: PathBuf,
    pub task_id: Option<Uuid>,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
}

/// A session row as persisted for listings and the scheduler. The live
/// process itself is owned by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub project_id: Uuid,
    pub task_id: Option<Uuid>,
    pub terminal_id: String,
    pub agent_type: String,
    pub role: String,
    pub status: agent_session::SessionState,
    pub human_attached: bool,
    pub attached_viewer_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl SessionRow {
    /// Live sessions hold a concurrency slot; takeover still counts.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Role of a message in the orchestrator conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    ToolCall,
    ToolResult,
}

/// One persisted orchestrator conversation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorMessage {
    pub id: Uuid,
    pub project_id: Uuid,
    pub role: MessageRole,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl OrchestratorMessage {
    pub fn new(project_id: Uuid, role: MessageRole, content: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            role,
            content,
            created_at: Utc::now(),
        }
    }
}

/// Review cycle status; a strict subset of task statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    ReviewPending,
    ReviewRunning,
    ReviewChangesRequested,
    ReviewPassed,
}

impl ReviewStatus {
    /// Valid forward transitions of the review state machine.
    pub fn can_transition_to(&self, next: ReviewStatus) -> bool {
        use ReviewStatus::*;
        matches!(
            (self, next),
            (ReviewPending, ReviewRunning)
                | (ReviewRunning, ReviewChangesRequested)
                | (ReviewRunning, ReviewPassed)
                | (ReviewChangesRequested, ReviewRunning)
                | (ReviewChangesRequested, ReviewPending)
        )
    }
}

/// One coder → reviewer → verdict pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCycle {
    pub id: Uuid,
    pub task_id: Uuid,
    pub iteration: u32,
    pub status: ReviewStatus,
    pub commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Severity of a review finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Suggestion,
    Minor,
    Major,
    Critical,
}

impl IssueSeverity {
    /// Critical and major findings block task completion.
    pub fn blocks_completion(&self) -> bool {
        matches!(self, IssueSeverity::Critical | IssueSeverity::Major)
    }
}

/// Review issue resolution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Resolved,
    WontFix,
}

/// A single finding raised by a reviewer agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub id: Uuid,
    pub cycle_id: Uuid,
    pub severity: IssueSeverity,
    pub summary: String,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
}

/// Filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub project_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub status: Option<agent_session::SessionState>,
    pub active_only: bool,
}

/// Commit-message token that triggers review coordination.
pub const READY_FOR_REVIEW_TOKEN: &str = "[READY_FOR_REVIEW]";

/// Auto-commit message for a checkpoint at `ts`.
pub fn auto_commit_message(ts: DateTime<Utc>) -> String {
    format!("[auto] checkpoint {}", ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

/// Environment variables handed to spawned agent sessions.
pub type AgentEnv = HashMap<String, String>;
