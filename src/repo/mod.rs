//! Repository contracts.
//!
//! The only thing the core requires of storage. The default deployment
//! runs on [`memory::MemoryStore`]; a relational store slots in behind the
//! same traits. All implementations serialize writes per row.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    OrchestratorMessage, OrchestratorProfile, Project, ReviewCycle, ReviewIssue, ReviewStatus,
    SessionFilter, SessionRow, Task, Worktree, WorktreeStatus,
};

#[async_trait]
pub trait ProjectRepo: Send + Sync {
    async fn create_project(&self, project: Project) -> Result<()>;
    async fn get_project(&self, id: Uuid) -> Result<Project>;
    async fn list_projects(&self) -> Result<Vec<Project>>;
    async fn update_project(&self, project: Project) -> Result<()>;
    async fn delete_project(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn create_task(&self, task: Task) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Task>;
    async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<Task>>;
    async fn update_task(&self, task: Task) -> Result<()>;
    /// Unlink every task pointing at this worktree (post-merge cleanup).
    async fn clear_worktree(&self, worktree_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn create_session_row(&self, row: SessionRow) -> Result<()>;
    async fn get_session_row(&self, id: &str) -> Result<SessionRow>;
    async fn update_session_row(&self, row: SessionRow) -> Result<()>;
    async fn list_session_rows(&self, filter: SessionFilter) -> Result<Vec<SessionRow>>;
}

#[async_trait]
pub trait WorktreeRepo: Send + Sync {
    async fn create_worktree(&self, worktree: Worktree) -> Result<()>;
    async fn get_worktree(&self, id: Uuid) -> Result<Worktree>;
    async fn list_worktrees(
        &self,
        project_id: Uuid,
        status: Option<WorktreeStatus>,
    ) -> Result<Vec<Worktree>>;
    async fn update_worktree_status(&self, id: Uuid, status: WorktreeStatus) -> Result<()>;
}

#[async_trait]
pub trait OrchestratorRepo: Send + Sync {
    async fn append_message(&self, message: OrchestratorMessage) -> Result<()>;
    /// Most recent `limit` messages in chronological order.
    async fn list_messages(&self, project_id: Uuid, limit: usize)
    -> Result<Vec<OrchestratorMessage>>;
    async fn get_profile(&self, project_id: Uuid) -> Result<OrchestratorProfile>;
    async fn update_profile(&self, project_id: Uuid, profile: OrchestratorProfile) -> Result<()>;
}

#[async_trait]
pub trait ReviewRepo: Send + Sync {
    async fn create_cycle(&self, cycle: ReviewCycle) -> Result<()>;
    async fn get_cycle(&self, id: Uuid) -> Result<ReviewCycle>;
    /// The active (latest-iteration) cycle for a task.
    async fn latest_cycle(&self, task_id: Uuid) -> Result<Option<ReviewCycle>>;
    /// Validated status transition. Returns `true` when the status actually
    /// changed; milestone events must only fire on `true`.
    async fn transition_cycle(&self, id: Uuid, next: ReviewStatus) -> Result<bool>;
    async fn bump_iteration(&self, id: Uuid) -> Result<u32>;
    async fn set_commit_hash(&self, id: Uuid, commit: &str) -> Result<()>;
    async fn create_issue(&self, issue: ReviewIssue) -> Result<()>;
    async fn list_issues(&self, cycle_id: Uuid) -> Result<Vec<ReviewIssue>>;
    async fn update_issue(&self, issue: ReviewIssue) -> Result<()>;
    /// Close open blocking issues for a cycle (on an approved verdict).
    async fn resolve_blocking_issues(&self, cycle_id: Uuid) -> Result<usize>;
}

/// Everything the orchestrator and coordinator need from storage.
pub trait Store:
    ProjectRepo + TaskRepo + SessionRepo + WorktreeRepo + OrchestratorRepo + ReviewRepo
{
}

impl<T> Store for T where
    T: ProjectRepo + TaskRepo + SessionRepo + WorktreeRepo + OrchestratorRepo + ReviewRepo
{
}
