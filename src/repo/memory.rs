//! In-memory store backing tests and the default single-node deployment.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{AgentermError, Result};
use crate::model::{
    IssueStatus, OrchestratorMessage, OrchestratorProfile, Project, ReviewCycle, ReviewIssue,
    ReviewStatus, SessionFilter, SessionRow, Task, Worktree, WorktreeStatus,
};
use crate::repo::{
    OrchestratorRepo, ProjectRepo, ReviewRepo, SessionRepo, TaskRepo, WorktreeRepo,
};

/// DashMap-backed store. Writes are serialized per entity map entry.
#[derive(Default)]
pub struct MemoryStore {
    projects: DashMap<Uuid, Project>,
    tasks: DashMap<Uuid, Task>,
    sessions: DashMap<String, SessionRow>,
    worktrees: DashMap<Uuid, Worktree>,
    messages: DashMap<Uuid, Vec<OrchestratorMessage>>,
    profiles: DashMap<Uuid, OrchestratorProfile>,
    cycles: DashMap<Uuid, ReviewCycle>,
    issues: DashMap<Uuid, ReviewIssue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectRepo for MemoryStore {
    async fn create_project(&self, project: Project) -> Result<()> {
        if self.projects.contains_key(&project.id) {
            return Err(AgentermError::state(format!(
                "project already exists: {}",
                project.id
            )));
        }
        self.projects.insert(project.id, project);
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> Result<Project> {
        self.projects
            .get(&id)
            .map(|p| p.clone())
            .ok_or_else(|| AgentermError::state(format!("unknown project: {}", id)))
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut all: Vec<Project> = self.projects.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|p| p.created_at);
        Ok(all)
    }

    async fn update_project(&self, project: Project) -> Result<()> {
        if !self.projects.contains_key(&project.id) {
            return Err(AgentermError::state(format!(
                "unknown project: {}",
                project.id
            )));
        }
        self.projects.insert(project.id, project);
        Ok(())
    }

    async fn delete_project(&self, id: Uuid) -> Result<()> {
        self.projects.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl TaskRepo for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<()> {
        self.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.tasks
            .get(&id)
            .map(|t| t.clone())
            .ok_or_else(|| AgentermError::state(format!("unknown task: {}", id)))
    }

    async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|e| e.value().project_id == project_id)
            .map(|e| e.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn update_task(&self, mut task: Task) -> Result<()> {
        if !self.tasks.contains_key(&task.id) {
            return Err(AgentermError::state(format!("unknown task: {}", task.id)));
        }
        task.updated_at = chrono::Utc::now();
        self.tasks.insert(task.id, task);
        Ok(())
    }

    async fn clear_worktree(&self, worktree_id: Uuid) -> Result<()> {
        for mut entry in self.tasks.iter_mut() {
            if entry.value().worktree_id == Some(worktree_id) {
                entry.value_mut().worktree_id = None;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionRepo for MemoryStore {
    async fn create_session_row(&self, row: SessionRow) -> Result<()> {
        self.sessions.insert(row.id.clone(), row);
        Ok(())
    }

    async fn get_session_row(&self, id: &str) -> Result<SessionRow> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| AgentermError::state(format!("unknown session: {}", id)))
    }

    async fn update_session_row(&self, row: SessionRow) -> Result<()> {
        self.sessions.insert(row.id.clone(), row);
        Ok(())
    }

    async fn list_session_rows(&self, filter: SessionFilter) -> Result<Vec<SessionRow>> {
        let mut rows: Vec<SessionRow> = self
            .sessions
            .iter()
            .filter(|e| {
                let row = e.value();
                if let Some(pid) = filter.project_id {
                    if row.project_id != pid {
                        return false;
                    }
                }
                if let Some(tid) = filter.task_id {
                    if row.task_id != Some(tid) {
                        return false;
                    }
                }
                if let Some(status) = filter.status {
                    if row.status != status {
                        return false;
                    }
                }
                if filter.active_only && !row.is_active() {
                    return false;
                }
                true
            })
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl WorktreeRepo for MemoryStore {
    async fn create_worktree(&self, worktree: Worktree) -> Result<()> {
        self.worktrees.insert(worktree.id, worktree);
        Ok(())
    }

    async fn get_worktree(&self, id: Uuid) -> Result<Worktree> {
        self.worktrees
            .get(&id)
            .map(|w| w.clone())
            .ok_or_else(|| AgentermError::state(format!("unknown worktree: {}", id)))
    }

    async fn list_worktrees(
        &self,
        project_id: Uuid,
        status: Option<WorktreeStatus>,
    ) -> Result<Vec<Worktree>> {
        let mut trees: Vec<Worktree> = self
            .worktrees
            .iter()
            .filter(|e| {
                e.value().project_id == project_id
                    && status.map_or(true, |s| e.value().status == s)
            })
            .map(|e| e.value().clone())
            .collect();
        trees.sort_by_key(|w| w.created_at);
        Ok(trees)
    }

    async fn update_worktree_status(&self, id: Uuid, status: WorktreeStatus) -> Result<()> {
        let mut entry = self
            .worktrees
            .get_mut(&id)
            .ok_or_else(|| AgentermError::state(format!("unknown worktree: {}", id)))?;
        entry.value_mut().status = status;
        Ok(())
    }
}

#[async_trait]
impl OrchestratorRepo for MemoryStore {
    async fn append_message(&self, message: OrchestratorMessage) -> Result<()> {
        self.messages
            .entry(message.project_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn list_messages(
        &self,
        project_id: Uuid,
        limit: usize,
    ) -> Result<Vec<OrchestratorMessage>> {
        let messages = self
            .messages
            .get(&project_id)
            .map(|m| m.clone())
            .unwrap_or_default();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn get_profile(&self, project_id: Uuid) -> Result<OrchestratorProfile> {
        if let Some(profile) = self.profiles.get(&project_id) {
            return Ok(profile.clone());
        }
        // Fall back to the project row, then defaults.
        Ok(self
            .projects
            .get(&project_id)
            .map(|p| p.profile.clone())
            .unwrap_or_default())
    }

    async fn update_profile(&self, project_id: Uuid, profile: OrchestratorProfile) -> Result<()> {
        self.profiles.insert(project_id, profile);
        Ok(())
    }
}

#[async_trait]
impl ReviewRepo for MemoryStore {
    async fn create_cycle(&self, cycle: ReviewCycle) -> Result<()> {
        self.cycles.insert(cycle.id, cycle);
        Ok(())
    }

    async fn get_cycle(&self, id: Uuid) -> Result<ReviewCycle> {
        self.cycles
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| AgentermError::state(format!("unknown review cycle: {}", id)))
    }

    async fn latest_cycle(&self, task_id: Uuid) -> Result<Option<ReviewCycle>> {
        Ok(self
            .cycles
            .iter()
            .filter(|e| e.value().task_id == task_id)
            .max_by_key(|e| (e.value().iteration, e.value().created_at))
            .map(|e| e.value().clone()))
    }

    async fn transition_cycle(&self, id: Uuid, next: ReviewStatus) -> Result<bool> {
        let mut entry = self
            .cycles
            .get_mut(&id)
            .ok_or_else(|| AgentermError::state(format!("unknown review cycle: {}", id)))?;
        let cycle = entry.value_mut();
        if cycle.status == next {
            return Ok(false);
        }
        if !cycle.status.can_transition_to(next) {
            return Err(AgentermError::state(format!(
                "invalid review transition: {:?} -> {:?}",
                cycle.status, next
            )));
        }
        cycle.status = next;
        cycle.updated_at = chrono::Utc::now();
        Ok(true)
    }

    async fn bump_iteration(&self, id: Uuid) -> Result<u32> {
        let mut entry = self
            .cycles
            .get_mut(&id)
            .ok_or_else(|| AgentermError::state(format!("unknown review cycle: {}", id)))?;
        let cycle = entry.value_mut();
        cycle.iteration += 1;
        cycle.updated_at = chrono::Utc::now();
        Ok(cycle.iteration)
    }

    async fn set_commit_hash(&self, id: Uuid, commit: &str) -> Result<()> {
        let mut entry = self
            .cycles
            .get_mut(&id)
            .ok_or_else(|| AgentermError::state(format!("unknown review cycle: {}", id)))?;
        entry.value_mut().commit_hash = Some(commit.to_string());
        Ok(())
    }

    async fn create_issue(&self, issue: ReviewIssue) -> Result<()> {
        self.issues.insert(issue.id, issue);
        Ok(())
    }

    async fn list_issues(&self, cycle_id: Uuid) -> Result<Vec<ReviewIssue>> {
        let mut issues: Vec<ReviewIssue> = self
            .issues
            .iter()
            .filter(|e| e.value().cycle_id == cycle_id)
            .map(|e| e.value().clone())
            .collect();
        issues.sort_by_key(|i| i.created_at);
        Ok(issues)
    }

    async fn update_issue(&self, issue: ReviewIssue) -> Result<()> {
        self.issues.insert(issue.id, issue);
        Ok(())
    }

    async fn resolve_blocking_issues(&self, cycle_id: Uuid) -> Result<usize> {
        let mut resolved = 0;
        for mut entry in self.issues.iter_mut() {
            let issue = entry.value_mut();
            if issue.cycle_id == cycle_id
                && issue.status == IssueStatus::Open
                && issue.severity.blocks_completion()
            {
                issue.status = IssueStatus::Resolved;
                resolved += 1;
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IssueSeverity, TaskStatus};

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            name: "demo".to_string(),
            repo_path: "/tmp/demo".into(),
            playbook_id: None,
            profile: OrchestratorProfile::default(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_project_is_rejected() {
        let store = MemoryStore::new();
        let p = project();
        store.create_project(p.clone()).await.unwrap();
        assert!(store.create_project(p).await.is_err());
    }

    #[tokio::test]
    async fn clear_worktree_unlinks_tasks() {
        let store = MemoryStore::new();
        let p = project();
        let wt = Uuid::new_v4();
        let mut task = Task::new(p.id, "t", "d");
        task.worktree_id = Some(wt);
        task.status = TaskStatus::InProgress;
        store.create_task(task.clone()).await.unwrap();

        store.clear_worktree(wt).await.unwrap();
        assert_eq!(store.get_task(task.id).await.unwrap().worktree_id, None);
    }

    #[tokio::test]
    async fn invalid_cycle_transition_is_rejected() {
        let store = MemoryStore::new();
        let now = chrono::Utc::now();
        let cycle = ReviewCycle {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            iteration: 1,
            status: ReviewStatus::ReviewPending,
            commit_hash: None,
            created_at: now,
            updated_at: now,
        };
        store.create_cycle(cycle.clone()).await.unwrap();

        // Skipping the running state is invalid.
        assert!(
            store
                .transition_cycle(cycle.id, ReviewStatus::ReviewPassed)
                .await
                .is_err()
        );
        // Same-status transition reports no change, no error.
        assert!(
            !store
                .transition_cycle(cycle.id, ReviewStatus::ReviewPending)
                .await
                .unwrap()
        );
        assert!(
            store
                .transition_cycle(cycle.id, ReviewStatus::ReviewRunning)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn resolve_blocking_issues_skips_minor() {
        let store = MemoryStore::new();
        let cycle_id = Uuid::new_v4();
        for severity in [IssueSeverity::Critical, IssueSeverity::Minor] {
            store
                .create_issue(ReviewIssue {
                    id: Uuid::new_v4(),
                    cycle_id,
                    severity,
                    summary: "finding".to_string(),
                    status: IssueStatus::Open,
                    created_at: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.resolve_blocking_issues(cycle_id).await.unwrap(), 1);
        let open: Vec<_> = store
            .list_issues(cycle_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.status == IssueStatus::Open)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, IssueSeverity::Minor);
    }

    #[tokio::test]
    async fn message_window_keeps_most_recent() {
        let store = MemoryStore::new();
        let p = project();
        for i in 0..5 {
            store
                .append_message(OrchestratorMessage::new(
                    p.id,
                    crate::model::MessageRole::User,
                    serde_json::json!(format!("m{}", i)),
                ))
                .await
                .unwrap();
        }
        let window = store.list_messages(p.id, 3).await.unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].content, serde_json::json!("m2"));
    }
}
