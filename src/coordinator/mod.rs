//! Automation coordination: auto-commit, review loops, merges.
//!
//! Three periodic loops cooperate over the same repositories the
//! orchestrator uses. All of them skip any worktree whose session is under
//! human takeover, and all are idempotent across restarts.

pub mod autocommit;
pub mod merge;
pub mod review;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::merge::{MergeReport, merge_task};
use crate::coordinator::review::{ReviewCoordinator, ReviewSettings};
use crate::git::GitWorkspace;
use crate::model::{READY_FOR_REVIEW_TOKEN, TaskStatus};
use crate::repo::Store;
use agent_session::queue::CommandOp;
use agent_session::{EventBus, ReadyProbe, SessionManager};

/// Loop cadences.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub auto_commit_interval: Duration,
    pub review_poll_interval: Duration,
    pub merge_poll_interval: Duration,
    pub review: ReviewSettings,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            auto_commit_interval: Duration::from_secs(30),
            review_poll_interval: Duration::from_secs(2),
            merge_poll_interval: Duration::from_secs(5),
            review: ReviewSettings::default(),
        }
    }
}

/// Synchronous probe for the session idle monitor: does the worktree have
/// a ready-for-review commit?
pub fn ready_commit_probe() -> ReadyProbe {
    Arc::new(|dir: &Path| {
        std::process::Command::new("git")
            .args([
                "log",
                "-1",
                "--fixed-strings",
                "--grep",
                READY_FOR_REVIEW_TOKEN,
                "--pretty=%H",
            ])
            .current_dir(dir)
            .output()
            .map(|o| o.status.success() && !o.stdout.is_empty())
            .unwrap_or(false)
    })
}

/// Owns the periodic automation loops.
pub struct AutomationCoordinator {
    store: Arc<dyn Store>,
    sessions: Arc<SessionManager>,
    bus: Arc<EventBus>,
    review: Arc<ReviewCoordinator>,
    settings: CoordinatorSettings,
}

impl AutomationCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionManager>,
        bus: Arc<EventBus>,
        settings: CoordinatorSettings,
    ) -> Arc<Self> {
        let review = Arc::new(ReviewCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            Arc::clone(&bus),
            settings.review.clone(),
        ));

        // Takeover visibility: the runtime announces pause/resume through
        // a function value rather than a back-reference.
        sessions.on_pause_change(Arc::new(|session_id: &str, paused: bool| {
            if paused {
                info!(session = %session_id, "automation paused for takeover");
            } else {
                info!(session = %session_id, "automation resumed after takeover");
            }
        }));

        Arc::new(Self {
            store,
            sessions,
            bus,
            review,
            settings,
        })
    }

    pub fn review_coordinator(&self) -> Arc<ReviewCoordinator> {
        Arc::clone(&self.review)
    }

    /// Any live session for the task has a human attached.
    fn task_paused(&self, task_id: Option<Uuid>) -> bool {
        let Some(task_id) = task_id else {
            return false;
        };
        let id = task_id.to_string();
        self.sessions
            .list()
            .iter()
            .any(|s| s.task_id.as_deref() == Some(id.as_str()) && s.human_attached)
    }

    /// Start the three loops; they stop when `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let this = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move { this.auto_commit_loop(token).await });

        let this = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move { this.review_loop(token).await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.merge_loop(cancel).await });
    }

    async fn auto_commit_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.auto_commit_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let projects = match self.store.list_projects().await {
                Ok(p) => p,
                Err(e) => {
                    warn!("auto-commit project listing failed: {}", e);
                    continue;
                }
            };
            for project in projects {
                let git = GitWorkspace::new(project.repo_path.clone());
                let flagged = autocommit::sweep_project(
                    self.store.as_ref(),
                    &git,
                    project.id,
                    |task_id| self.task_paused(task_id),
                )
                .await;
                for worktree_id in flagged {
                    self.review.notify_ready(worktree_id);
                }
            }
        }
    }

    async fn review_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.review_poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let projects = match self.store.list_projects().await {
                Ok(p) => p,
                Err(e) => {
                    warn!("review project listing failed: {}", e);
                    continue;
                }
            };
            for project in projects {
                if let Err(e) = self.review.tick(&project).await {
                    warn!(project = %project.id, "review tick failed: {}", e);
                }
            }
        }
    }

    async fn merge_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.merge_poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let projects = match self.store.list_projects().await {
                Ok(p) => p,
                Err(e) => {
                    warn!("merge project listing failed: {}", e);
                    continue;
                }
            };
            for project in projects {
                let git = GitWorkspace::new(project.repo_path.clone());
                let tasks = match self.store.list_tasks(project.id).await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(project = %project.id, "merge task listing failed: {}", e);
                        continue;
                    }
                };
                for task in tasks {
                    if task.status != TaskStatus::Completed || task.worktree_id.is_none() {
                        continue;
                    }
                    if self.task_paused(Some(task.id)) {
                        continue;
                    }
                    match merge_task(self.store.as_ref(), &git, task.id).await {
                        Ok(report) => self.handle_merge_report(&project.id, &task.id, report).await,
                        Err(e) => warn!(task = %task.id, "merge attempt failed: {}", e),
                    }
                }
            }
        }
    }

    async fn handle_merge_report(&self, project_id: &Uuid, task_id: &Uuid, report: MergeReport) {
        match report {
            MergeReport::Merged { branch, .. } => {
                info!(task = %task_id, %branch, "worktree merged");
                self.bus.publish_project_event(
                    &project_id.to_string(),
                    "project_phase_changed",
                    json!({"task_id": task_id, "phase": "merged", "branch": branch}),
                );
            }
            MergeReport::Conflict { detail, .. } => {
                warn!(task = %task_id, "merge conflict, task reverted to pending");
                // Exactly one chat-visible notification to the coder; the
                // task is already back in pending so no automatic retry
                // will repeat it.
                let coder = {
                    let id = task_id.to_string();
                    self.sessions
                        .list()
                        .into_iter()
                        .find(|s| {
                            s.task_id.as_deref() == Some(id.as_str())
                                && s.role == "coder"
                                && !s.state.is_terminal()
                        })
                        .map(|s| s.id)
                };
                if let Some(coder) = coder {
                    let note = format!(
                        "Merge conflict detected while merging your branch. Resolve the \
                         conflict against the default branch, then commit with {} again.\n",
                        READY_FOR_REVIEW_TOKEN
                    );
                    if let Err(e) = self
                        .sessions
                        .enqueue_command(&coder, CommandOp::SendText, json!({"text": note}))
                        .await
                    {
                        warn!(task = %task_id, "conflict notification failed: {}", e);
                    }
                }
                self.bus.publish_project_event(
                    &project_id.to_string(),
                    "project_blocked",
                    json!({"task_id": task_id, "reason": "merge_conflict", "detail": detail}),
                );
            }
            MergeReport::NotReady { reason, .. } => {
                warn!(task = %task_id, "merge skipped: {}", reason);
            }
        }
    }
}
