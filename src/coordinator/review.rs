//! Review loop coordination.
//!
//! Watches coder worktrees for ready-for-review commits, dispatches review
//! prompts to reviewer sessions, parses verdicts, and drives the review
//! cycle state machine. Approval requires a dedicated verdict line; the
//! word `approved` inside prose is never sufficient.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AgentermError, Result};
use crate::git::GitWorkspace;
use crate::model::{
    IssueSeverity, IssueStatus, Project, ReviewCycle, ReviewIssue, ReviewStatus, Task, TaskStatus,
    Worktree, WorktreeStatus,
};
use crate::repo::Store;
use agent_session::queue::CommandOp;
use agent_session::{EventBus, SessionManager};

static VERDICT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*VERDICT:\s*(\S[^\n]*?)\s*$").unwrap());
static APPROVED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(APPROVED|LGTM)$").unwrap());
static ISSUE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^\s*[-*]?\s*\[?(critical|major|minor|suggestion)\]?[:\s]\s*(.+)$").unwrap()
});

/// Where dispatched diffs land inside the worktree.
const REVIEW_DIR: &str = ".orchestra/review";

/// A parsed reviewer verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    /// Everything after (and including) the verdict line, for relay.
    ChangesRequested(String),
}

/// Extract the verdict from reviewer output. Only a full
/// `VERDICT: <token>` line counts; `not approved yet` in prose matches
/// nothing.
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    let caps = VERDICT_LINE.captures(text)?;
    let token = caps.get(1)?.as_str().trim();
    if APPROVED.is_match(token) {
        Some(Verdict::Approved)
    } else {
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        Some(Verdict::ChangesRequested(text[start..].to_string()))
    }
}

/// Pull structured findings out of reviewer prose.
pub fn parse_issues(text: &str) -> Vec<(IssueSeverity, String)> {
    ISSUE_LINE
        .captures_iter(text)
        .filter_map(|caps| {
            let severity = match caps.get(1)?.as_str().to_lowercase().as_str() {
                "critical" => IssueSeverity::Critical,
                "major" => IssueSeverity::Major,
                "minor" => IssueSeverity::Minor,
                _ => IssueSeverity::Suggestion,
            };
            Some((severity, caps.get(2)?.as_str().trim().to_string()))
        })
        .collect()
}

/// One in-flight review dispatch.
#[derive(Debug, Clone)]
struct PendingReview {
    cycle_id: Uuid,
    reviewer_session_id: String,
    coder_session_id: Option<String>,
    /// Captured before the prompt was sent; only output at or after this
    /// instant is considered.
    since: DateTime<Utc>,
    commit: String,
}

#[derive(Debug, Clone, Default)]
struct Lane {
    pending: Option<PendingReview>,
    last_reviewed_commit: Option<String>,
    escalated: bool,
}

/// Review settings, sourced from configuration.
#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub max_iterations: u32,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self { max_iterations: 20 }
    }
}

/// Per-project review loop driver.
pub struct ReviewCoordinator {
    store: Arc<dyn Store>,
    sessions: Arc<SessionManager>,
    bus: Arc<EventBus>,
    settings: ReviewSettings,
    lanes: DashMap<Uuid, Lane>,
    /// Worktrees flagged by the auto-commit sweep (TASK.md touched).
    flagged: DashSet<Uuid>,
}

impl ReviewCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionManager>,
        bus: Arc<EventBus>,
        settings: ReviewSettings,
    ) -> Self {
        Self {
            store,
            sessions,
            bus,
            settings,
            lanes: DashMap::new(),
            flagged: DashSet::new(),
        }
    }

    /// Ready-for-review notification from the auto-commit sweep.
    pub fn notify_ready(&self, worktree_id: Uuid) {
        self.flagged.insert(worktree_id);
    }

    /// Any session on this task under human takeover pauses the lane.
    fn task_paused(&self, task_id: Uuid) -> bool {
        let id = task_id.to_string();
        self.sessions
            .list()
            .iter()
            .any(|s| s.task_id.as_deref() == Some(id.as_str()) && s.human_attached)
    }

    fn session_for_role(&self, task_id: Uuid, role: &str) -> Option<String> {
        let id = task_id.to_string();
        self.sessions
            .list()
            .into_iter()
            .find(|s| {
                s.task_id.as_deref() == Some(id.as_str())
                    && s.role == role
                    && !s.state.is_terminal()
            })
            .map(|s| s.id)
    }

    /// One coordination pass over a project's active worktrees.
    pub async fn tick(&self, project: &Project) -> Result<()> {
        let git = GitWorkspace::new(project.repo_path.clone());
        let worktrees = self
            .store
            .list_worktrees(project.id, Some(WorktreeStatus::Active))
            .await?;

        for worktree in worktrees {
            let Some(task_id) = worktree.task_id else {
                continue;
            };
            if self.task_paused(task_id) {
                continue;
            }
            let lane_escalated = self
                .lanes
                .get(&task_id)
                .map(|l| l.escalated)
                .unwrap_or(false);
            if lane_escalated {
                continue;
            }

            let has_pending = self
                .lanes
                .get(&task_id)
                .map(|l| l.pending.is_some())
                .unwrap_or(false);
            if has_pending {
                if let Err(e) = self.poll_verdict(project, &git, task_id).await {
                    warn!(task = %task_id, "verdict poll failed: {}", e);
                }
                continue;
            }

            self.flagged.remove(&worktree.id);
            match self.detect_ready(&git, &worktree).await {
                Ok(Some(commit)) => {
                    if let Err(e) = self
                        .dispatch_review(project, &git, task_id, &worktree, commit)
                        .await
                    {
                        warn!(task = %task_id, "review dispatch failed: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(worktree = %worktree.path.display(), "ready check failed: {}", e),
            }
        }
        Ok(())
    }

    /// A commit is ready when it carries the token and has not been
    /// reviewed yet.
    async fn detect_ready(&self, git: &GitWorkspace, worktree: &Worktree) -> Result<Option<String>> {
        let Some(task_id) = worktree.task_id else {
            return Ok(None);
        };
        let commit = git
            .latest_ready_commit(&worktree.path)
            .await
            .map_err(|e| AgentermError::git(e.to_string()))?;
        let Some(commit) = commit else {
            return Ok(None);
        };
        let already = self
            .lanes
            .get(&task_id)
            .and_then(|l| l.last_reviewed_commit.clone());
        if already.as_deref() == Some(commit.as_str()) {
            return Ok(None);
        }
        Ok(Some(commit))
    }

    async fn dispatch_review(
        &self,
        project: &Project,
        git: &GitWorkspace,
        task_id: Uuid,
        worktree: &Worktree,
        commit: String,
    ) -> Result<()> {
        let Some(reviewer) = self.session_for_role(task_id, "reviewer") else {
            warn!(task = %task_id, "ready for review but no reviewer session");
            return Ok(());
        };
        let coder = self.session_for_role(task_id, "coder");

        let cycle = self.ensure_running_cycle(task_id, &commit).await?;

        // Drop the diff into the worktree so the prompt only references
        // paths inside the reviewer's working directory.
        let diff = git
            .diff_last_commit(&worktree.path)
            .await
            .map_err(|e| AgentermError::git(e.to_string()))?;
        let diff_rel = format!("{}/iteration-{}.diff", REVIEW_DIR, cycle.iteration);
        let diff_path = worktree.path.join(&diff_rel);
        if let Some(parent) = diff_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&diff_path, &diff).await?;

        let task = self.store.get_task(task_id).await?;
        let prompt = review_prompt(&task, &diff_rel);

        // Capture the watermark before the send; only newer reviewer
        // output counts toward the verdict.
        let since = Utc::now();
        self.sessions
            .enqueue_command(&reviewer, CommandOp::SendText, json!({"text": prompt}))
            .await
            .map_err(|e| AgentermError::terminal(&reviewer, e.to_string()))?;

        info!(task = %task_id, cycle = %cycle.id, iteration = cycle.iteration, "review dispatched");
        {
            let mut lane = self.lanes.entry(task_id).or_default();
            lane.pending = Some(PendingReview {
                cycle_id: cycle.id,
                reviewer_session_id: reviewer,
                coder_session_id: coder,
                since,
                commit,
            });
        }

        let _ = self
            .store
            .transition_cycle(cycle.id, ReviewStatus::ReviewRunning)
            .await?;
        self.publish_project_event(
            project,
            "project_phase_changed",
            json!({"task_id": task_id, "phase": "review_running", "iteration": cycle.iteration}),
        );
        Ok(())
    }

    /// Find or create the cycle for this pass and stamp the commit.
    async fn ensure_running_cycle(&self, task_id: Uuid, commit: &str) -> Result<ReviewCycle> {
        let existing = self.store.latest_cycle(task_id).await?;
        let cycle = match existing {
            Some(c) if c.status != ReviewStatus::ReviewPassed => c,
            _ => {
                let now = Utc::now();
                let fresh = ReviewCycle {
                    id: Uuid::new_v4(),
                    task_id,
                    iteration: 1,
                    status: ReviewStatus::ReviewPending,
                    commit_hash: None,
                    created_at: now,
                    updated_at: now,
                };
                self.store.create_cycle(fresh.clone()).await?;
                fresh
            }
        };
        self.store.set_commit_hash(cycle.id, commit).await?;
        Ok(cycle)
    }

    async fn poll_verdict(
        &self,
        project: &Project,
        _git: &GitWorkspace,
        task_id: Uuid,
    ) -> Result<()> {
        let pending = match self.lanes.get(&task_id).and_then(|l| l.pending.clone()) {
            Some(p) => p,
            None => return Ok(()),
        };
        let Some(reviewer) = self.sessions.get(&pending.reviewer_session_id) else {
            // Reviewer died; drop the dispatch so the next ready commit
            // starts a fresh pass.
            self.clear_pending(task_id, None);
            return Ok(());
        };

        let output: String = reviewer
            .parsed_since(pending.since - chrono::Duration::milliseconds(1))
            .iter()
            .filter(|l| l.timestamp >= pending.since)
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let Some(verdict) = parse_verdict(&output) else {
            return Ok(());
        };

        match verdict {
            Verdict::Approved => self.on_approved(project, task_id, &pending).await,
            Verdict::ChangesRequested(issues) => {
                self.on_changes_requested(project, task_id, &pending, &issues)
                    .await
            }
        }
    }

    async fn on_approved(
        &self,
        project: &Project,
        task_id: Uuid,
        pending: &PendingReview,
    ) -> Result<()> {
        let changed = self
            .store
            .transition_cycle(pending.cycle_id, ReviewStatus::ReviewPassed)
            .await?;
        self.store.resolve_blocking_issues(pending.cycle_id).await?;

        let mut task = self.store.get_task(task_id).await?;
        task.status = TaskStatus::Completed;
        self.store.update_task(task).await?;

        self.clear_pending(task_id, Some(pending.commit.clone()));
        info!(task = %task_id, cycle = %pending.cycle_id, "review approved");
        if changed {
            self.publish_project_event(
                project,
                "review_loop_passed",
                json!({"task_id": task_id, "cycle_id": pending.cycle_id}),
            );
        }
        Ok(())
    }

    async fn on_changes_requested(
        &self,
        project: &Project,
        task_id: Uuid,
        pending: &PendingReview,
        issues_text: &str,
    ) -> Result<()> {
        let changed = self
            .store
            .transition_cycle(pending.cycle_id, ReviewStatus::ReviewChangesRequested)
            .await?;

        for (severity, summary) in parse_issues(issues_text) {
            self.store
                .create_issue(ReviewIssue {
                    id: Uuid::new_v4(),
                    cycle_id: pending.cycle_id,
                    severity,
                    summary,
                    status: IssueStatus::Open,
                    created_at: Utc::now(),
                })
                .await?;
        }

        let iteration = self.store.bump_iteration(pending.cycle_id).await?;
        let mut task = self.store.get_task(task_id).await?;
        task.status = TaskStatus::ReviewChangesRequested;
        self.store.update_task(task).await?;

        if iteration > self.settings.max_iterations {
            // The loop is not converging; stop and hand it to a human.
            if let Some(mut lane) = self.lanes.get_mut(&task_id) {
                lane.pending = None;
                lane.escalated = true;
            }
            warn!(task = %task_id, iteration, "review loop escalated");
            self.publish_project_event(
                project,
                "escalation_required",
                json!({"task_id": task_id, "iterations": iteration}),
            );
            if project.profile.notify_on_blocked {
                self.publish_project_event(
                    project,
                    "project_blocked",
                    json!({"task_id": task_id, "reason": "review_escalation"}),
                );
            }
            return Ok(());
        }

        // Relay the findings back to the coder.
        if let Some(coder) = &pending.coder_session_id {
            let relay = format!(
                "Review iteration {} requested changes. Address the findings below, \
                 commit with {} when done.\n\n{}\n",
                iteration,
                crate::model::READY_FOR_REVIEW_TOKEN,
                issues_text.trim()
            );
            if let Err(e) = self
                .sessions
                .enqueue_command(coder, CommandOp::SendText, json!({"text": relay}))
                .await
            {
                warn!(task = %task_id, "issue relay failed: {}", e);
            }
        }

        self.clear_pending(task_id, Some(pending.commit.clone()));
        if changed {
            self.publish_project_event(
                project,
                "review_iteration_completed",
                json!({"task_id": task_id, "iteration": iteration}),
            );
        }
        Ok(())
    }

    fn clear_pending(&self, task_id: Uuid, reviewed_commit: Option<String>) {
        let mut lane = self.lanes.entry(task_id).or_default();
        lane.pending = None;
        if let Some(commit) = reviewed_commit {
            lane.last_reviewed_commit = Some(commit);
        }
    }

    fn publish_project_event(&self, project: &Project, event: &str, data: serde_json::Value) {
        self.bus
            .publish_project_event(&project.id.to_string(), event, data);
    }
}

/// The prompt dispatched to the reviewer session.
fn review_prompt(task: &Task, diff_rel: &str) -> String {
    format!(
        "Please review the latest changes for task \"{}\".\n\
         The diff is saved at {} and the task spec at TASK.md.\n\
         Check correctness, tests, and scope. When finished, output exactly one line:\n\
         VERDICT: APPROVED\n\
         or\n\
         VERDICT: CHANGES_REQUESTED\n\
         followed by findings, one per line, as severity: description \
         (severity one of critical, major, minor, suggestion).\n",
        task.title, diff_rel
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_requires_a_dedicated_line() {
        assert_eq!(parse_verdict("VERDICT: APPROVED"), Some(Verdict::Approved));
        assert_eq!(
            parse_verdict("looks good\n  VERDICT: LGTM  \n"),
            Some(Verdict::Approved)
        );
        // Prose containing `approved` is not a verdict.
        assert_eq!(parse_verdict("this is not approved yet"), None);
        assert_eq!(parse_verdict("I would say approved overall"), None);
        // Negated verdicts are changes, not approvals.
        match parse_verdict("VERDICT: NOT APPROVED\n- major: broken test") {
            Some(Verdict::ChangesRequested(text)) => {
                assert!(text.contains("broken test"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn changes_requested_keeps_findings() {
        let output = "preamble\nVERDICT: CHANGES_REQUESTED\n- critical: auth bypass\n- minor: typo\n";
        match parse_verdict(output) {
            Some(Verdict::ChangesRequested(text)) => {
                let issues = parse_issues(&text);
                assert_eq!(issues.len(), 2);
                assert_eq!(issues[0].0, IssueSeverity::Critical);
                assert_eq!(issues[0].1, "auth bypass");
                assert_eq!(issues[1].0, IssueSeverity::Minor);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn issue_lines_parse_varied_shapes() {
        let text = "CRITICAL: hardcoded secret\n* [major] missing error handling\nnothing here\n";
        let issues = parse_issues(text);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].0, IssueSeverity::Critical);
        assert_eq!(issues[1].0, IssueSeverity::Major);
    }
}
