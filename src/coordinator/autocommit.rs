//! Auto-commit sweep.
//!
//! Every active worktree is checkpointed periodically so agent work is
//! never lost. Worktrees with unresolved merges or a human attached are
//! skipped; a checkpoint that touches `TASK.md` raises a ready-for-review
//! notification.

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::git::GitWorkspace;
use crate::model::{WorktreeStatus, auto_commit_message};
use crate::repo::Store;

/// Result of sweeping one worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Skipped,
    Clean,
    Committed {
        commit: String,
        touched_task_spec: bool,
    },
}

/// Checkpoint one worktree. `paused` reflects human takeover for the
/// worktree's session.
pub async fn sweep_worktree(
    git: &GitWorkspace,
    worktree_path: &std::path::Path,
    paused: bool,
) -> Result<SweepOutcome> {
    if paused {
        return Ok(SweepOutcome::Skipped);
    }
    let conflicted = git
        .has_conflicts(worktree_path)
        .await
        .map_err(|e| crate::error::AgentermError::git(e.to_string()))?;
    if conflicted {
        debug!(worktree = %worktree_path.display(), "skipping auto-commit: unresolved merge");
        return Ok(SweepOutcome::Skipped);
    }

    let message = auto_commit_message(Utc::now());
    let committed = git
        .commit_all(worktree_path, &message)
        .await
        .map_err(|e| crate::error::AgentermError::git(e.to_string()))?;

    match committed {
        None => Ok(SweepOutcome::Clean),
        Some(commit) => {
            let files = git
                .head_files(worktree_path)
                .await
                .map_err(|e| crate::error::AgentermError::git(e.to_string()))?;
            let touched_task_spec = files.iter().any(|f| f == "TASK.md");
            info!(worktree = %worktree_path.display(), %commit, "auto-commit checkpoint");
            Ok(SweepOutcome::Committed {
                commit,
                touched_task_spec,
            })
        }
    }
}

/// Sweep all active worktrees of a project. Returns worktree ids whose
/// checkpoint touched `TASK.md` (ready-for-review candidates).
pub async fn sweep_project<P>(
    store: &dyn Store,
    git: &GitWorkspace,
    project_id: Uuid,
    is_paused: P,
) -> Vec<Uuid>
where
    P: Fn(Option<Uuid>) -> bool,
{
    let worktrees = match store
        .list_worktrees(project_id, Some(WorktreeStatus::Active))
        .await
    {
        Ok(list) => list,
        Err(e) => {
            warn!(project = %project_id, "auto-commit listing failed: {}", e);
            return Vec::new();
        }
    };

    let mut ready = Vec::new();
    for worktree in worktrees {
        let paused = is_paused(worktree.task_id);
        match sweep_worktree(git, &worktree.path, paused).await {
            Ok(SweepOutcome::Committed {
                touched_task_spec: true,
                ..
            }) => ready.push(worktree.id),
            Ok(_) => {}
            Err(e) => {
                warn!(worktree = %worktree.path.display(), "auto-commit failed: {}", e)
            }
        }
    }
    ready
}
