//! Merge controller.
//!
//! Tasks whose review cycle passed get their worktree branch merged back
//! to the project default branch with `--no-ff`. Conflicts abort the
//! merge, demote the task to pending, and are reported to the coder
//! exactly once; there is no automatic retry.

use uuid::Uuid;

use crate::error::{AgentermError, Result};
use crate::git::{GitWorkspace, MergeOutcome};
use crate::model::{ReviewStatus, TaskStatus, WorktreeStatus};
use crate::repo::Store;

/// Outcome of one merge attempt, as relayed to tools and events.
#[derive(Debug, Clone)]
pub enum MergeReport {
    Merged { task_id: Uuid, branch: String },
    Conflict { task_id: Uuid, detail: String },
    NotReady { task_id: Uuid, reason: String },
}

/// Attempt to merge a task's worktree branch.
///
/// Requires the latest review cycle to have passed. On success the
/// worktree is marked merged and unlinked from its tasks; on conflict the
/// merge is aborted, the task reverts to `pending`, and the worktree is
/// left untouched for the coder to fix.
pub async fn merge_task(
    store: &dyn Store,
    git: &GitWorkspace,
    task_id: Uuid,
) -> Result<MergeReport> {
    let mut task = store.get_task(task_id).await?;
    let Some(worktree_id) = task.worktree_id else {
        return Ok(MergeReport::NotReady {
            task_id,
            reason: "task has no worktree".to_string(),
        });
    };
    let worktree = store.get_worktree(worktree_id).await?;
    if worktree.status != WorktreeStatus::Active {
        return Ok(MergeReport::NotReady {
            task_id,
            reason: format!("worktree is {:?}", worktree.status),
        });
    }

    let cycle = store.latest_cycle(task_id).await?;
    let passed = cycle
        .as_ref()
        .map(|c| c.status == ReviewStatus::ReviewPassed)
        .unwrap_or(false);
    if !passed {
        return Ok(MergeReport::NotReady {
            task_id,
            reason: "latest review cycle has not passed".to_string(),
        });
    }

    let outcome = git
        .merge_no_ff(&worktree.branch_name)
        .await
        .map_err(|e| AgentermError::git(e.to_string()))?;

    match outcome {
        MergeOutcome::Merged => {
            store
                .update_worktree_status(worktree_id, WorktreeStatus::Merged)
                .await?;
            store.clear_worktree(worktree_id).await?;
            task.worktree_id = None;
            task.status = TaskStatus::Completed;
            store.update_task(task).await?;
            Ok(MergeReport::Merged {
                task_id,
                branch: worktree.branch_name,
            })
        }
        MergeOutcome::Conflict(detail) => {
            // The branch stays as it was; the task goes back to pending so
            // the controller does not pick it up again.
            task.status = TaskStatus::Pending;
            store.update_task(task).await?;
            Ok(MergeReport::Conflict { task_id, detail })
        }
    }
}
