//! Automation tests against real git repositories.

use std::path::{Path, PathBuf};
use std::process::Command;

use uuid::Uuid;

use agenterm::coordinator::autocommit::{SweepOutcome, sweep_worktree};
use agenterm::coordinator::merge::{MergeReport, merge_task};
use agenterm::git::{GitWorkspace, MergeOutcome};
use agenterm::model::{
    OrchestratorProfile, Project, ReviewCycle, ReviewStatus, Task, TaskStatus, Worktree,
    WorktreeStatus,
};
use agenterm::repo::memory::MemoryStore;
use agenterm::repo::{ProjectRepo, ReviewRepo, TaskRepo, WorktreeRepo};

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Initialize a repository with an identity so commits work anywhere.
fn init_repo(dir: &Path) {
    git(dir, &["init"]);
    git(dir, &["config", "user.email", "agents@example.com"]);
    git(dir, &["config", "user.name", "Agent Fleet"]);
    std::fs::write(dir.join("shared.txt"), "base\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "initial"]);
}

fn worktree_git_identity(dir: &Path) {
    git(dir, &["config", "user.email", "agents@example.com"]);
    git(dir, &["config", "user.name", "Agent Fleet"]);
}

async fn repo_with_worktree() -> (tempfile::TempDir, GitWorkspace, PathBuf, String) {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let ws = GitWorkspace::new(tmp.path().to_path_buf());
    let branch = "task/demo".to_string();
    let path = ws.create_worktree("demo", &branch).await.unwrap();
    worktree_git_identity(&path);
    (tmp, ws, path, branch)
}

#[tokio::test]
async fn auto_commit_checkpoints_then_is_idempotent() {
    let (_tmp, ws, wt, _branch) = repo_with_worktree().await;

    std::fs::write(wt.join("work.rs"), "fn main() {}\n").unwrap();
    let first = sweep_worktree(&ws, &wt, false).await.unwrap();
    match first {
        SweepOutcome::Committed {
            touched_task_spec, ..
        } => assert!(!touched_task_spec),
        other => panic!("expected a checkpoint, got {:?}", other),
    }
    let message = ws.head_message(&wt).await.unwrap();
    assert!(message.starts_with("[auto] checkpoint "));

    // Running again with no intervening change produces no new commit.
    let head_before = ws.head_commit(&wt).await.unwrap();
    let second = sweep_worktree(&ws, &wt, false).await.unwrap();
    assert_eq!(second, SweepOutcome::Clean);
    assert_eq!(ws.head_commit(&wt).await.unwrap(), head_before);
}

#[tokio::test]
async fn auto_commit_flags_task_spec_touch_and_respects_pause() {
    let (_tmp, ws, wt, _branch) = repo_with_worktree().await;

    std::fs::write(wt.join("TASK.md"), "# Task\nbuild the thing\n").unwrap();
    // Paused worktrees are skipped entirely.
    assert_eq!(
        sweep_worktree(&ws, &wt, true).await.unwrap(),
        SweepOutcome::Skipped
    );

    match sweep_worktree(&ws, &wt, false).await.unwrap() {
        SweepOutcome::Committed {
            touched_task_spec, ..
        } => assert!(touched_task_spec),
        other => panic!("expected a checkpoint, got {:?}", other),
    }
}

#[tokio::test]
async fn ready_commit_detection_uses_the_token() {
    let (_tmp, ws, wt, _branch) = repo_with_worktree().await;
    assert!(ws.latest_ready_commit(&wt).await.unwrap().is_none());

    std::fs::write(wt.join("feature.rs"), "pub fn f() {}\n").unwrap();
    git(&wt, &["add", "."]);
    git(&wt, &["commit", "-m", "feature done [READY_FOR_REVIEW]"]);

    let found = ws.latest_ready_commit(&wt).await.unwrap();
    assert_eq!(found, Some(ws.head_commit(&wt).await.unwrap()));
}

async fn seed_store(
    store: &MemoryStore,
    repo: &Path,
    wt_path: &Path,
    branch: &str,
    cycle_status: ReviewStatus,
) -> (Project, Task, Worktree) {
    let project = Project {
        id: Uuid::new_v4(),
        name: "demo".to_string(),
        repo_path: repo.to_path_buf(),
        playbook_id: None,
        profile: OrchestratorProfile::default(),
        created_at: chrono::Utc::now(),
    };
    store.create_project(project.clone()).await.unwrap();

    let mut task = Task::new(project.id, "demo task", "do the work");
    let worktree = Worktree {
        id: Uuid::new_v4(),
        project_id: project.id,
        branch_name: branch.to_string(),
        path: wt_path.to_path_buf(),
        task_id: Some(task.id),
        status: WorktreeStatus::Active,
        created_at: chrono::Utc::now(),
    };
    store.create_worktree(worktree.clone()).await.unwrap();
    task.worktree_id = Some(worktree.id);
    task.status = TaskStatus::Completed;
    store.create_task(task.clone()).await.unwrap();

    let now = chrono::Utc::now();
    store
        .create_cycle(ReviewCycle {
            id: Uuid::new_v4(),
            task_id: task.id,
            iteration: 1,
            status: cycle_status,
            commit_hash: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    (project, task, worktree)
}

#[tokio::test]
async fn merge_happy_path_updates_worktree_and_task() {
    let (tmp, ws, wt, branch) = repo_with_worktree().await;
    std::fs::write(wt.join("feature.rs"), "pub fn f() {}\n").unwrap();
    git(&wt, &["add", "."]);
    git(&wt, &["commit", "-m", "feature [READY_FOR_REVIEW]"]);

    let store = MemoryStore::new();
    let (_project, task, worktree) = seed_store(
        &store,
        tmp.path(),
        &wt,
        &branch,
        ReviewStatus::ReviewPassed,
    )
    .await;

    match merge_task(&store, &ws, task.id).await.unwrap() {
        MergeReport::Merged { branch: merged, .. } => assert_eq!(merged, branch),
        other => panic!("expected merge, got {:?}", other),
    }

    assert_eq!(
        store.get_worktree(worktree.id).await.unwrap().status,
        WorktreeStatus::Merged
    );
    let task = store.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.worktree_id, None);
    // The merged file is on the default branch now.
    assert!(tmp.path().join("feature.rs").exists());
}

#[tokio::test]
async fn merge_requires_a_passed_cycle() {
    let (tmp, ws, wt, branch) = repo_with_worktree().await;
    let store = MemoryStore::new();
    let (_project, task, worktree) = seed_store(
        &store,
        tmp.path(),
        &wt,
        &branch,
        ReviewStatus::ReviewRunning,
    )
    .await;

    match merge_task(&store, &ws, task.id).await.unwrap() {
        MergeReport::NotReady { reason, .. } => {
            assert!(reason.contains("not passed"), "reason: {}", reason)
        }
        other => panic!("expected not-ready, got {:?}", other),
    }
    assert_eq!(
        store.get_worktree(worktree.id).await.unwrap().status,
        WorktreeStatus::Active
    );
}

#[tokio::test]
async fn merge_conflict_aborts_and_reverts_the_task() {
    let (tmp, ws, wt, branch) = repo_with_worktree().await;

    // Conflicting edits to shared.txt on both sides.
    std::fs::write(wt.join("shared.txt"), "from the worktree\n").unwrap();
    git(&wt, &["add", "."]);
    git(&wt, &["commit", "-m", "worktree change [READY_FOR_REVIEW]"]);
    std::fs::write(tmp.path().join("shared.txt"), "from main\n").unwrap();
    git(tmp.path(), &["add", "."]);
    git(tmp.path(), &["commit", "-m", "main change"]);

    let store = MemoryStore::new();
    let (_project, task, worktree) = seed_store(
        &store,
        tmp.path(),
        &wt,
        &branch,
        ReviewStatus::ReviewPassed,
    )
    .await;

    match merge_task(&store, &ws, task.id).await.unwrap() {
        MergeReport::Conflict { .. } => {}
        other => panic!("expected conflict, got {:?}", other),
    }

    // Abort ran: no merge in progress on the default branch.
    assert!(!tmp.path().join(".git/MERGE_HEAD").exists());
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("shared.txt")).unwrap(),
        "from main\n"
    );
    // Task reverted to pending; worktree untouched.
    assert_eq!(
        store.get_task(task.id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(
        store.get_worktree(worktree.id).await.unwrap().status,
        WorktreeStatus::Active
    );
}

#[tokio::test]
async fn direct_merge_outcome_reports_conflict_detail() {
    let (tmp, ws, wt, branch) = repo_with_worktree().await;
    std::fs::write(wt.join("shared.txt"), "branch side\n").unwrap();
    git(&wt, &["add", "."]);
    git(&wt, &["commit", "-m", "branch"]);
    std::fs::write(tmp.path().join("shared.txt"), "main side\n").unwrap();
    git(tmp.path(), &["add", "."]);
    git(tmp.path(), &["commit", "-m", "main"]);

    match ws.merge_no_ff(&branch).await.unwrap() {
        MergeOutcome::Conflict(detail) => assert!(detail.to_lowercase().contains("conflict")),
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn worktrees_are_confined_to_the_repo() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let ws = GitWorkspace::new(tmp.path().to_path_buf());
    assert!(ws.worktree_path("ok-slug").is_ok());
    assert!(ws.worktree_path("../../evil").is_err());
}
