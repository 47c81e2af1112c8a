//! Shell-git operations: worktrees, checkpoints, review markers, merges.
//!
//! Worktrees live under `<repo>/.worktrees/<slug>` and are never created
//! outside the repository root.

use anyhow::{Context, Result, bail};
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use crate::model::READY_FOR_REVIEW_TOKEN;

/// Directory under the repository root that holds task worktrees.
pub const WORKTREES_DIR: &str = ".worktrees";

/// Outcome of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge hit conflicts and was aborted.
    Conflict(String),
}

/// Git worktree and branch management for one repository.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    repo_path: PathBuf,
}

impl GitWorkspace {
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Check if git is available on the system.
    pub fn is_git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn git(&self, args: &[&str], dir: &Path) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .with_context(|| format!("failed to execute git {}", args.join(" ")))
    }

    async fn git_ok(&self, args: &[&str], dir: &Path) -> Result<String> {
        let output = self.git(args, dir).await?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Initialize the repository with an initial commit if needed.
    pub async fn init_if_needed(&self) -> Result<()> {
        if self.repo_path.join(".git").exists() {
            return Ok(());
        }
        info!("initializing git repository at {}", self.repo_path.display());
        tokio::fs::create_dir_all(&self.repo_path).await?;
        self.git_ok(&["init"], &self.repo_path).await?;
        tokio::fs::write(
            self.repo_path.join("README.md"),
            "# Project\n\nManaged by agenterm.\n",
        )
        .await?;
        self.git_ok(&["add", "."], &self.repo_path).await?;
        let commit = self
            .git(&["commit", "-m", "Initial commit"], &self.repo_path)
            .await?;
        if !commit.status.success() {
            warn!("initial commit failed, continuing");
        }
        Ok(())
    }

    /// The worktree path for a slug, validated to stay inside the repo.
    pub fn worktree_path(&self, slug: &str) -> Result<PathBuf> {
        let path = self.repo_path.join(WORKTREES_DIR).join(slug);
        if !lexically_contained(&self.repo_path, &path) {
            bail!("worktree path escapes the repository: {}", slug);
        }
        Ok(path)
    }

    /// Create a worktree on a new branch under `.worktrees/<slug>`.
    pub async fn create_worktree(&self, slug: &str, branch: &str) -> Result<PathBuf> {
        let path = self.worktree_path(slug)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path_str = path
            .to_str()
            .with_context(|| format!("invalid UTF-8 in worktree path: {:?}", path))?;
        let mut args = vec!["worktree", "add"];
        let branch_exists = self.branch_exists(branch).await?;
        if !branch_exists {
            args.extend(["-b", branch]);
        }
        args.push(path_str);
        if branch_exists {
            args.push(branch);
        }
        self.git_ok(&args, &self.repo_path).await?;

        info!("created worktree {} on branch {}", path.display(), branch);
        Ok(path)
    }

    /// Remove a worktree, discarding its checkout.
    pub async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .with_context(|| format!("invalid UTF-8 in worktree path: {:?}", path))?;
        self.git_ok(&["worktree", "remove", "--force", path_str], &self.repo_path)
            .await?;
        info!("removed worktree {}", path.display());
        Ok(())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self
            .git(&["branch", "--list", branch], &self.repo_path)
            .await?;
        Ok(output.status.success() && !output.stdout.is_empty())
    }

    /// The checked-out branch at the repository root.
    pub async fn default_branch(&self) -> Result<String> {
        let out = self
            .git_ok(&["symbolic-ref", "--short", "HEAD"], &self.repo_path)
            .await?;
        Ok(out.trim().to_string())
    }

    /// `git status --porcelain` for a worktree.
    pub async fn status_porcelain(&self, worktree: &Path) -> Result<String> {
        self.git_ok(&["status", "--porcelain"], worktree).await
    }

    pub async fn has_changes(&self, worktree: &Path) -> Result<bool> {
        Ok(!self.status_porcelain(worktree).await?.trim().is_empty())
    }

    /// Unresolved merge entries (`UU`, `AA`, `DD`) in the porcelain output.
    pub async fn has_conflicts(&self, worktree: &Path) -> Result<bool> {
        let status = self.status_porcelain(worktree).await?;
        Ok(status
            .lines()
            .any(|l| l.starts_with("UU") || l.starts_with("AA") || l.starts_with("DD")))
    }

    /// Stage everything and commit. Returns the new commit hash, or `None`
    /// when nothing ended up staged.
    pub async fn commit_all(&self, worktree: &Path, message: &str) -> Result<Option<String>> {
        if !self.has_changes(worktree).await? {
            return Ok(None);
        }
        self.git_ok(&["add", "-A"], worktree).await?;
        let commit = self.git(&["commit", "-m", message], worktree).await?;
        if !commit.status.success() {
            let stderr = String::from_utf8_lossy(&commit.stderr);
            let stdout = String::from_utf8_lossy(&commit.stdout);
            // Normalization can leave nothing staged; that is a no-op, not
            // an error.
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Ok(None);
            }
            bail!("git commit failed: {}{}", stdout, stderr);
        }
        let hash = self.head_commit(worktree).await?;
        Ok(Some(hash))
    }

    pub async fn head_commit(&self, worktree: &Path) -> Result<String> {
        let out = self.git_ok(&["rev-parse", "HEAD"], worktree).await?;
        Ok(out.trim().to_string())
    }

    /// Subject + body of the commit at HEAD.
    pub async fn head_message(&self, worktree: &Path) -> Result<String> {
        let out = self
            .git_ok(&["log", "-1", "--pretty=%B"], worktree)
            .await?;
        Ok(out.trim().to_string())
    }

    /// The most recent commit whose message carries the review token.
    pub async fn latest_ready_commit(&self, worktree: &Path) -> Result<Option<String>> {
        let out = self
            .git(
                &[
                    "log",
                    "-1",
                    "--fixed-strings",
                    "--grep",
                    READY_FOR_REVIEW_TOKEN,
                    "--pretty=%H",
                ],
                worktree,
            )
            .await?;
        if !out.status.success() {
            return Ok(None);
        }
        let hash = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok(if hash.is_empty() { None } else { Some(hash) })
    }

    /// Files touched by the commit at HEAD.
    pub async fn head_files(&self, worktree: &Path) -> Result<Vec<String>> {
        let out = self
            .git_ok(&["show", "--name-only", "--pretty=format:"], worktree)
            .await?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `git diff HEAD~1` for the review prompt. Falls back to the full
    /// diff against the empty tree for a root commit.
    pub async fn diff_last_commit(&self, worktree: &Path) -> Result<String> {
        let out = self.git(&["diff", "HEAD~1"], worktree).await?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        self.git_ok(&["show", "HEAD"], worktree).await
    }

    /// Merge `branch` into the checked-out default branch with `--no-ff`.
    /// On conflict the merge is aborted before returning.
    pub async fn merge_no_ff(&self, branch: &str) -> Result<MergeOutcome> {
        let merge = self
            .git(&["merge", "--no-ff", branch, "-m", &format!("Merge {}", branch)],
                &self.repo_path)
            .await?;
        if merge.status.success() {
            info!("merged branch {}", branch);
            return Ok(MergeOutcome::Merged);
        }

        let detail = format!(
            "{}{}",
            String::from_utf8_lossy(&merge.stdout),
            String::from_utf8_lossy(&merge.stderr)
        );
        let abort = self.git(&["merge", "--abort"], &self.repo_path).await?;
        if !abort.status.success() {
            warn!(
                "merge --abort failed: {}",
                String::from_utf8_lossy(&abort.stderr)
            );
        }
        Ok(MergeOutcome::Conflict(detail))
    }
}

/// Lexical containment check; does not touch the filesystem.
fn lexically_contained(root: &Path, candidate: &Path) -> bool {
    let mut normalized = PathBuf::new();
    for comp in candidate.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return false;
                }
            }
            other => normalized.push(other),
        }
    }
    normalized.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_paths_cannot_escape_the_repo() {
        let ws = GitWorkspace::new(PathBuf::from("/srv/repo"));
        assert!(ws.worktree_path("task-1").is_ok());
        assert!(ws.worktree_path("../outside").is_err());
        assert!(ws.worktree_path("a/../../../etc").is_err());
    }

    #[test]
    fn containment_is_lexical() {
        let root = Path::new("/srv/repo");
        assert!(lexically_contained(root, Path::new("/srv/repo/.worktrees/t1")));
        assert!(!lexically_contained(root, Path::new("/srv/other")));
        assert!(!lexically_contained(
            root,
            Path::new("/srv/repo/.worktrees/../../escape")
        ));
    }
}
