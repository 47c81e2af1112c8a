//! # Agenterm
//!
//! A self-hosted control plane that orchestrates a fleet of interactive AI
//! coding agents across projects. Users chat with a per-project
//! orchestrator (an LLM tool loop) which plans tasks, spawns agent
//! terminal sessions inside isolated git worktrees, monitors their output,
//! routes diffs between coder and reviewer sessions, and merges approved
//! work back to the main branch.
//!
//! The crate is organized around six cooperating components, each
//! instantiated once at startup and passed explicitly:
//!
//! - Terminal sessions and their runtime live in the [`agent_session`]
//!   crate (backend, parser, command queue, event bus, manager).
//! - [`orchestrator`]: the bounded LLM tool loop with approval gating.
//! - [`scheduler`]: admission against global/project/phase/role/agent
//!   concurrency caps.
//! - [`coordinator`]: auto-commit, coder/reviewer review loops, and the
//!   merge controller.
//! - [`repo`]: the repository contracts storage must satisfy.
//! - [`git`]: shell-git worktree and merge plumbing.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod git;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod providers;
pub mod registry;
pub mod repo;
pub mod scheduler;

pub use config::AgentermConfig;
pub use error::{AgentermError, Result};
