//! Orchestrator tool set.
//!
//! Tool names are stable. Whether a tool mutates is declared here, in one
//! closed table; the approval gate and audit trail both key off it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::coordinator::merge::{MergeReport, merge_task};
use crate::error::{AgentermError, Result};
use crate::git::GitWorkspace;
use crate::model::{
    Project, SessionFilter, SessionRow, Task, TaskStatus, Worktree, WorktreeStatus,
};
use crate::orchestrator::skills::SkillCatalog;
use crate::providers::ToolSchema;
use crate::registry::Registry;
use crate::repo::Store;
use crate::scheduler::{AdmissionRequest, Scheduler};
use agent_session::queue::CommandOp;
use agent_session::{SessionManager, SessionSpec};

/// Tools that mutate state. Closed set: a new tool must be added here
/// explicitly or it is treated as mutating nowhere and allowed nowhere.
pub const MUTATING_TOOLS: &[&str] = &[
    "create_project",
    "create_task",
    "write_task_spec",
    "create_worktree",
    "merge_worktree",
    "resolve_merge_conflict",
    "create_session",
    "send_command",
    "close_session",
];

/// Read-only tools, always admitted.
pub const READ_TOOLS: &[&str] = &[
    "list_projects",
    "get_project",
    "list_tasks",
    "read_session_output",
    "generate_progress_report",
    "get_session_ready",
    "list_skills",
    "get_skill_details",
];

pub fn is_mutating(name: &str) -> bool {
    MUTATING_TOOLS.contains(&name)
}

pub fn is_known_tool(name: &str) -> bool {
    is_mutating(name) || READ_TOOLS.contains(&name)
}

/// Shared handles the tools execute against.
#[derive(Clone)]
pub struct ToolContext {
    pub project: Project,
    pub store: Arc<dyn Store>,
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<Registry>,
    pub scheduler: Scheduler,
    pub skills: Arc<SkillCatalog>,
}

impl ToolContext {
    fn git(&self) -> GitWorkspace {
        GitWorkspace::new(self.project.repo_path.clone())
    }

    /// Fold live runtime state back into the session rows so listings and
    /// the scheduler see current status.
    pub async fn sync_session_rows(&self) -> Result<()> {
        for snapshot in self.sessions.list() {
            if let Ok(mut row) = self.store.get_session_row(&snapshot.id).await {
                row.status = snapshot.state;
                row.human_attached = snapshot.human_attached;
                row.attached_viewer_count = snapshot.attached_viewer_count;
                row.last_activity_at = snapshot.last_activity_at;
                self.store.update_session_row(row).await?;
            }
        }
        Ok(())
    }
}

fn obj_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Schemas for every tool, in catalog order.
pub fn tool_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: "list_projects".into(),
            description: "List all projects with their status".into(),
            input_schema: obj_schema(json!({}), &[]),
        },
        ToolSchema {
            name: "get_project".into(),
            description: "Get the current project's details".into(),
            input_schema: obj_schema(json!({}), &[]),
        },
        ToolSchema {
            name: "list_tasks".into(),
            description: "List tasks for the current project".into(),
            input_schema: obj_schema(json!({}), &[]),
        },
        ToolSchema {
            name: "read_session_output".into(),
            description: "Read recent parsed output from a session".into(),
            input_schema: obj_schema(
                json!({
                    "session_id": {"type": "string"},
                    "lines": {"type": "integer", "minimum": 1, "maximum": 500},
                }),
                &["session_id"],
            ),
        },
        ToolSchema {
            name: "generate_progress_report".into(),
            description: "Summarize task, session, and review progress".into(),
            input_schema: obj_schema(json!({}), &[]),
        },
        ToolSchema {
            name: "get_session_ready".into(),
            description: "Check whether a session has passed its readiness handshake".into(),
            input_schema: obj_schema(json!({"session_id": {"type": "string"}}), &["session_id"]),
        },
        ToolSchema {
            name: "list_skills".into(),
            description: "List available skill summaries".into(),
            input_schema: obj_schema(json!({}), &[]),
        },
        ToolSchema {
            name: "get_skill_details".into(),
            description: "Fetch the full body of one skill".into(),
            input_schema: obj_schema(json!({"skill_id": {"type": "string"}}), &["skill_id"]),
        },
        ToolSchema {
            name: "create_project".into(),
            description: "Create a new project for a repository path".into(),
            input_schema: obj_schema(
                json!({
                    "name": {"type": "string"},
                    "repo_path": {"type": "string"},
                }),
                &["name", "repo_path"],
            ),
        },
        ToolSchema {
            name: "create_task".into(),
            description: "Create a task in the current project".into(),
            input_schema: obj_schema(
                json!({
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                }),
                &["title", "description"],
            ),
        },
        ToolSchema {
            name: "write_task_spec".into(),
            description: "Write the TASK.md specification for a task".into(),
            input_schema: obj_schema(
                json!({
                    "task_id": {"type": "string"},
                    "content": {"type": "string"},
                }),
                &["task_id", "content"],
            ),
        },
        ToolSchema {
            name: "create_worktree".into(),
            description: "Create an isolated git worktree for a task".into(),
            input_schema: obj_schema(json!({"task_id": {"type": "string"}}), &["task_id"]),
        },
        ToolSchema {
            name: "merge_worktree".into(),
            description: "Merge a task's approved worktree branch into the default branch".into(),
            input_schema: obj_schema(json!({"task_id": {"type": "string"}}), &["task_id"]),
        },
        ToolSchema {
            name: "resolve_merge_conflict".into(),
            description: "Retry the merge for a task after conflicts were resolved".into(),
            input_schema: obj_schema(json!({"task_id": {"type": "string"}}), &["task_id"]),
        },
        ToolSchema {
            name: "create_session".into(),
            description: "Spawn an agent terminal session for a task role".into(),
            input_schema: obj_schema(
                json!({
                    "task_id": {"type": "string"},
                    "agent_id": {"type": "string"},
                    "role": {"type": "string"},
                }),
                &["task_id", "agent_id", "role"],
            ),
        },
        ToolSchema {
            name: "send_command".into(),
            description: "Send a text command or named key to a session".into(),
            input_schema: obj_schema(
                json!({
                    "session_id": {"type": "string"},
                    "text": {"type": "string"},
                    "key": {"type": "string"},
                }),
                &["session_id"],
            ),
        },
        ToolSchema {
            name: "close_session".into(),
            description: "Terminate an agent session".into(),
            input_schema: obj_schema(json!({"session_id": {"type": "string"}}), &["session_id"]),
        },
    ]
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AgentermError::validation(format!("missing argument: {}", key)))
}

fn arg_uuid(args: &Value, key: &str) -> Result<Uuid> {
    Uuid::parse_str(arg_str(args, key)?)
        .map_err(|e| AgentermError::validation(format!("invalid {}: {}", key, e)))
}

fn slugify(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    let mut out = String::new();
    let mut prev_dash = false;
    for c in slug.chars().take(32) {
        if c == '-' {
            if !prev_dash {
                out.push(c);
            }
            prev_dash = true;
        } else {
            out.push(c);
            prev_dash = false;
        }
    }
    if out.is_empty() { "task".to_string() } else { out }
}

/// Execute one validated tool call.
pub async fn execute(ctx: &ToolContext, name: &str, args: &Value) -> Result<Value> {
    match name {
        "list_projects" => {
            let projects = ctx.store.list_projects().await?;
            Ok(json!({"projects": projects}))
        }
        "get_project" => {
            let project = ctx.store.get_project(ctx.project.id).await?;
            Ok(serde_json::to_value(project)?)
        }
        "list_tasks" => {
            let tasks = ctx.store.list_tasks(ctx.project.id).await?;
            Ok(json!({"tasks": tasks}))
        }
        "read_session_output" => {
            let session_id = arg_str(args, "session_id")?;
            let lines = args.get("lines").and_then(Value::as_u64).unwrap_or(50) as usize;
            let session = ctx
                .sessions
                .get(session_id)
                .ok_or_else(|| AgentermError::state(format!("unknown session: {}", session_id)))?;
            let output = session.parsed_output(lines);
            Ok(json!({"lines": output}))
        }
        "generate_progress_report" => progress_report(ctx).await,
        "get_session_ready" => {
            let session_id = arg_str(args, "session_id")?;
            let session = ctx
                .sessions
                .get(session_id)
                .ok_or_else(|| AgentermError::state(format!("unknown session: {}", session_id)))?;
            Ok(json!({"ready": session.is_ready(), "state": session.state()}))
        }
        "list_skills" => Ok(json!({"skills": ctx.skills.summaries()})),
        "get_skill_details" => {
            let skill_id = arg_str(args, "skill_id")?;
            let skill = ctx
                .skills
                .get(skill_id)
                .ok_or_else(|| AgentermError::state(format!("unknown skill: {}", skill_id)))?;
            Ok(serde_json::to_value(skill)?)
        }
        "create_project" => create_project(ctx, args).await,
        "create_task" => {
            let task = Task::new(
                ctx.project.id,
                arg_str(args, "title")?,
                arg_str(args, "description")?,
            );
            ctx.store.create_task(task.clone()).await?;
            Ok(json!({"task_id": task.id}))
        }
        "write_task_spec" => write_task_spec(ctx, args).await,
        "create_worktree" => create_worktree(ctx, args).await,
        "merge_worktree" | "resolve_merge_conflict" => {
            let task_id = arg_uuid(args, "task_id")?;
            let report = merge_task(ctx.store.as_ref(), &ctx.git(), task_id).await?;
            Ok(merge_report_value(&report))
        }
        "create_session" => create_session(ctx, args).await,
        "send_command" => send_command(ctx, args).await,
        "close_session" => {
            let session_id = arg_str(args, "session_id")?;
            ctx.sessions
                .destroy_session(session_id)
                .await
                .map_err(|e| AgentermError::terminal(session_id, e.to_string()))?;
            ctx.sync_session_rows().await?;
            Ok(json!({"closed": session_id}))
        }
        other => Err(AgentermError::validation(format!("unknown tool: {}", other))),
    }
}

async fn create_project(ctx: &ToolContext, args: &Value) -> Result<Value> {
    let name = arg_str(args, "name")?;
    let repo_path = arg_str(args, "repo_path")?;
    let project = Project {
        id: Uuid::new_v4(),
        name: name.to_string(),
        repo_path: repo_path.into(),
        playbook_id: None,
        profile: Default::default(),
        created_at: Utc::now(),
    };
    GitWorkspace::new(project.repo_path.clone())
        .init_if_needed()
        .await
        .map_err(|e| AgentermError::git(e.to_string()))?;
    ctx.store.create_project(project.clone()).await?;
    Ok(json!({"project_id": project.id}))
}

async fn write_task_spec(ctx: &ToolContext, args: &Value) -> Result<Value> {
    let task_id = arg_uuid(args, "task_id")?;
    let content = arg_str(args, "content")?;
    let mut task = ctx.store.get_task(task_id).await?;

    // Before a worktree exists the spec lives under the repository;
    // create_worktree copies it in as TASK.md.
    let path = match task.worktree_id {
        Some(wt) => ctx.store.get_worktree(wt).await?.path.join("TASK.md"),
        None => ctx
            .project
            .repo_path
            .join(".orchestra")
            .join("specs")
            .join(format!("{}.md", task_id)),
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content).await?;
    task.spec_path = Some(path.clone());
    ctx.store.update_task(task).await?;
    Ok(json!({"spec_path": path}))
}

async fn create_worktree(ctx: &ToolContext, args: &Value) -> Result<Value> {
    let task_id = arg_uuid(args, "task_id")?;
    let mut task = ctx.store.get_task(task_id).await?;
    if task.worktree_id.is_some() {
        return Err(AgentermError::state(format!(
            "task already has a worktree: {}",
            task_id
        )));
    }

    let slug = format!("{}-{}", slugify(&task.title), &task_id.simple().to_string()[..8]);
    let branch = format!("task/{}", slug);
    let git = ctx.git();
    let path = git
        .create_worktree(&slug, &branch)
        .await
        .map_err(|e| AgentermError::git(e.to_string()))?;

    // Bring the spec along as the worktree's TASK.md.
    if let Some(spec) = &task.spec_path {
        if spec.exists() {
            let _ = tokio::fs::copy(spec, path.join("TASK.md")).await;
        }
    }

    let worktree = Worktree {
        id: Uuid::new_v4(),
        project_id: ctx.project.id,
        branch_name: branch,
        path: path.clone(),
        task_id: Some(task_id),
        status: WorktreeStatus::Active,
        created_at: Utc::now(),
    };
    ctx.store.create_worktree(worktree.clone()).await?;

    task.worktree_id = Some(worktree.id);
    task.status = TaskStatus::InProgress;
    ctx.store.update_task(task).await?;

    Ok(json!({"worktree_id": worktree.id, "path": path, "branch": worktree.branch_name}))
}

async fn create_session(ctx: &ToolContext, args: &Value) -> Result<Value> {
    let task_id = arg_uuid(args, "task_id")?;
    let agent_id = arg_str(args, "agent_id")?;
    let role = arg_str(args, "role")?;

    let task = ctx.store.get_task(task_id).await?;
    let agent = ctx
        .registry
        .agent(agent_id)
        .ok_or_else(|| AgentermError::state(format!("unknown agent: {}", agent_id)))?
        .clone();
    let playbook = ctx
        .project
        .playbook_id
        .as_deref()
        .and_then(|id| ctx.registry.playbook(id));

    // The bound model wins over the agent default.
    let model = playbook
        .and_then(|p| p.binding_for_role(role))
        .and_then(|(_, b)| b.model.clone())
        .unwrap_or_else(|| agent.model.clone());

    // Scheduler admission against the global snapshot.
    ctx.sync_session_rows().await?;
    let rows = ctx
        .store
        .list_session_rows(SessionFilter::default())
        .await?;
    let request = AdmissionRequest {
        project: &ctx.project,
        role,
        agent: &agent,
        model: &model,
        playbook,
    };
    if let Err(denial) = ctx.scheduler.admit(&request, &rows) {
        return Err(AgentermError::policy(
            denial.cap_kind.clone(),
            serde_json::to_string(&denial).unwrap_or_else(|_| denial.to_string()),
        ));
    }

    let work_dir = match task.worktree_id {
        Some(wt) => Some(ctx.store.get_worktree(wt).await?.path),
        None => Some(ctx.project.repo_path.clone()),
    };

    let mut spec = SessionSpec::new(
        format!("{}-{}", role, slugify(&task.title)),
        agent.command.clone(),
    );
    spec.work_dir = work_dir;
    spec.task_id = Some(task_id.to_string());
    spec.agent_type = agent.id.clone();
    spec.role = role.to_string();
    spec.readiness_pattern = agent.readiness_pattern.clone();

    let session = ctx
        .sessions
        .create_session(spec)
        .await
        .map_err(|e| AgentermError::terminal("spawn", e.to_string()))?;

    let row = SessionRow {
        id: session.id.clone(),
        project_id: ctx.project.id,
        task_id: Some(task_id),
        terminal_id: session.id.clone(),
        agent_type: agent.id.clone(),
        role: role.to_string(),
        status: session.state(),
        human_attached: false,
        attached_viewer_count: 0,
        created_at: session.created_at,
        last_activity_at: session.created_at,
    };
    if let Err(e) = ctx.store.create_session_row(row).await {
        // Roll back the spawned terminal; no orphan fd, no orphan row.
        let _ = ctx.sessions.destroy_session(&session.id).await;
        return Err(e);
    }

    Ok(json!({"session_id": session.id, "name": session.name, "model": model}))
}

async fn send_command(ctx: &ToolContext, args: &Value) -> Result<Value> {
    let session_id = arg_str(args, "session_id")?;
    let (op, payload) = if let Some(text) = args.get("text").and_then(Value::as_str) {
        let mut text = text.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        (CommandOp::SendText, json!({"text": text}))
    } else if let Some(key) = args.get("key").and_then(Value::as_str) {
        (CommandOp::SendKey, json!({"key": key}))
    } else {
        return Err(AgentermError::validation("send_command needs text or key"));
    };

    let command_id = ctx
        .sessions
        .enqueue_command(session_id, op, payload)
        .await
        .map_err(|e| match e {
            agent_session::EnqueueError::Policy(v) => v.into(),
            other => AgentermError::terminal(session_id, other.to_string()),
        })?;
    Ok(json!({"command_id": command_id}))
}

async fn progress_report(ctx: &ToolContext) -> Result<Value> {
    ctx.sync_session_rows().await?;
    let tasks = ctx.store.list_tasks(ctx.project.id).await?;
    let sessions = ctx
        .store
        .list_session_rows(SessionFilter {
            project_id: Some(ctx.project.id),
            ..Default::default()
        })
        .await?;

    let mut by_status: HashMap<String, usize> = HashMap::new();
    for task in &tasks {
        *by_status
            .entry(format!("{:?}", task.status).to_lowercase())
            .or_default() += 1;
    }
    let active_sessions = sessions.iter().filter(|s| s.is_active()).count();

    Ok(json!({
        "project": ctx.project.name,
        "tasks_total": tasks.len(),
        "tasks_by_status": by_status,
        "sessions_total": sessions.len(),
        "sessions_active": active_sessions,
    }))
}

fn merge_report_value(report: &MergeReport) -> Value {
    match report {
        MergeReport::Merged { task_id, branch } => {
            json!({"merged": true, "task_id": task_id, "branch": branch})
        }
        MergeReport::Conflict { task_id, detail } => {
            json!({"merged": false, "task_id": task_id, "conflict": detail})
        }
        MergeReport::NotReady { task_id, reason } => {
            json!({"merged": false, "task_id": task_id, "reason": reason})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutating_set_is_closed_and_disjoint() {
        for tool in MUTATING_TOOLS {
            assert!(is_mutating(tool));
            assert!(!READ_TOOLS.contains(tool));
        }
        for tool in READ_TOOLS {
            assert!(!is_mutating(tool));
        }
        // Every schema belongs to exactly one of the two sets.
        for schema in tool_schemas() {
            assert!(is_known_tool(&schema.name), "untabled tool {}", schema.name);
        }
        assert_eq!(
            tool_schemas().len(),
            MUTATING_TOOLS.len() + READ_TOOLS.len()
        );
    }

    #[test]
    fn slugs_are_filesystem_safe() {
        assert_eq!(slugify("Scaffold Auth Service!"), "scaffold-auth-service");
        assert_eq!(slugify("  ---  "), "task");
        assert!(slugify("a very long title that should be truncated somewhere").len() <= 32);
    }
}
