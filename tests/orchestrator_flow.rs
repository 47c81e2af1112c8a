//! Orchestrator loop tests with a scripted provider.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use agent_session::{EventBus, PtyBackend, SessionManager};
use agenterm::model::{OrchestratorProfile, Project};
use agenterm::orchestrator::skills::SkillCatalog;
use agenterm::orchestrator::tools::ToolContext;
use agenterm::orchestrator::{Orchestrator, OrchestratorSettings};
use agenterm::protocol::StreamEvent;
use agenterm::providers::{ContentBlock, ScriptedProvider};
use agenterm::registry::Registry;
use agenterm::repo::memory::MemoryStore;
use agenterm::repo::{ProjectRepo, TaskRepo};
use agenterm::scheduler::Scheduler;

fn tool_use(name: &str, input: serde_json::Value) -> ContentBlock {
    ContentBlock::ToolUse {
        id: format!("tu_{}", Uuid::new_v4().simple()),
        name: name.to_string(),
        input,
    }
}

async fn context(store: Arc<MemoryStore>) -> (ToolContext, Project) {
    let project = Project {
        id: Uuid::new_v4(),
        name: "demo".to_string(),
        repo_path: std::env::temp_dir().join(format!("agenterm-test-{}", Uuid::new_v4())),
        playbook_id: None,
        profile: OrchestratorProfile::default(),
        created_at: chrono::Utc::now(),
    };
    store.create_project(project.clone()).await.unwrap();

    let bus = Arc::new(EventBus::new());
    let ctx = ToolContext {
        project: project.clone(),
        store: store.clone(),
        sessions: SessionManager::new(Arc::new(PtyBackend::new()), bus),
        registry: Arc::new(Registry::new()),
        scheduler: Scheduler::default(),
        skills: Arc::new(SkillCatalog::new()),
    };
    (ctx, project)
}

async fn collect(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn mutating_tool_is_blocked_without_approval() {
    let store = Arc::new(MemoryStore::new());
    let (ctx, project) = context(Arc::clone(&store)).await;

    let provider = Arc::new(ScriptedProvider::new(vec![
        vec![
            ContentBlock::Text {
                text: "I'll create that task.".to_string(),
            },
            tool_use("create_task", json!({"title": "t", "description": "d"})),
        ],
        vec![ContentBlock::Text {
            text: "Blocked; please confirm.".to_string(),
        }],
    ]));
    let orchestrator = Orchestrator::new(provider, OrchestratorSettings::default());

    let (tx, rx) = mpsc::unbounded_channel();
    orchestrator
        .handle_message(&ctx, "what's the status?", tx)
        .await
        .unwrap();
    let events = collect(rx).await;

    // The tool result carries the structured block reason back to the LLM.
    let blocked = events.iter().any(|e| {
        matches!(e, StreamEvent::ToolResult { error: Some(err), .. } if err == "approval_required")
    });
    assert!(blocked, "expected approval_required, got {:?}", events);
    assert!(matches!(events.last(), Some(StreamEvent::Done)));

    // Nothing was created.
    assert!(store.list_tasks(project.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn read_only_tools_run_without_approval() {
    let store = Arc::new(MemoryStore::new());
    let (ctx, _project) = context(Arc::clone(&store)).await;

    let provider = Arc::new(ScriptedProvider::new(vec![
        vec![tool_use("list_tasks", json!({}))],
        vec![ContentBlock::Text {
            text: "No tasks yet.".to_string(),
        }],
    ]));
    let orchestrator = Orchestrator::new(provider, OrchestratorSettings::default());

    let (tx, rx) = mpsc::unbounded_channel();
    orchestrator
        .handle_message(&ctx, "what's the status?", tx)
        .await
        .unwrap();
    let events = collect(rx).await;

    let succeeded = events
        .iter()
        .any(|e| matches!(e, StreamEvent::ToolResult { result: Some(_), error: None }));
    assert!(succeeded, "read tool should run: {:?}", events);
}

#[tokio::test]
async fn approved_message_executes_mutating_tools() {
    let store = Arc::new(MemoryStore::new());
    let (ctx, project) = context(Arc::clone(&store)).await;

    let provider = Arc::new(ScriptedProvider::new(vec![
        vec![tool_use(
            "create_task",
            json!({"title": "scaffold auth service", "description": "with tests"}),
        )],
        vec![ContentBlock::Text {
            text: "Task created.".to_string(),
        }],
    ]));
    let orchestrator = Orchestrator::new(provider, OrchestratorSettings::default());

    let (tx, rx) = mpsc::unbounded_channel();
    orchestrator
        .handle_message(
            &ctx,
            "please approve: scaffold auth service and open a PR",
            tx,
        )
        .await
        .unwrap();
    let events = collect(rx).await;

    assert!(
        events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCall { name, .. } if name == "create_task"))
    );
    let tasks = store.list_tasks(project.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "scaffold auth service");
}

#[tokio::test]
async fn unknown_tool_is_rejected_not_fatal() {
    let store = Arc::new(MemoryStore::new());
    let (ctx, _project) = context(Arc::clone(&store)).await;

    let provider = Arc::new(ScriptedProvider::new(vec![
        vec![tool_use("drop_database", json!({}))],
        vec![ContentBlock::Text {
            text: "Understood.".to_string(),
        }],
    ]));
    let orchestrator = Orchestrator::new(provider, OrchestratorSettings::default());

    let (tx, rx) = mpsc::unbounded_channel();
    orchestrator
        .handle_message(&ctx, "go ahead", tx)
        .await
        .unwrap();
    let events = collect(rx).await;

    let rejected = events.iter().any(|e| {
        matches!(e, StreamEvent::ToolResult { error: Some(err), .. } if err.contains("unknown tool"))
    });
    assert!(rejected);
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
}

#[tokio::test]
async fn event_trigger_stops_on_cancellation() {
    let store = Arc::new(MemoryStore::new());
    let (ctx, _project) = context(Arc::clone(&store)).await;
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let orchestrator = Arc::new(Orchestrator::new(provider, OrchestratorSettings::default()));

    let trigger = agenterm::orchestrator::EventTrigger::new(orchestrator, ctx);
    let cancel = tokio_util::sync::CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { trigger.run(token).await });

    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("trigger should exit promptly")
        .unwrap();
}

#[tokio::test]
async fn create_session_relays_scheduler_denial() {
    let store = Arc::new(MemoryStore::new());
    let (mut ctx, project) = context(Arc::clone(&store)).await;

    let mut registry = Registry::new();
    registry.insert_agent(agenterm::registry::AgentSpec {
        id: "claude".to_string(),
        command: "claude".to_string(),
        model: "claude-sonnet-4-20250514".to_string(),
        capabilities: vec![],
        max_parallel_agents: 4,
        readiness_pattern: None,
    });
    ctx.registry = Arc::new(registry);
    // A zero global cap rejects everything before any terminal spawns.
    ctx.scheduler = Scheduler::new(0);

    let task = agenterm::model::Task::new(project.id, "t", "d");
    store.create_task(task.clone()).await.unwrap();

    let err = agenterm::orchestrator::tools::execute(
        &ctx,
        "create_session",
        &json!({"task_id": task.id, "agent_id": "claude", "role": "coder"}),
    )
    .await
    .unwrap_err();

    let text = err.to_string();
    assert!(text.contains("global"), "denial should name the cap: {}", text);
    assert!(ctx.sessions.list().is_empty(), "no terminal was spawned");
}

#[tokio::test]
async fn tool_round_budget_is_bounded() {
    let store = Arc::new(MemoryStore::new());
    let (ctx, _project) = context(Arc::clone(&store)).await;

    // A provider that asks for a tool on every round would loop forever
    // without the budget.
    let responses: Vec<Vec<ContentBlock>> = (0..50)
        .map(|_| vec![tool_use("list_tasks", json!({}))])
        .collect();
    let provider = Arc::new(ScriptedProvider::new(responses));
    let provider_handle = Arc::clone(&provider);
    let settings = OrchestratorSettings {
        max_tool_rounds: 3,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(provider, settings);

    let (tx, rx) = mpsc::unbounded_channel();
    orchestrator.handle_message(&ctx, "go ahead", tx).await.unwrap();
    let events = collect(rx).await;

    let calls = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ToolCall { .. }))
        .count();
    assert_eq!(calls, 3);
    assert_eq!(
        provider_handle.requests.lock().unwrap().len(),
        3,
        "one provider call per round"
    );
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
}
