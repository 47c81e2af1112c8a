//! agenterm binary: config bootstrap and the orchestration daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agenterm::config::AgentermConfig;
use agenterm::coordinator::{AutomationCoordinator, CoordinatorSettings, ready_commit_probe};
use agenterm::coordinator::review::ReviewSettings;
use agenterm::orchestrator::skills::SkillCatalog;
use agenterm::registry::Registry;
use agenterm::repo::memory::MemoryStore;
use agenterm::scheduler::Scheduler;
use agent_session::{EventBus, PtyBackend, SessionManager};

#[derive(Parser)]
#[command(name = "agenterm", version, about = "Control plane for fleets of AI coding agents")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "agenterm.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration daemon.
    Serve,
    /// Manage configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a fresh config file with a generated bearer token.
    Init,
    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("agenterm=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init => {
                let config = AgentermConfig::init(&cli.config)?;
                println!("wrote {}", cli.config.display());
                if let Some(token) = config.auth_token {
                    println!("bearer token: {}", token);
                }
                Ok(())
            }
            ConfigAction::Show => {
                let config = AgentermConfig::load(&cli.config)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        },
        Command::Serve => serve(&cli.config).await,
    }
}

async fn serve(config_path: &std::path::Path) -> Result<()> {
    let config = AgentermConfig::load(config_path)?;
    info!(bind = %config.bind_addr, "starting agenterm");

    // Long-lived components, instantiated once and passed explicitly.
    let bus = Arc::new(EventBus::new());
    let sessions = SessionManager::new(Arc::new(PtyBackend::new()), Arc::clone(&bus));
    sessions.set_ready_probe(ready_commit_probe());

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(Registry::load(
        &config.registry.agents_path,
        &config.registry.playbooks_path,
    )?);
    let _scheduler = Scheduler::new(config.global_max_parallel);
    let cwd = std::env::current_dir()?;
    let skills = Arc::new(SkillCatalog::discover(&cwd, &config.registry.skill_roots));
    info!(
        agents = registry.agents().count(),
        playbooks = registry.playbooks().count(),
        skills = skills.len(),
        "registries loaded"
    );

    let coordinator = AutomationCoordinator::new(
        store,
        Arc::clone(&sessions),
        Arc::clone(&bus),
        CoordinatorSettings {
            auto_commit_interval: std::time::Duration::from_secs(config.auto_commit_interval_secs),
            review: ReviewSettings {
                max_iterations: config.review_max_iterations,
            },
            ..Default::default()
        },
    );

    let cancel = CancellationToken::new();
    coordinator.spawn(cancel.clone());

    // The HTTP/WS facade attaches here; the core runs until interrupted.
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    sessions.shutdown().await;
    Ok(())
}
