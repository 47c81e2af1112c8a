//! Configuration.
//!
//! A single JSON file plus a couple of environment overrides. Process-wide
//! state is limited to this struct, the logger, and the store handle;
//! everything else is instantiated at startup and passed explicitly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::scheduler::DEFAULT_GLOBAL_MAX_PARALLEL;

/// Default set of phrases that open the orchestrator approval gate.
pub fn default_approval_keywords() -> Vec<String> {
    [
        "go ahead",
        "approved",
        "approve",
        "yes, proceed",
        "proceed",
        "do it",
        "lgtm",
        "ship it",
        "confirmed",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub agents_path: PathBuf,
    pub playbooks_path: PathBuf,
    /// Roots scanned for skills, in order.
    pub skill_roots: Vec<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            agents_path: PathBuf::from("agents.yaml"),
            playbooks_path: PathBuf::from("playbooks.yaml"),
            skill_roots: vec![
                PathBuf::from("skills"),
                PathBuf::from(".agents/skills"),
                PathBuf::from(".claude/skills"),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentermConfig {
    pub bind_addr: String,
    /// Single bearer token for the HTTP/WS facade.
    pub auth_token: Option<String>,
    pub global_max_parallel: usize,
    pub auto_commit_interval_secs: u64,
    pub review_max_iterations: u32,
    /// Conversation window loaded into the orchestrator prompt.
    pub max_history: usize,
    pub max_tool_rounds: u32,
    pub llm: LlmConfig,
    pub registry: RegistryConfig,
    pub approval_keywords: Vec<String>,
}

impl Default for AgentermConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8900".to_string(),
            auth_token: None,
            global_max_parallel: DEFAULT_GLOBAL_MAX_PARALLEL,
            auto_commit_interval_secs: 30,
            review_max_iterations: 20,
            max_history: 40,
            max_tool_rounds: 12,
            llm: LlmConfig::default(),
            registry: RegistryConfig::default(),
            approval_keywords: default_approval_keywords(),
        }
    }
}

impl AgentermConfig {
    /// Load from a JSON file, then apply environment overrides
    /// (`AGENTERM_BIND`, `AGENTERM_TOKEN`). A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(bind) = std::env::var("AGENTERM_BIND") {
            config.bind_addr = bind;
        }
        if let Ok(token) = std::env::var("AGENTERM_TOKEN") {
            config.auth_token = Some(token);
        }
        Ok(config)
    }

    /// Write a fresh config with a generated bearer token. Refuses to
    /// overwrite an existing file.
    pub fn init(path: &Path) -> Result<Self> {
        if path.exists() {
            anyhow::bail!("config already exists: {}", path.display());
        }
        let mut config = Self::default();
        config.auth_token = Some(generate_token());
        let raw = serde_json::to_string_pretty(&config)?;
        std::fs::write(path, raw)
            .with_context(|| format!("writing config {}", path.display()))?;
        Ok(config)
    }
}

fn generate_token() -> String {
    let mut rng = rand::rng();
    (0..32)
        .map(|_| {
            let n: u8 = rng.random_range(0..36);
            char::from_digit(n as u32, 36).unwrap_or('0')
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = AgentermConfig::default();
        assert_eq!(config.global_max_parallel, 32);
        assert_eq!(config.auto_commit_interval_secs, 30);
        assert_eq!(config.review_max_iterations, 20);
        assert_eq!(config.max_history, 40);
        assert_eq!(config.max_tool_rounds, 12);
        assert!(config.approval_keywords.contains(&"go ahead".to_string()));
    }

    #[test]
    fn init_writes_a_token_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = AgentermConfig::init(&path).unwrap();
        assert!(config.auth_token.is_some());
        assert!(AgentermConfig::init(&path).is_err());

        let loaded = AgentermConfig::load(&path).unwrap();
        assert_eq!(loaded.auth_token, config.auth_token);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentermConfig::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(config.max_tool_rounds, 12);
    }
}
