//! Agent and playbook registries.
//!
//! The registries are user-owned YAML files; the core only reads them.
//! Agents describe launchable CLIs, playbooks describe workflow stages and
//! which roles (and agents) each stage allows.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A launchable interactive agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    /// Command line used to start the agent.
    pub command: String,
    pub model: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Concurrent sessions of this agent across all projects.
    #[serde(default = "default_agent_parallel")]
    pub max_parallel_agents: usize,
    /// Pattern matched against early output to detect readiness.
    #[serde(default)]
    pub readiness_pattern: Option<String>,
}

fn default_agent_parallel() -> usize {
    4
}

/// Which agents may fill a role within a stage, and at what concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleBinding {
    pub role: String,
    pub allowed_agents: Vec<String>,
    /// When set, sessions for this role must use this model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_role_parallel")]
    pub max_parallel: usize,
}

fn default_role_parallel() -> usize {
    2
}

/// One workflow stage (`plan`, `build`, `test`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookStage {
    pub name: String,
    pub roles: Vec<RoleBinding>,
}

/// A workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<PlaybookStage>,
}

impl Playbook {
    /// The binding for a role, searched across stages in order.
    pub fn binding_for_role(&self, role: &str) -> Option<(&PlaybookStage, &RoleBinding)> {
        for stage in &self.stages {
            if let Some(binding) = stage.roles.iter().find(|b| b.role == role) {
                return Some((stage, binding));
            }
        }
        None
    }
}

/// In-process registry snapshot.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    agents: HashMap<String, AgentSpec>,
    playbooks: HashMap<String, Playbook>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load agents and playbooks from YAML files. Either path may be
    /// absent; missing files yield an empty section.
    pub fn load(agents_path: &Path, playbooks_path: &Path) -> Result<Self> {
        let mut registry = Self::new();

        if agents_path.exists() {
            let raw = std::fs::read_to_string(agents_path)
                .with_context(|| format!("reading agent registry {}", agents_path.display()))?;
            let agents: Vec<AgentSpec> = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing agent registry {}", agents_path.display()))?;
            for agent in agents {
                registry.agents.insert(agent.id.clone(), agent);
            }
        }

        if playbooks_path.exists() {
            let raw = std::fs::read_to_string(playbooks_path).with_context(|| {
                format!("reading playbook registry {}", playbooks_path.display())
            })?;
            let playbooks: Vec<Playbook> = serde_yaml::from_str(&raw).with_context(|| {
                format!("parsing playbook registry {}", playbooks_path.display())
            })?;
            for playbook in playbooks {
                registry.playbooks.insert(playbook.id.clone(), playbook);
            }
        }

        Ok(registry)
    }

    pub fn insert_agent(&mut self, agent: AgentSpec) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn insert_playbook(&mut self, playbook: Playbook) {
        self.playbooks.insert(playbook.id.clone(), playbook);
    }

    pub fn agent(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.get(id)
    }

    pub fn playbook(&self, id: &str) -> Option<&Playbook> {
        self.playbooks.get(id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentSpec> {
        self.agents.values()
    }

    pub fn playbooks(&self) -> impl Iterator<Item = &Playbook> {
        self.playbooks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENTS_YAML: &str = r#"
- id: claude
  command: "claude --dangerously-skip-permissions"
  model: claude-sonnet-4-20250514
  capabilities: [code, review]
  max_parallel_agents: 6
  readiness_pattern: "Welcome to Claude"
- id: codex
  command: "codex"
  model: gpt-5-codex
"#;

    const PLAYBOOKS_YAML: &str = r#"
- id: pairing-coding
  description: coder/reviewer pairing
  stages:
    - name: build
      roles:
        - role: coder
          allowed_agents: [claude, codex]
          max_parallel: 3
        - role: reviewer
          allowed_agents: [claude]
          model: claude-opus-4-20250514
          max_parallel: 1
"#;

    #[test]
    fn yaml_registries_parse() {
        let dir = tempfile::tempdir().unwrap();
        let agents = dir.path().join("agents.yaml");
        let playbooks = dir.path().join("playbooks.yaml");
        std::fs::write(&agents, AGENTS_YAML).unwrap();
        std::fs::write(&playbooks, PLAYBOOKS_YAML).unwrap();

        let registry = Registry::load(&agents, &playbooks).unwrap();
        let claude = registry.agent("claude").unwrap();
        assert_eq!(claude.max_parallel_agents, 6);
        assert_eq!(claude.readiness_pattern.as_deref(), Some("Welcome to Claude"));
        // Defaults apply when omitted.
        assert_eq!(registry.agent("codex").unwrap().max_parallel_agents, 4);

        let playbook = registry.playbook("pairing-coding").unwrap();
        let (stage, binding) = playbook.binding_for_role("reviewer").unwrap();
        assert_eq!(stage.name, "build");
        assert_eq!(binding.model.as_deref(), Some("claude-opus-4-20250514"));
    }

    #[test]
    fn missing_files_yield_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(
            &dir.path().join("nope.yaml"),
            &dir.path().join("also-nope.yaml"),
        )
        .unwrap();
        assert_eq!(registry.agents().count(), 0);
        assert_eq!(registry.playbooks().count(), 0);
    }
}
