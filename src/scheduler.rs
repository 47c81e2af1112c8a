//! Session admission.
//!
//! Every `create_session` passes through here before a terminal spawns.
//! Caps are checked in a fixed order so denial reasons are stable:
//! global, project, workflow phase, role binding, agent. Sessions under
//! human takeover still hold their slot.

use serde::{Deserialize, Serialize};

use crate::model::{Project, SessionRow};
use crate::registry::{AgentSpec, Playbook};

/// Default ceiling on live sessions across all projects.
pub const DEFAULT_GLOBAL_MAX_PARALLEL: usize = 32;

/// Structured denial the orchestrator relays as a tool-result error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerDenial {
    pub cap_kind: String,
    pub observed: usize,
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl std::fmt::Display for SchedulerDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scheduler denied [{}]: {} of {} slots in use",
            self.cap_kind, self.observed, self.limit
        )?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for SchedulerDenial {}

/// One admission request.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub project: &'a Project,
    pub role: &'a str,
    pub agent: &'a AgentSpec,
    /// Model the session will run with.
    pub model: &'a str,
    pub playbook: Option<&'a Playbook>,
}

/// Concurrency governor.
#[derive(Debug, Clone)]
pub struct Scheduler {
    global_max_parallel: usize,
}

impl Scheduler {
    pub fn new(global_max_parallel: usize) -> Self {
        Self { global_max_parallel }
    }

    /// Admit or reject against the caps, using `sessions` as the global
    /// snapshot (all projects, all states).
    pub fn admit(
        &self,
        request: &AdmissionRequest<'_>,
        sessions: &[SessionRow],
    ) -> Result<(), SchedulerDenial> {
        let active: Vec<&SessionRow> = sessions.iter().filter(|s| s.is_active()).collect();

        // 1. Global cap; takeover sessions still consume their slot.
        if active.len() >= self.global_max_parallel {
            return Err(SchedulerDenial {
                cap_kind: "global".to_string(),
                observed: active.len(),
                limit: self.global_max_parallel,
                detail: None,
            });
        }

        // 2. Per-project cap.
        let project_active = active
            .iter()
            .filter(|s| s.project_id == request.project.id)
            .count();
        if project_active >= request.project.profile.max_parallel {
            return Err(SchedulerDenial {
                cap_kind: "project".to_string(),
                observed: project_active,
                limit: request.project.profile.max_parallel,
                detail: Some(request.project.name.clone()),
            });
        }

        if let Some(playbook) = request.playbook {
            if let Some((stage, binding)) = playbook.binding_for_role(request.role) {
                // 3. Per-phase cap: project sessions filling this role.
                let phase_active = active
                    .iter()
                    .filter(|s| s.project_id == request.project.id && s.role == request.role)
                    .count();
                if phase_active >= binding.max_parallel {
                    return Err(SchedulerDenial {
                        cap_kind: "phase".to_string(),
                        observed: phase_active,
                        limit: binding.max_parallel,
                        detail: Some(stage.name.clone()),
                    });
                }

                // 4. Role binding: allowed agent and bound model.
                if !binding.allowed_agents.iter().any(|a| a == &request.agent.id) {
                    return Err(SchedulerDenial {
                        cap_kind: "role_binding".to_string(),
                        observed: 0,
                        limit: 0,
                        detail: Some(format!(
                            "agent {} not allowed for role {}",
                            request.agent.id, request.role
                        )),
                    });
                }
                if let Some(bound_model) = &binding.model {
                    if bound_model != request.model {
                        return Err(SchedulerDenial {
                            cap_kind: "role_binding".to_string(),
                            observed: 0,
                            limit: 0,
                            detail: Some(format!(
                                "role {} is bound to model {}",
                                request.role, bound_model
                            )),
                        });
                    }
                }
            }
        }

        // 5. Per-agent cap, across all projects.
        let agent_active = active
            .iter()
            .filter(|s| s.agent_type == request.agent.id)
            .count();
        if agent_active >= request.agent.max_parallel_agents {
            return Err(SchedulerDenial {
                cap_kind: "agent".to_string(),
                observed: agent_active,
                limit: request.agent.max_parallel_agents,
                detail: Some(request.agent.id.clone()),
            });
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_GLOBAL_MAX_PARALLEL)
    }
}
