//! System prompt assembly.

use crate::model::{Project, Task};
use crate::orchestrator::skills::SkillSummary;
use crate::registry::{AgentSpec, Playbook};
use agent_session::SessionSnapshot;

/// Everything the prompt is assembled from.
pub struct PromptInputs<'a> {
    pub project: &'a Project,
    pub tasks: &'a [Task],
    pub sessions: &'a [SessionSnapshot],
    pub agents: Vec<&'a AgentSpec>,
    pub playbook: Option<&'a Playbook>,
    pub skills: &'a [SkillSummary],
}

/// Build the orchestrator system prompt: project summary, agent catalog,
/// playbook workflow, safety rules, skill summaries.
pub fn system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut out = String::new();

    out.push_str(
        "You are the orchestrator for a fleet of interactive AI coding agents. \
         You plan tasks, spawn agent sessions in isolated git worktrees, monitor \
         their output, route work between coders and reviewers, and merge approved \
         work. Use tools for every action; never fabricate tool output.\n\n",
    );

    out.push_str(&format!(
        "## Project\nname: {}\nrepository: {}\nmax parallel sessions: {}\n\n",
        inputs.project.name,
        inputs.project.repo_path.display(),
        inputs.project.profile.max_parallel,
    ));

    out.push_str("## Tasks\n");
    if inputs.tasks.is_empty() {
        out.push_str("(none)\n");
    }
    for task in inputs.tasks {
        out.push_str(&format!(
            "- [{:?}] {} — {}\n",
            task.status, task.title, task.id
        ));
    }
    out.push('\n');

    out.push_str("## Active sessions\n");
    if inputs.sessions.is_empty() {
        out.push_str("(none)\n");
    }
    for session in inputs.sessions {
        out.push_str(&format!(
            "- {} role={} agent={} state={:?}\n",
            session.id, session.role, session.agent_type, session.state
        ));
    }
    out.push('\n');

    out.push_str("## Available agents\n");
    for agent in &inputs.agents {
        out.push_str(&format!(
            "- {} (model {}, max {} parallel): {}\n",
            agent.id,
            agent.model,
            agent.max_parallel_agents,
            agent.capabilities.join(", "),
        ));
    }
    out.push('\n');

    if let Some(playbook) = inputs.playbook {
        out.push_str(&format!("## Workflow: {}\n", playbook.id));
        for stage in &playbook.stages {
            let roles: Vec<String> = stage
                .roles
                .iter()
                .map(|r| format!("{} ({})", r.role, r.allowed_agents.join("/")))
                .collect();
            out.push_str(&format!("- {}: {}\n", stage.name, roles.join(", ")));
        }
        out.push('\n');
    }

    out.push_str(
        "## Safety rules\n\
         - Mutating tools require explicit user approval in the latest message.\n\
         - Agent commands are confined to the task worktree; destructive commands are denied.\n\
         - Respect concurrency limits; a scheduler denial means wait, queue, or downscope.\n\
         - Report failures honestly; never mark work complete without a passing review.\n\n",
    );

    if !inputs.skills.is_empty() {
        out.push_str("## Skills\n");
        out.push_str(
            "Summaries only; fetch a body with get_skill_details before applying one.\n",
        );
        for skill in inputs.skills {
            out.push_str(&format!("- {}: {}\n", skill.id, skill.description));
        }
        out.push('\n');
    }

    out
}

/// Does the latest user message express explicit confirmation intent?
///
/// The keyword set is frozen in configuration and documented; matching is
/// case-insensitive substring.
pub fn approval_granted(message: &str, keywords: &[String]) -> bool {
    let lower = message.to_lowercase();
    keywords.iter().any(|k| lower.contains(&k.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_approval_keywords;

    #[test]
    fn approval_gate_matches_known_phrases() {
        let keywords = default_approval_keywords();
        assert!(approval_granted(
            "please approve: scaffold auth service and open a PR",
            &keywords
        ));
        assert!(approval_granted("Go ahead and build it", &keywords));
        assert!(approval_granted("LGTM, ship it", &keywords));
        assert!(!approval_granted("what's the status?", &keywords));
        assert!(!approval_granted("how would you approach this?", &keywords));
    }
}
