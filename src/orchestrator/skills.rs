//! Skill discovery and progressive disclosure.
//!
//! Skills are small `{name, description, body}` capability packs found on
//! the filesystem. Only summaries enter the system prompt; the model pulls
//! a body with `get_skill_details` when it decides to apply one, keeping
//! prompt growth bounded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

/// One discovered skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub body: String,
}

/// Summary surfaced in the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSummary {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Skills indexed by id.
#[derive(Debug, Clone, Default)]
pub struct SkillCatalog {
    skills: HashMap<String, Skill>,
}

impl SkillCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the given roots (relative to `base`) for skills. A skill is a
    /// markdown file, or a directory containing `SKILL.md`.
    pub fn discover(base: &Path, roots: &[PathBuf]) -> Self {
        let mut catalog = Self::new();
        for root in roots {
            let dir = base.join(root);
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&dir)
                .max_depth(2)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let id = skill_id(&dir, path);
                if let Some(skill) = load_skill(&id, path) {
                    debug!(skill = %skill.id, "discovered skill");
                    catalog.skills.insert(skill.id.clone(), skill);
                }
            }
        }
        catalog
    }

    pub fn insert(&mut self, skill: Skill) {
        self.skills.insert(skill.id.clone(), skill);
    }

    pub fn get(&self, id: &str) -> Option<&Skill> {
        self.skills.get(id)
    }

    /// Summaries only, sorted by id for stable prompts.
    pub fn summaries(&self) -> Vec<SkillSummary> {
        let mut list: Vec<SkillSummary> = self
            .skills
            .values()
            .map(|s| SkillSummary {
                id: s.id.clone(),
                name: s.name.clone(),
                description: s.description.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

fn skill_id(root: &Path, path: &Path) -> String {
    // `<root>/deploy.md` -> "deploy"; `<root>/deploy/SKILL.md` -> "deploy".
    let rel = path.strip_prefix(root).unwrap_or(path);
    if rel.file_name().and_then(|n| n.to_str()) == Some("SKILL.md") {
        rel.parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("skill")
            .to_string()
    } else {
        rel.file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("skill")
            .to_string()
    }
}

/// Parse a skill file: optional YAML-ish frontmatter (`name:`,
/// `description:`) followed by the body.
fn load_skill(id: &str, path: &Path) -> Option<Skill> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut name = id.to_string();
    let mut description = String::new();
    let body;

    if let Some(rest) = raw.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---") {
            for line in rest[..end].lines() {
                if let Some(v) = line.strip_prefix("name:") {
                    name = v.trim().to_string();
                } else if let Some(v) = line.strip_prefix("description:") {
                    description = v.trim().to_string();
                }
            }
            body = rest[end + 4..].trim_start().to_string();
        } else {
            body = raw.clone();
        }
    } else {
        body = raw.clone();
    }

    if description.is_empty() {
        // First non-heading line doubles as the description.
        description = body
            .lines()
            .find(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .unwrap_or("")
            .trim()
            .to_string();
    }

    Some(Skill {
        id: id.to_string(),
        name,
        description,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_flat_files_and_skill_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("skills");
        std::fs::create_dir_all(root.join("deploy")).unwrap();
        std::fs::write(
            root.join("review-checklist.md"),
            "---\nname: Review checklist\ndescription: What reviewers verify\n---\n# Steps\n1. read diff\n",
        )
        .unwrap();
        std::fs::write(
            root.join("deploy/SKILL.md"),
            "# Deploy\nShip a release safely.\n\nDetails here.\n",
        )
        .unwrap();

        let catalog = SkillCatalog::discover(dir.path(), &[PathBuf::from("skills")]);
        assert_eq!(catalog.len(), 2);

        let checklist = catalog.get("review-checklist").unwrap();
        assert_eq!(checklist.name, "Review checklist");
        assert_eq!(checklist.description, "What reviewers verify");
        assert!(checklist.body.contains("read diff"));

        let deploy = catalog.get("deploy").unwrap();
        assert_eq!(deploy.description, "Ship a release safely.");
    }

    #[test]
    fn summaries_exclude_bodies() {
        let mut catalog = SkillCatalog::new();
        catalog.insert(Skill {
            id: "x".to_string(),
            name: "X".to_string(),
            description: "does x".to_string(),
            body: "a very long body".to_string(),
        });
        let summaries = catalog.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].description, "does x");
    }

    #[test]
    fn missing_roots_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SkillCatalog::discover(dir.path(), &[PathBuf::from("no-such-dir")]);
        assert!(catalog.is_empty());
    }
}
