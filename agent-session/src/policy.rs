//! Command policy applied before text reaches a terminal.
//!
//! Destructive patterns are denied regardless of wrapper, and every
//! path-like token must stay inside the session's working directory. A
//! command with path tokens but no resolvable working directory is rejected
//! outright: the policy fails closed.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

static VAR_INTERP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{[A-Za-z_][A-Za-z0-9_]*\}|\$[A-Za-z_][A-Za-z0-9_]*|%[A-Za-z_][A-Za-z0-9_]*%").unwrap());
static ENV_ASSIGN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").unwrap());

/// Wrapper commands stripped before inspection so `sudo rm -rf /` is seen
/// as `rm -rf /`.
const WRAPPERS: &[&str] = &["sudo", "env", "command", "nohup"];

/// A denied command, with the rule and the offending token for the audit
/// log and the structured HTTP error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub rule: String,
    pub token: String,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command policy [{}]: {}", self.rule, self.token)
    }
}

impl std::error::Error for PolicyViolation {}

/// Stateless command inspector.
pub struct CommandPolicy;

impl CommandPolicy {
    /// Inspect `command` against the deny rules and the working-directory
    /// scope. Violations are audited and returned; the command must never
    /// reach the terminal.
    pub fn check(command: &str, work_dir: Option<&Path>) -> Result<(), PolicyViolation> {
        let result = Self::inspect(command, work_dir);
        if let Err(v) = &result {
            warn!(rule = %v.rule, token = %v.token, command, "command denied by policy");
        }
        result
    }

    fn inspect(command: &str, work_dir: Option<&Path>) -> Result<(), PolicyViolation> {
        let tokens = tokenize(command);
        let body = strip_wrappers(&tokens);
        if body.is_empty() {
            return Ok(());
        }

        if is_recursive_delete(&body) {
            for target in delete_targets(&body) {
                if VAR_INTERP.is_match(&target.raw) {
                    return Err(violation("variable_interpolated_path", &target.raw));
                }
                if Path::new(&target.unquoted).is_absolute() {
                    return Err(violation("recursive_delete_absolute", &target.raw));
                }
            }
        }

        for tok in &body {
            let unquoted = unquote(tok);
            if !unquoted.contains('/') {
                continue;
            }
            if VAR_INTERP.is_match(tok) {
                return Err(violation("variable_interpolated_path", tok));
            }
            let Some(root) = work_dir else {
                return Err(violation("unresolved_workdir", tok));
            };
            let candidate = if Path::new(&unquoted).is_absolute() {
                PathBuf::from(&unquoted)
            } else {
                root.join(&unquoted)
            };
            if !lexically_contains(root, &candidate) {
                return Err(violation("path_outside_workdir", tok));
            }
        }

        Ok(())
    }
}

fn violation(rule: &str, token: &str) -> PolicyViolation {
    PolicyViolation {
        rule: rule.to_string(),
        token: token.to_string(),
    }
}

/// Shell-aware tokenizer: honors single and double quotes, keeps the raw
/// token text for reporting.
fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    current.push(ch);
                    quote = Some(ch);
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(token: &str) -> String {
    let t = token.trim();
    if t.len() >= 2 {
        let bytes = t.as_bytes();
        if (bytes[0] == b'\'' && bytes[t.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[t.len() - 1] == b'"')
        {
            return t[1..t.len() - 1].to_string();
        }
    }
    t.to_string()
}

/// Drop wrapper prefixes (`sudo`, `nohup`, ...) and `env` style VAR=val
/// assignments so the real program is inspected.
fn strip_wrappers(tokens: &[String]) -> Vec<String> {
    let mut rest = tokens;
    loop {
        match rest.first() {
            Some(head) if WRAPPERS.contains(&head.as_str()) => {
                rest = &rest[1..];
                // env may carry assignments before the program.
                while rest
                    .first()
                    .is_some_and(|t| ENV_ASSIGN.is_match(t))
                {
                    rest = &rest[1..];
                }
            }
            _ => break,
        }
    }
    rest.to_vec()
}

fn is_recursive_delete(body: &[String]) -> bool {
    if body.first().map(String::as_str) != Some("rm") {
        return false;
    }
    body.iter().skip(1).any(|t| {
        t == "--recursive"
            || (t.starts_with('-') && !t.starts_with("--") && t.contains('r'))
            || (t.starts_with('-') && !t.starts_with("--") && t.contains('R'))
    })
}

struct DeleteTarget {
    raw: String,
    unquoted: String,
}

fn delete_targets(body: &[String]) -> Vec<DeleteTarget> {
    body.iter()
        .skip(1)
        .filter(|t| !t.starts_with('-'))
        .map(|t| DeleteTarget {
            raw: t.clone(),
            unquoted: unquote(t),
        })
        .collect()
}

/// Lexical containment: normalize `.` and `..` without touching the
/// filesystem, then require `candidate` to stay under `root`.
fn lexically_contains(root: &Path, candidate: &Path) -> bool {
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

    fn wd() -> PathBuf {
        PathBuf::from("/repo/.worktrees/task-1")
    }

    #[test]
    fn plain_rm_inside_workdir_is_allowed() {
        assert!(CommandPolicy::check("rm file.txt", Some(&wd())).is_ok());
    }

    #[test]
    fn recursive_absolute_delete_is_denied() {
        let err = CommandPolicy::check("rm -rf /tmp/danger", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "recursive_delete_absolute");
    }

    #[test]
    fn quoting_does_not_evade_the_rule() {
        let err = CommandPolicy::check("rm -rf '/tmp/danger'", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "recursive_delete_absolute");
        let err = CommandPolicy::check("rm -rf \"/tmp/danger\"", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "recursive_delete_absolute");
    }

    #[test]
    fn wrappers_are_stripped_before_inspection() {
        let err = CommandPolicy::check("sudo rm -rf /abs", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "recursive_delete_absolute");
        let err = CommandPolicy::check("env RUST_LOG=debug rm -rf /abs", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "recursive_delete_absolute");
        let err = CommandPolicy::check("nohup sudo rm -rf /abs", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "recursive_delete_absolute");
    }

    #[test]
    fn variable_interpolated_delete_target_is_denied() {
        let err = CommandPolicy::check("rm -rf \"$HOME\"", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "variable_interpolated_path");
        let err = CommandPolicy::check("rm -r ${TARGET}", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "variable_interpolated_path");
    }

    #[test]
    fn paths_must_stay_inside_the_workdir() {
        assert!(CommandPolicy::check("cat src/main.rs", Some(&wd())).is_ok());
        let err = CommandPolicy::check("cat /etc/passwd", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "path_outside_workdir");
        let err = CommandPolicy::check("cat ../../escape.txt", Some(&wd())).unwrap_err();
        assert_eq!(err.rule, "path_outside_workdir");
    }

    #[test]
    fn missing_workdir_fails_closed() {
        let err = CommandPolicy::check("cat src/main.rs", None).unwrap_err();
        assert_eq!(err.rule, "unresolved_workdir");
        // Commands without path tokens are still fine.
        assert!(CommandPolicy::check("git status", None).is_ok());
    }

    #[test]
    fn non_recursive_rm_of_relative_file_is_fine() {
        assert!(CommandPolicy::check("rm -f notes.txt", Some(&wd())).is_ok());
    }
}
