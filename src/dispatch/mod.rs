use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{AppError, Result};
use crate::state::StateStore;
use crate::workflow::Phase;

/// Suppresses duplicate deliveries: the same (issue, phase) pair dispatches
/// at most once per window. GitHub redelivers webhooks, and label + open
/// events for one issue can arrive back to back.
pub struct DedupCache {
    window: Duration,
    seen: Mutex<HashMap<(u64, Phase), Instant>>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when this (issue, phase) should be dispatched, recording
    /// it so repeats inside the window are rejected.
    pub fn should_dispatch(&self, issue_number: u64, phase: Phase) -> bool {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.retain(|_, at| now.duration_since(*at) < self.window);

        match seen.get(&(issue_number, phase)) {
            Some(_) => false,
            None => {
                seen.insert((issue_number, phase), now);
                true
            }
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Result of scanning a comment for a `/graft` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// No directive present; the comment is ordinary conversation.
    None,
    /// A `/graft` line that could not be understood.
    Invalid(String),
    Command {
        phase: Phase,
        workflow_id: Option<String>,
    },
}

/// Scan a comment body for `/graft <phase> [workflow_id]`. Only the first
/// directive line counts.
pub fn parse_directive(body: &str) -> Directive {
    for line in body.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("/graft") else {
            continue;
        };
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            // "/graftsomething" is not a directive.
            continue;
        }

        let mut parts = rest.split_whitespace();
        let Some(phase_word) = parts.next() else {
            return Directive::Invalid("Missing phase. Usage: /graft <phase> [workflow_id]".to_string());
        };
        let phase: Phase = match phase_word.parse() {
            Ok(p) => p,
            Err(_) => {
                return Directive::Invalid(format!(
                    "Unknown phase '{phase_word}'. Expected one of: plan, build, test, review, document"
                ));
            }
        };
        let workflow_id = parts.next().map(|s| s.to_string());
        if parts.next().is_some() {
            return Directive::Invalid(
                "Too many arguments. Usage: /graft <phase> [workflow_id]".to_string(),
            );
        }
        return Directive::Command { phase, workflow_id };
    }
    Directive::None
}

/// Spawn a phase as a detached child of this process, logging to the
/// workflow's phase log. The child is its own process group leader, so it
/// survives a server restart, and it is never waited on.
pub fn spawn_phase(
    config_path: Option<&str>,
    store: &StateStore,
    phase: Phase,
    issue_number: u64,
    workflow_id: &str,
    chain: bool,
) -> Result<()> {
    let exe = std::env::current_exe()?;
    let log = store.open_log(workflow_id)?;
    let log_err = log.try_clone()?;

    let mut command = std::process::Command::new(exe);
    command
        .arg("phase")
        .arg(phase.as_str())
        .arg("--issue")
        .arg(issue_number.to_string())
        .arg("--workflow-id")
        .arg(workflow_id)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    if chain {
        command.arg("--chain");
    }
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command.spawn().map_err(|e| {
        AppError::Internal(format!("Failed to spawn phase process: {e}"))
    })?;

    tracing::info!(
        %phase,
        issue_number,
        workflow_id,
        pid = child.id(),
        chain,
        "Dispatched phase process"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_rejects_within_window() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(cache.should_dispatch(42, Phase::Plan));
        assert!(!cache.should_dispatch(42, Phase::Plan));
        // Different phase or issue is independent.
        assert!(cache.should_dispatch(42, Phase::Review));
        assert!(cache.should_dispatch(43, Phase::Plan));
    }

    #[test]
    fn test_dedup_expires_after_window() {
        let cache = DedupCache::new(Duration::from_millis(10));
        assert!(cache.should_dispatch(42, Phase::Plan));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.should_dispatch(42, Phase::Plan));
    }

    #[test]
    fn test_directive_plain_comment() {
        assert_eq!(parse_directive("looks good to me"), Directive::None);
        assert_eq!(parse_directive("/graftXYZ nonsense"), Directive::None);
    }

    #[test]
    fn test_directive_with_phase() {
        assert_eq!(
            parse_directive("/graft plan"),
            Directive::Command {
                phase: Phase::Plan,
                workflow_id: None
            }
        );
    }

    #[test]
    fn test_directive_with_workflow_id() {
        assert_eq!(
            parse_directive("please rerun\n/graft review abc12345\nthanks"),
            Directive::Command {
                phase: Phase::Review,
                workflow_id: Some("abc12345".to_string())
            }
        );
    }

    #[test]
    fn test_directive_invalid_phase() {
        assert!(matches!(
            parse_directive("/graft deploy"),
            Directive::Invalid(_)
        ));
        assert!(matches!(parse_directive("/graft"), Directive::Invalid(_)));
        assert!(matches!(
            parse_directive("/graft plan abc12345 extra"),
            Directive::Invalid(_)
        ));
    }
}
