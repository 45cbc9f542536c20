pub mod ops;
pub mod phases;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentInvoker, ProcessInvoker};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::scm::github::GitHubClient;
use crate::state::{AttemptStore, StateStore};
use crate::worktree::WorktreeManager;

/// A phase of the workflow cycle. Each phase runs as its own OS process
/// and records its outcome in the workflow's state file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Plan,
    Build,
    Test,
    Review,
    Document,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Build => "build",
            Phase::Test => "test",
            Phase::Review => "review",
            Phase::Document => "document",
        }
    }

    /// The phase that follows this one in an auto-chained cycle. Review
    /// dispatches its own successors based on the verdict, and document
    /// is terminal.
    pub fn next_in_chain(&self) -> Option<Phase> {
        match self {
            Phase::Plan => Some(Phase::Build),
            Phase::Build => Some(Phase::Test),
            Phase::Test => Some(Phase::Review),
            Phase::Review | Phase::Document => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plan" => Ok(Phase::Plan),
            "build" => Ok(Phase::Build),
            "test" => Ok(Phase::Test),
            "review" => Ok(Phase::Review),
            "document" => Ok(Phase::Document),
            other => Err(AppError::Validation(format!("Unknown phase: {other}"))),
        }
    }
}

/// Shared handles a phase process needs: configuration, stores, the
/// GitHub client, the worktree manager, and the agent backend.
pub struct WorkflowContext {
    pub config: AppConfig,
    /// Path of the config file this process was started with, passed
    /// through to chained phase processes.
    pub config_path: Option<String>,
    pub store: StateStore,
    pub attempts: AttemptStore,
    pub github: GitHubClient,
    pub worktrees: WorktreeManager,
    pub invoker: Arc<dyn AgentInvoker>,
}

impl WorkflowContext {
    pub fn new(config: AppConfig, config_path: Option<String>) -> Result<Self> {
        let store = StateStore::new(config.storage.data_dir.clone());
        let attempts = AttemptStore::new(store.attempts_path());
        let github = GitHubClient::new(&config.github)?;
        let worktrees = WorktreeManager::new(&config.worktree, &config.github);
        let invoker: Arc<dyn AgentInvoker> = Arc::new(ProcessInvoker::new(config.agent.clone()));

        Ok(Self {
            config,
            config_path,
            store,
            attempts,
            github,
            worktrees,
            invoker,
        })
    }
}

/// Entry point for the `phase` subcommand: run one phase of one workflow.
pub async fn run_phase(
    ctx: &WorkflowContext,
    phase: Phase,
    issue_number: u64,
    workflow_id: Option<String>,
    chain: bool,
) -> Result<()> {
    let workflow_id = match (phase, workflow_id) {
        (_, Some(id)) => id,
        (Phase::Plan, None) => crate::state::new_workflow_id(),
        (other, None) => {
            return Err(AppError::Validation(format!(
                "Phase '{other}' requires an existing workflow id"
            )));
        }
    };

    tracing::info!(%phase, %workflow_id, issue_number, chain, "Starting phase");

    match phase {
        Phase::Plan => phases::run_plan(ctx, &workflow_id, issue_number, chain).await,
        Phase::Build => phases::run_build(ctx, &workflow_id, issue_number, chain).await,
        Phase::Test => phases::run_test(ctx, &workflow_id, issue_number, chain).await,
        Phase::Review => phases::run_review(ctx, &workflow_id, issue_number).await,
        Phase::Document => phases::run_document(ctx, &workflow_id, issue_number).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trips_through_str() {
        for phase in [
            Phase::Plan,
            Phase::Build,
            Phase::Test,
            Phase::Review,
            Phase::Document,
        ] {
            let parsed: Phase = phase.as_str().parse().unwrap();
            assert_eq!(parsed, phase);
        }
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_chain_order() {
        assert_eq!(Phase::Plan.next_in_chain(), Some(Phase::Build));
        assert_eq!(Phase::Build.next_in_chain(), Some(Phase::Test));
        assert_eq!(Phase::Test.next_in_chain(), Some(Phase::Review));
        assert_eq!(Phase::Review.next_in_chain(), None);
        assert_eq!(Phase::Document.next_in_chain(), None);
    }
}
