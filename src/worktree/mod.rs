pub mod ports;

use std::path::PathBuf;
use std::time::Duration;

use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};

use crate::config::{GitHubConfig, WorktreeConfig};
use crate::error::{AppError, Result};
use crate::scm;
use crate::state::WorkflowState;

use ports::PortAllocator;

/// An isolated, branch-checked-out workspace for one workflow.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub backend_port: u16,
    pub frontend_port: u16,
}

/// Manages git worktrees: one per workflow_id, each branched from the
/// freshly fetched remote base and paired with reserved ports.
pub struct WorktreeManager {
    repo_root: PathBuf,
    trees_dir: PathBuf,
    ports: PortAllocator,
    network_timeout: Duration,
}

impl WorktreeManager {
    pub fn new(worktree: &WorktreeConfig, github: &GitHubConfig) -> Self {
        let trees_dir = if worktree.trees_dir.is_absolute() {
            worktree.trees_dir.clone()
        } else {
            worktree.repo_root.join(&worktree.trees_dir)
        };
        Self {
            repo_root: worktree.repo_root.clone(),
            trees_dir,
            ports: PortAllocator::new(worktree),
            network_timeout: Duration::from_secs(github.network_timeout_secs),
        }
    }

    pub fn worktree_path(&self, workflow_id: &str) -> PathBuf {
        self.trees_dir.join(workflow_id)
    }

    /// Create the worktree for a workflow: fetch the base branch from
    /// origin, branch from the fetched tip (never a stale local ref), and
    /// register the worktree. Writes `.ports.env` with the allocated pair.
    pub async fn create(
        &self,
        workflow_id: &str,
        branch: &str,
        base_branch: &str,
        token: &str,
    ) -> Result<Worktree> {
        scm::git::validate_branch_name(branch)?;
        scm::with_retries("fetch_base", 3, || {
            scm::git::fetch_branch(&self.repo_root, base_branch, token, self.network_timeout)
        })
        .await?;

        let (backend_port, frontend_port) = self.ports.allocate(workflow_id)?;
        let path = self.worktree_path(workflow_id);

        if path.exists() {
            return Err(AppError::Worktree(format!(
                "Worktree path already exists: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let repo_root = self.repo_root.clone();
        let workflow_id_owned = workflow_id.to_string();
        let branch_owned = branch.to_string();
        let base_owned = base_branch.to_string();
        let path_owned = path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = Repository::open(&repo_root)?;

            let remote_ref =
                repo.find_reference(&format!("refs/remotes/origin/{base_owned}"))?;
            let base_commit = remote_ref.peel_to_commit()?;

            // Reuse the branch if a previous attempt already created it.
            let branch_ref = match repo.find_branch(&branch_owned, BranchType::Local) {
                Ok(existing) => existing.into_reference(),
                Err(_) => repo.branch(&branch_owned, &base_commit, false)?.into_reference(),
            };

            let mut opts = WorktreeAddOptions::new();
            opts.reference(Some(&branch_ref));
            repo.worktree(&workflow_id_owned, &path_owned, Some(&opts))?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Worktree(format!("Worktree task panicked: {e}")))??;

        std::fs::write(
            path.join(".ports.env"),
            format!("BACKEND_PORT={backend_port}\nFRONTEND_PORT={frontend_port}\n"),
        )?;

        tracing::info!(
            workflow_id,
            branch,
            path = %path.display(),
            backend_port,
            frontend_port,
            "Worktree created"
        );

        Ok(Worktree {
            path,
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
            backend_port,
            frontend_port,
        })
    }

    /// Three-way validation: state claims a path, the path exists on disk,
    /// and git registers a worktree of the claimed branch at that path.
    /// Any disagreement stops the workflow instead of letting a phase run
    /// against the wrong location.
    pub async fn validate(&self, state: &WorkflowState) -> Result<()> {
        let claimed = state.worktree_path.clone().ok_or_else(|| {
            AppError::Validation("State does not have a worktree path set".to_string())
        })?;

        if !claimed.exists() {
            return Err(AppError::Validation(format!(
                "Worktree directory does not exist: {}",
                claimed.display()
            )));
        }

        let branch = state.branch_name.clone().ok_or_else(|| {
            AppError::Validation("State does not have a branch name set".to_string())
        })?;

        let repo_root = self.repo_root.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = Repository::open(&repo_root)?;
            let claimed_canonical = claimed
                .canonicalize()
                .map_err(|e| AppError::Validation(format!("Cannot resolve worktree path: {e}")))?;

            for name in repo.worktrees()?.iter().flatten() {
                let worktree = repo.find_worktree(name)?;
                let registered = match worktree.path().canonicalize() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if registered != claimed_canonical {
                    continue;
                }

                let checkout = Repository::open(worktree.path())?;
                let head = checkout.head()?;
                return if head.shorthand() == Some(branch.as_str()) {
                    Ok(())
                } else {
                    Err(AppError::Validation(format!(
                        "Worktree at {} has branch {:?}, state claims {}",
                        claimed_canonical.display(),
                        head.shorthand(),
                        branch
                    )))
                };
            }

            Err(AppError::Validation(format!(
                "Path is not a registered worktree: {}",
                claimed_canonical.display()
            )))
        })
        .await
        .map_err(|e| AppError::Worktree(format!("Validate task panicked: {e}")))?
    }

    /// Force-remove the worktree and its branch. Idempotent: a missing
    /// worktree or branch is a no-op.
    pub async fn remove(&self, workflow_id: &str, branch: Option<&str>) -> Result<()> {
        let repo_root = self.repo_root.clone();
        let workflow_id_owned = workflow_id.to_string();
        let branch_owned = branch.map(|b| b.to_string());
        let path = self.worktree_path(workflow_id);

        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = Repository::open(&repo_root)?;

            if let Ok(worktree) = repo.find_worktree(&workflow_id_owned) {
                let mut opts = WorktreePruneOptions::new();
                opts.valid(true).locked(true).working_tree(true);
                if let Err(e) = worktree.prune(Some(&mut opts)) {
                    tracing::warn!(
                        workflow_id = %workflow_id_owned,
                        error = %e.message(),
                        "Worktree prune failed"
                    );
                }
            }

            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }

            if let Some(branch_name) = branch_owned {
                if let Ok(mut local) = repo.find_branch(&branch_name, BranchType::Local) {
                    if let Err(e) = local.delete() {
                        tracing::warn!(
                            branch = %branch_name,
                            error = %e.message(),
                            "Branch delete failed"
                        );
                    }
                }
            }

            Ok(())
        })
        .await
        .map_err(|e| AppError::Worktree(format!("Remove task panicked: {e}")))?
    }
}
