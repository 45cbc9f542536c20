pub mod attempts;

pub use attempts::AttemptStore;

use std::fs::OpenOptions;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::workflow::Phase;

/// Mint a new opaque workflow identifier (8 hex chars, matching branch and
/// directory naming).
pub fn new_workflow_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueClass {
    Chore,
    Bug,
    Feature,
}

impl std::fmt::Display for IssueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueClass::Chore => write!(f, "chore"),
            IssueClass::Bug => write!(f, "bug"),
            IssueClass::Feature => write!(f, "feature"),
        }
    }
}

/// Which model the agent runs with. Reimplementation cycles escalate to
/// the heavy tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    #[default]
    Base,
    Heavy,
}

/// One entry in the phase audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Session id of the agent invocation that produced this result, if
    /// the phase ran an agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Persistent record for one workflow run. Created by the plan phase,
/// updated after every subsequent phase, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    #[serde(default)]
    pub issue_number: Option<u64>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub plan_file: Option<String>,
    #[serde(default)]
    pub issue_class: Option<IssueClass>,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub backend_port: Option<u16>,
    #[serde(default)]
    pub frontend_port: Option<u16>,
    #[serde(default)]
    pub model_tier: ModelTier,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow_id: &str) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.to_string(),
            issue_number: None,
            branch_name: None,
            plan_file: None,
            issue_class: None,
            worktree_path: None,
            backend_port: None,
            frontend_port: None,
            model_tier: ModelTier::Base,
            phases: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_phase(
        &mut self,
        phase: Phase,
        success: bool,
        detail: Option<String>,
        agent_session_id: Option<String>,
    ) {
        self.phases.push(PhaseRecord {
            phase,
            success,
            detail,
            agent_session_id,
            at: Utc::now(),
        });
    }
}

/// Exclusive advisory lock for a workflow: at most one live phase per id.
/// Released when dropped.
#[derive(Debug)]
pub struct PhaseLock {
    _file: std::fs::File,
}

/// File-backed store: one JSON document per workflow_id under
/// `<data_dir>/<workflow_id>/`, which also holds logs and artifacts.
#[derive(Clone)]
pub struct StateStore {
    data_dir: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn workflow_dir(&self, workflow_id: &str) -> PathBuf {
        self.data_dir.join(workflow_id)
    }

    pub fn state_path(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("state.json")
    }

    pub fn log_path(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("phase.log")
    }

    /// Reimplementation feedback handed to a freshly minted workflow.
    pub fn feedback_path(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("feedback.md")
    }

    pub fn attempts_path(&self) -> PathBuf {
        self.data_dir.join("attempts.json")
    }

    /// Load existing state or return a fresh default. A missing or corrupt
    /// file is treated as absent, never fatal.
    pub fn load(&self, workflow_id: &str) -> WorkflowState {
        let path = self.state_path(workflow_id);
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<WorkflowState>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(
                        workflow_id,
                        path = %path.display(),
                        error = %e,
                        "Corrupt state file, starting fresh"
                    );
                    WorkflowState::new(workflow_id)
                }
            },
            Err(_) => WorkflowState::new(workflow_id),
        }
    }

    /// Atomically persist state: write a temp file in the same directory,
    /// then rename, so concurrent readers never observe a partial file.
    pub fn save(&self, state: &mut WorkflowState) -> Result<()> {
        Self::validate(state)?;
        state.updated_at = Utc::now();

        let dir = self.workflow_dir(&state.workflow_id);
        std::fs::create_dir_all(&dir)?;

        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&tmp, state)?;
        tmp.persist(self.state_path(&state.workflow_id))
            .map_err(|e| AppError::State(format!("Failed to persist state file: {e}")))?;

        Ok(())
    }

    fn validate(state: &WorkflowState) -> Result<()> {
        if state.workflow_id.is_empty() {
            return Err(AppError::Validation("workflow_id is required".to_string()));
        }
        if state.issue_number.is_none() {
            return Err(AppError::Validation(
                "issue_number is required before state can be persisted".to_string(),
            ));
        }
        Ok(())
    }

    /// Take the exclusive phase lock for a workflow. A held lock means
    /// another phase process is live for this id; the caller must abort
    /// rather than race it.
    pub fn lock_phase(&self, workflow_id: &str) -> Result<PhaseLock> {
        let dir = self.workflow_dir(workflow_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("phase.lock");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| {
            AppError::Validation(format!(
                "Another phase is already running for workflow {workflow_id}"
            ))
        })?;

        Ok(PhaseLock { _file: file })
    }

    /// Append a line to the per-workflow log file, used for spawned phase
    /// process output.
    pub fn open_log(&self, workflow_id: &str) -> Result<std::fs::File> {
        let dir = self.workflow_dir(workflow_id);
        std::fs::create_dir_all(&dir)?;
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(workflow_id))?)
    }

    /// Read reimplementation feedback if a prior review cycle left any.
    pub fn read_feedback(&self, workflow_id: &str) -> Option<String> {
        std::fs::read_to_string(self.feedback_path(workflow_id)).ok()
    }

    pub fn write_feedback(&self, workflow_id: &str, feedback: &str) -> Result<()> {
        let dir = self.workflow_dir(workflow_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(self.feedback_path(workflow_id), feedback)?;
        Ok(())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        (tmp, store)
    }

    #[test]
    fn test_load_missing_returns_fresh_default() {
        let (_tmp, store) = store();
        let state = store.load("abc12345");
        assert_eq!(state.workflow_id, "abc12345");
        assert!(state.issue_number.is_none());
        assert!(state.phases.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_tmp, store) = store();
        let mut state = store.load("abc12345");
        state.issue_number = Some(100);
        state.branch_name = Some("graft/bug-100-abc12345".to_string());
        state.record_phase(
            Phase::Plan,
            true,
            Some("specs/plan.md".to_string()),
            Some("0f9a3c1d".to_string()),
        );
        store.save(&mut state).unwrap();

        let loaded = store.load("abc12345");
        assert_eq!(loaded.issue_number, Some(100));
        assert_eq!(loaded.branch_name.as_deref(), Some("graft/bug-100-abc12345"));
        assert_eq!(loaded.phases.len(), 1);
        assert_eq!(loaded.phases[0].phase, Phase::Plan);
        assert!(loaded.phases[0].success);
        assert_eq!(loaded.phases[0].agent_session_id.as_deref(), Some("0f9a3c1d"));
    }

    #[test]
    fn test_corrupt_state_treated_as_absent() {
        let (_tmp, store) = store();
        let dir = store.workflow_dir("bad00001");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(store.state_path("bad00001"), b"{ not json").unwrap();

        let state = store.load("bad00001");
        assert_eq!(state.workflow_id, "bad00001");
        assert!(state.issue_number.is_none());
    }

    #[test]
    fn test_save_requires_issue_number() {
        let (_tmp, store) = store();
        let mut state = WorkflowState::new("abc12345");
        let err = store.save(&mut state).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_save_leaves_no_partial_file() {
        let (_tmp, store) = store();
        let mut state = WorkflowState::new("abc12345");
        state.issue_number = Some(7);
        store.save(&mut state).unwrap();

        // Only the final state file remains; the temp file was renamed away.
        let entries: Vec<_> = std::fs::read_dir(store.workflow_dir("abc12345"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);

        // And the persisted file parses.
        let loaded = store.load("abc12345");
        assert_eq!(loaded.issue_number, Some(7));
    }

    #[test]
    fn test_phase_lock_excludes_second_holder() {
        let (_tmp, store) = store();
        let guard = store.lock_phase("abc12345").unwrap();
        let err = store.lock_phase("abc12345").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        drop(guard);
        assert!(store.lock_phase("abc12345").is_ok());
    }

    #[test]
    fn test_new_workflow_id_shape() {
        let id = new_workflow_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_workflow_id());
    }

    #[test]
    fn test_feedback_round_trip() {
        let (_tmp, store) = store();
        assert!(store.read_feedback("abc12345").is_none());
        store.write_feedback("abc12345", "## Summary\nfix it").unwrap();
        assert_eq!(
            store.read_feedback("abc12345").as_deref(),
            Some("## Summary\nfix it")
        );
    }
}
