pub mod process;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::state::ModelTier;

pub use process::ProcessInvoker;

/// One unit of work for the coding agent: a named task with a full prompt.
#[derive(Debug, Clone)]
pub struct AgentTask {
    /// Short name used in logs and prompts ("planner", "reviewer", ...).
    pub name: String,
    pub prompt: String,
    pub model_tier: ModelTier,
}

impl AgentTask {
    pub fn new(name: &str, prompt: String, model_tier: ModelTier) -> Self {
        Self {
            name: name.to_string(),
            prompt,
            model_tier,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub success: bool,
    pub output: String,
    /// Identity of the agent session behind this response, kept in the
    /// workflow's phase audit trail.
    pub session_id: Option<String>,
}

/// Abstraction over the agent backend. Phase logic depends only on this
/// trait; tests substitute scripted invokers instead of spawning processes.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, task: &AgentTask, working_dir: &Path) -> Result<AgentResponse>;
}
