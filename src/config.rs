use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{AppError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    pub agent: AgentConfig,
    pub storage: StorageConfig,
    pub worktree: WorktreeConfig,
    pub review: ReviewConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Deserialize, Clone)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    pub token: String,
    pub webhook_secret: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_bot_marker")]
    pub bot_marker: String,
    /// Timeout for network git operations (fetch/push).
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

// Manual Debug impl to avoid leaking credentials
impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("token", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .field("base_branch", &self.base_branch)
            .field("bot_marker", &self.bot_marker)
            .field("network_timeout_secs", &self.network_timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default = "default_model_base")]
    pub model_base: String,
    #[serde(default = "default_model_heavy")]
    pub model_heavy: String,
    /// Timeout for a single agent invocation.
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Per-workflow state, logs, and artifacts live under this directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorktreeConfig {
    /// Root of the git clone the orchestrator operates on.
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,
    /// Worktrees are registered under this directory, one per workflow.
    #[serde(default = "default_trees_dir")]
    pub trees_dir: PathBuf,
    #[serde(default = "default_backend_port_base")]
    pub backend_port_base: u16,
    #[serde(default = "default_frontend_port_base")]
    pub frontend_port_base: u16,
    /// Number of port pairs available for concurrent workflows.
    #[serde(default = "default_port_range")]
    pub port_range: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReviewConfig {
    #[serde(default = "default_true")]
    pub auto_merge: bool,
    #[serde(default = "default_true")]
    pub auto_reimplement: bool,
    #[serde(default = "default_merge_method")]
    pub merge_method: String,
    #[serde(default = "default_max_attempts")]
    pub max_reimplement_attempts: u32,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_bot_marker() -> String {
    "[graft-bot]".to_string()
}

fn default_network_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["-p".to_string(), "--dangerously-skip-permissions".to_string()]
}

fn default_model_base() -> String {
    "sonnet".to_string()
}

fn default_model_heavy() -> String {
    "opus".to_string()
}

fn default_agent_timeout() -> u64 {
    1800
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".graft")
}

fn default_repo_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_trees_dir() -> PathBuf {
    PathBuf::from("trees")
}

fn default_backend_port_base() -> u16 {
    9100
}

fn default_frontend_port_base() -> u16 {
    9200
}

fn default_port_range() -> u16 {
    15
}

fn default_merge_method() -> String {
    "squash".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            // Try default paths
            builder = builder.add_source(config::File::with_name("graft").required(false));
        }

        // Environment variable overrides with GRAFT_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("GRAFT")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let config: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.github.webhook_secret.trim().is_empty() {
            return Err(AppError::Config(
                "github.webhook_secret must be set".to_string(),
            ));
        }
        if self.github.token.trim().is_empty() {
            return Err(AppError::Config("github.token must be set".to_string()));
        }
        if self.worktree.port_range == 0 {
            return Err(AppError::Config(
                "worktree.port_range must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn webhook_secret(&self) -> &str {
        &self.github.webhook_secret
    }

    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.github.owner, self.github.repo)
    }
}
