use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook verification failed: {0}")]
    SignatureVerification(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transient operation failed: {0}")]
    Transient(String),

    #[error("Agent invocation failed: {0}")]
    Agent(String),

    #[error("GitHub API error: {0}")]
    GitHubApi(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Worktree error: {0}")]
    Worktree(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<octocrab::Error> for AppError {
    fn from(e: octocrab::Error) -> Self {
        let msg = e.to_string();
        // Rate limiting and upstream 5xx are worth retrying.
        if msg.contains("rate limit") || msg.contains("502") || msg.contains("503") {
            AppError::Transient(msg)
        } else {
            AppError::GitHubApi(msg)
        }
    }
}

impl From<git2::Error> for AppError {
    fn from(e: git2::Error) -> Self {
        AppError::Git(e.message().to_string())
    }
}

impl AppError {
    /// Whether a bounded retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
