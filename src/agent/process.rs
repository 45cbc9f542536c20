use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::AgentConfig;
use crate::error::{AppError, Result};
use crate::state::ModelTier;

use super::{AgentInvoker, AgentResponse, AgentTask};

/// Invokes the coding agent as a subprocess, feeding the prompt on stdin
/// and collecting stdout. The agent runs inside the workflow's worktree so
/// every file it touches stays in that workspace.
pub struct ProcessInvoker {
    config: AgentConfig,
}

impl ProcessInvoker {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Base => &self.config.model_base,
            ModelTier::Heavy => &self.config.model_heavy,
        }
    }
}

#[async_trait]
impl AgentInvoker for ProcessInvoker {
    async fn invoke(&self, task: &AgentTask, working_dir: &Path) -> Result<AgentResponse> {
        let model = self.model_for(task.model_tier);
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(
            task = %task.name,
            model,
            session_id = %session_id,
            working_dir = %working_dir.display(),
            "Invoking agent"
        );

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .arg("--model")
            .arg(model)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| AppError::Agent(format!("Failed to spawn {}: {e}", self.config.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(task.prompt.as_bytes()).await?;
            drop(stdin);
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped.
                return Err(AppError::Agent(format!(
                    "Agent task '{}' timed out after {}s",
                    task.name, self.config.timeout_secs
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let success = output.status.success();

        if !success {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                task = %task.name,
                session_id = %session_id,
                exit_code = ?output.status.code(),
                stderr = %stderr.trim(),
                "Agent exited with failure"
            );
        } else {
            tracing::info!(task = %task.name, output_bytes = stdout.len(), "Agent completed");
        }

        Ok(AgentResponse {
            success,
            output: stdout,
            session_id: Some(session_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoker(command: &str, args: Vec<String>, timeout_secs: u64) -> ProcessInvoker {
        ProcessInvoker::new(AgentConfig {
            command: command.to_string(),
            args,
            model_base: "sonnet".to_string(),
            model_heavy: "opus".to_string(),
            timeout_secs,
        })
    }

    #[tokio::test]
    async fn test_invoke_captures_stdout() {
        // The script echoes the prompt back; the appended --model flag
        // lands in the script's positional args and is ignored.
        let invoker = invoker("sh", vec!["-c".to_string(), "cat".to_string()], 10);
        let task = AgentTask::new("echo", "hello agent".to_string(), ModelTier::Base);
        let tmp = tempfile::tempdir().unwrap();

        let response = invoker.invoke(&task, tmp.path()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.output, "hello agent");
        assert!(response.session_id.is_some());
    }

    #[tokio::test]
    async fn test_invoke_reports_failure_exit() {
        let invoker = invoker("false", vec![], 10);
        let task = AgentTask::new("fail", String::new(), ModelTier::Base);
        let tmp = tempfile::tempdir().unwrap();

        let response = invoker.invoke(&task, tmp.path()).await.unwrap();
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let invoker = invoker("sh", vec!["-c".to_string(), "sleep 30".to_string()], 1);
        let task = AgentTask::new("slow", String::new(), ModelTier::Base);
        let tmp = tempfile::tempdir().unwrap();

        let err = invoker.invoke(&task, tmp.path()).await.unwrap_err();
        assert!(matches!(err, AppError::Agent(_)));
    }

    #[tokio::test]
    async fn test_missing_command_is_agent_error() {
        let invoker = invoker("definitely-not-a-real-binary-xyz", vec![], 5);
        let task = AgentTask::new("spawn", String::new(), ModelTier::Base);
        let tmp = tempfile::tempdir().unwrap();

        let err = invoker.invoke(&task, tmp.path()).await.unwrap_err();
        assert!(matches!(err, AppError::Agent(_)));
    }

    #[tokio::test]
    async fn test_heavy_tier_selects_heavy_model() {
        let invoker = invoker("cat", vec![], 10);
        assert_eq!(invoker.model_for(ModelTier::Heavy), "opus");
        assert_eq!(invoker.model_for(ModelTier::Base), "sonnet");
    }
}
