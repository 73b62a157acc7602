//! AI coding agent capability and the Claude CLI subprocess backend.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ClaudeConfig;
use crate::error::CollaboratorError;

/// Operations the lifecycle needs from the coding agent.
///
/// Every call runs in the project's working directory and returns the
/// agent's log on success.
#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn implement(
        &self,
        task_description: &str,
        project_path: &Path,
    ) -> Result<String, CollaboratorError>;

    /// Ask the agent to make failing tests pass, given the failure summary.
    async fn fix(&self, test_output: &str, project_path: &Path)
    -> Result<String, CollaboratorError>;

    async fn describe_pull_request(
        &self,
        task_description: &str,
        diff_summary: &str,
        project_path: &Path,
    ) -> Result<String, CollaboratorError>;

    /// Verify the agent is reachable; returns its version string.
    async fn check(&self) -> Result<String, CollaboratorError>;
}

/// Runs `claude --print --model <model> <prompt>` per request.
pub struct ClaudeCli {
    cli_path: String,
    model: String,
    timeout: Duration,
}

impl ClaudeCli {
    pub fn new(config: &ClaudeConfig) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_minutes * 60),
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec!["--print".to_string()];
        if !self.model.is_empty() {
            args.push("--model".to_string());
            args.push(self.model.clone());
        }
        args.push(prompt.to_string());
        args
    }

    fn timeout_minutes(&self) -> u64 {
        self.timeout.as_secs().div_ceil(60)
    }

    async fn execute(&self, prompt: &str, project_path: &Path) -> Result<String, CollaboratorError> {
        info!(cwd = %project_path.display(), "running coding agent");
        debug!(cli = %self.cli_path, model = %self.model, prompt_len = prompt.len());

        let child = Command::new(&self.cli_path)
            .args(self.args(prompt))
            .current_dir(project_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CollaboratorError::AgentFailure(format!("failed to start {}: {e}", self.cli_path))
            })?;

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| CollaboratorError::AgentFailure(e.to_string()))?,
            Err(_) => {
                warn!(minutes = self.timeout_minutes(), "coding agent timed out");
                return Err(CollaboratorError::AgentTimeout(self.timeout_minutes()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(CollaboratorError::AgentFailure(format!(
                "exit {}: {detail}",
                output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string())
            )))
        }
    }
}

fn implement_prompt(task_description: &str) -> String {
    format!(
        "Please implement the following task:\n\n\
         {task_description}\n\n\
         Requirements:\n\
         - Write clean, maintainable code\n\
         - Follow existing project patterns and conventions\n\
         - Add appropriate error handling\n\
         - Include comments where necessary\n\n\
         Please implement this task now."
    )
}

fn fix_prompt(test_output: &str) -> String {
    format!(
        "The tests are failing with the following errors:\n\n\
         ```\n{test_output}\n```\n\n\
         Please analyze the error and fix the code to make the tests pass.\n\
         Focus on:\n\
         1. Understanding what the test expects\n\
         2. Finding the root cause of the failure\n\
         3. Fixing the implementation (not the test, unless the test is clearly wrong)\n\n\
         Fix the issues now."
    )
}

fn pull_request_prompt(task_description: &str, diff_summary: &str) -> String {
    format!(
        "Generate a concise pull request description for the following:\n\n\
         Task: {task_description}\n\n\
         Changes made:\n{diff_summary}\n\n\
         Format the description with:\n\
         - Brief summary (1-2 sentences)\n\
         - List of key changes\n\
         - Any important notes for reviewers\n\n\
         Output only the PR description, no extra commentary."
    )
}

#[async_trait]
impl CodingAgent for ClaudeCli {
    async fn implement(
        &self,
        task_description: &str,
        project_path: &Path,
    ) -> Result<String, CollaboratorError> {
        self.execute(&implement_prompt(task_description), project_path)
            .await
    }

    async fn fix(
        &self,
        test_output: &str,
        project_path: &Path,
    ) -> Result<String, CollaboratorError> {
        self.execute(&fix_prompt(test_output), project_path).await
    }

    async fn describe_pull_request(
        &self,
        task_description: &str,
        diff_summary: &str,
        project_path: &Path,
    ) -> Result<String, CollaboratorError> {
        let text = self
            .execute(
                &pull_request_prompt(task_description, diff_summary),
                project_path,
            )
            .await?;
        Ok(text.trim().to_string())
    }

    async fn check(&self) -> Result<String, CollaboratorError> {
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new(&self.cli_path)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| CollaboratorError::AgentTimeout(1))?
        .map_err(|e| CollaboratorError::AgentFailure(format!("{}: {e}", self.cli_path)))?;

        if result.status.success() {
            Ok(String::from_utf8_lossy(&result.stdout).trim().to_string())
        } else {
            Err(CollaboratorError::AgentFailure(format!(
                "{} --version exited with {}",
                self.cli_path, result.status
            )))
        }
    }
}
