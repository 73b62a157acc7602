use thiserror::Error;

use crate::state_machine::TaskState;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Task for {0} is already queued or running")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("No configured project matches issue {0}")]
    NoMatchingProject(String),

    #[error("Tracker backend '{0}' is not configured")]
    TrackerNotConfigured(String),

    #[error("Invalid issue key '{0}'")]
    InvalidIssueKey(String),

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure signals reported by external collaborators.
///
/// TaskRunner turns every one of these into a state transition plus a
/// recorded `last_error`; they never leave the runner as errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("tracker unavailable: {0}")]
    TrackerUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("agent timed out after {0} minutes")]
    AgentTimeout(u64),

    #[error("agent failed: {0}")]
    AgentFailure(String),

    #[error("test execution error: {0}")]
    ExecutionError(String),

    #[error("git host unavailable: {0}")]
    GitHostUnavailable(String),

    #[error("authentication rejected: {0}")]
    AuthError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_display() {
        let err = OrchestratorError::InvalidTransition {
            from: TaskState::Pending,
            to: TaskState::Completed,
        };
        assert_eq!(err.to_string(), "Invalid transition PENDING -> COMPLETED");
    }

    #[test]
    fn collaborator_error_display() {
        assert_eq!(
            CollaboratorError::AgentTimeout(30).to_string(),
            "agent timed out after 30 minutes"
        );
        assert_eq!(
            CollaboratorError::NotFound("DEV-1".into()).to_string(),
            "not found: DEV-1"
        );
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OrchestratorError>();
        assert_send_sync::<CollaboratorError>();
    }
}
