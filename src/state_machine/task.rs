use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TaskState;

/// Identifier assigned to a task at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.0.simple().to_string();
        f.write_str(&id[..8])
    }
}

/// One line of a task's audit trail: the state entered, when, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: TaskState,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

/// A single tracker issue moving through the lifecycle.
///
/// Only the `TaskRunner` that owns a task mutates it; everyone else works on
/// [`TaskView`] copies. State, attempt counter and history change exclusively
/// through [`StateMachine`](super::StateMachine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub issue_key: String,
    /// Name of the project configuration this task runs against.
    pub project: String,
    pub summary: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub(super) state: TaskState,
    pub(super) attempt: u32,
    pub(super) max_retries: u32,
    pub(super) history: Vec<HistoryEntry>,
    pub(super) last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, issue_key: String, project: String, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            issue_key,
            project,
            summary: None,
            branch_name: None,
            pr_url: None,
            state: TaskState::Pending,
            attempt: 0,
            max_retries,
            history: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Fix attempts consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Read-only copy for observers.
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id,
            issue_key: self.issue_key.clone(),
            project: self.project.clone(),
            summary: self.summary.clone(),
            state: self.state,
            attempt: self.attempt,
            max_retries: self.max_retries,
            branch_name: self.branch_name.clone(),
            pr_url: self.pr_url.clone(),
            last_error: self.last_error.clone(),
            history: self.history.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Snapshot of a task handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub issue_key: String,
    pub project: String,
    pub summary: Option<String>,
    pub state: TaskState,
    pub attempt: u32,
    pub max_retries: u32,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub last_error: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskView {
    /// Short human-readable status, e.g. `TESTING (attempt 2/3)`.
    pub fn status_line(&self) -> String {
        match self.state {
            TaskState::Testing => format!(
                "{} (attempt {}/{})",
                self.state,
                self.attempt.saturating_add(1),
                self.max_retries.saturating_add(1)
            ),
            TaskState::Fixing => format!(
                "{} (fix {}/{})",
                self.state,
                self.attempt.saturating_add(1),
                self.max_retries
            ),
            state => state.to_string(),
        }
    }
}

/// Audit record persisted once a task reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub issue_key: String,
    pub project: String,
    pub final_state: TaskState,
    pub state_transitions: Vec<TaskState>,
    pub attempts: u32,
    pub max_retries: u32,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl TaskRecord {
    pub fn from_task(task: &Task) -> Self {
        let completed_at = task.finished_at.unwrap_or_else(Utc::now);
        let started_at = task.started_at.unwrap_or(task.created_at);
        let error = task.last_error.clone().or_else(|| {
            task.history
                .iter()
                .rev()
                .find(|entry| entry.state.needs_attention())
                .and_then(|entry| entry.note.clone())
        });

        Self {
            issue_key: task.issue_key.clone(),
            project: task.project.clone(),
            final_state: task.state,
            state_transitions: task.history.iter().map(|entry| entry.state).collect(),
            attempts: task.attempt,
            max_retries: task.max_retries,
            branch_name: task.branch_name.clone(),
            pr_url: task.pr_url.clone(),
            error,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
        }
    }
}
