use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::task::{HistoryEntry, Task};
use crate::error::OrchestratorError;

/// Lifecycle states of a task.
///
/// Happy path: PENDING → FETCHING → IMPLEMENTING → TESTING → CREATING_PR
/// → UPDATING_TRACKER → COMPLETED, with a bounded TESTING ⇄ FIXING loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Fetching,
    Implementing,
    Testing,
    Fixing,
    CreatingPr,
    UpdatingTracker,
    Completed,
    MaxRetriesExceeded,
    ManualReview,
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 11] = [
        TaskState::Pending,
        TaskState::Fetching,
        TaskState::Implementing,
        TaskState::Testing,
        TaskState::Fixing,
        TaskState::CreatingPr,
        TaskState::UpdatingTracker,
        TaskState::Completed,
        TaskState::MaxRetriesExceeded,
        TaskState::ManualReview,
        TaskState::Cancelled,
    ];

    /// No automatic transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::ManualReview | TaskState::Cancelled
        )
    }

    /// States whose entry is followed by a collaborator call.
    ///
    /// The runner checks pause and cancel signals before entering one of these.
    pub fn performs_call(self) -> bool {
        matches!(
            self,
            TaskState::Fetching
                | TaskState::Implementing
                | TaskState::Testing
                | TaskState::Fixing
                | TaskState::CreatingPr
                | TaskState::UpdatingTracker
        )
    }

    /// Whether a human has to look at the task.
    pub fn needs_attention(self) -> bool {
        matches!(self, TaskState::MaxRetriesExceeded | TaskState::ManualReview)
    }

    /// Legal transition table.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::{
            Cancelled, Completed, CreatingPr, Fetching, Fixing, Implementing, ManualReview,
            MaxRetriesExceeded, Pending, Testing, UpdatingTracker,
        };

        if to == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, to),
            (Pending, Fetching)
                | (Fetching, Implementing)
                | (Fetching, ManualReview)
                | (Implementing, Testing)
                | (Implementing, ManualReview)
                | (Testing, CreatingPr)
                | (Testing, Fixing)
                | (Testing, MaxRetriesExceeded)
                | (Fixing, Testing)
                | (CreatingPr, UpdatingTracker)
                | (CreatingPr, ManualReview)
                | (UpdatingTracker, Completed)
                | (MaxRetriesExceeded, ManualReview)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "PENDING",
            TaskState::Fetching => "FETCHING",
            TaskState::Implementing => "IMPLEMENTING",
            TaskState::Testing => "TESTING",
            TaskState::Fixing => "FIXING",
            TaskState::CreatingPr => "CREATING_PR",
            TaskState::UpdatingTracker => "UPDATING_TRACKER",
            TaskState::Completed => "COMPLETED",
            TaskState::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            TaskState::ManualReview => "MANUAL_REVIEW",
            TaskState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// What a transition does to `last_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Successful progress: clears `last_error`.
    Advance { to: TaskState, note: Option<String> },
    /// Failure-driven move: records the error detail.
    Fail { to: TaskState, error: String },
}

impl Transition {
    pub fn advance(to: TaskState, note: impl Into<String>) -> Self {
        Transition::Advance {
            to,
            note: Some(note.into()),
        }
    }

    pub fn fail(to: TaskState, error: impl Into<String>) -> Self {
        Transition::Fail {
            to,
            error: error.into(),
        }
    }

    pub fn target(&self) -> TaskState {
        match self {
            Transition::Advance { to, .. } | Transition::Fail { to, .. } => *to,
        }
    }
}

/// Validates and applies transitions to a `Task`. Performs no I/O.
pub struct StateMachine;

impl StateMachine {
    /// Apply `transition` to `task`, appending exactly one history entry.
    ///
    /// An illegal transition leaves the task untouched and returns
    /// [`OrchestratorError::InvalidTransition`].
    pub fn apply(task: &mut Task, transition: Transition) -> Result<TaskState, OrchestratorError> {
        let from = task.state;
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition { from, to });
        }

        let note = match transition {
            Transition::Advance { note, .. } => {
                task.last_error = None;
                note
            }
            Transition::Fail { error, .. } => {
                task.last_error = Some(error.clone());
                Some(error)
            }
        };

        let now = Utc::now();
        task.state = to;
        task.updated_at = now;
        if from == TaskState::Pending && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if to.is_terminal() {
            task.finished_at = Some(now);
        }
        task.history.push(HistoryEntry {
            state: to,
            at: now,
            note,
        });

        Ok(from)
    }

    /// Count one fix attempt against the task's budget.
    ///
    /// Legal only while in FIXING with attempts left; this is the bookkeeping
    /// half of the FIXING → TESTING edge.
    pub fn consume_fix_attempt(task: &mut Task) -> Result<u32, OrchestratorError> {
        if task.state != TaskState::Fixing || task.attempt >= task.max_retries {
            return Err(OrchestratorError::InvalidTransition {
                from: task.state,
                to: TaskState::Testing,
            });
        }
        task.attempt += 1;
        task.updated_at = Utc::now();
        Ok(task.attempt)
    }
}
