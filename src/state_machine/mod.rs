mod retry;
mod state;
mod task;

pub use retry::RetryPolicy;
pub use state::{StateMachine, TaskState, Transition};
pub use task::{HistoryEntry, Task, TaskId, TaskRecord, TaskView};
