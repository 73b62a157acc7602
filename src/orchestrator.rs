use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ProjectConfig};
use crate::error::OrchestratorError;
use crate::runner::{RunnerControl, Services, TaskObserver, TaskRunner};
use crate::state_machine::{StateMachine, Task, TaskId, TaskRecord, TaskState, TaskView, Transition};
use crate::tracker::{IssueTracker, TrackerSet, is_valid_issue_key};

/// Records kept in the history file.
const HISTORY_LIMIT: usize = 100;
/// Finished tasks kept in memory for observers.
const FINISHED_LIMIT: usize = 50;
const EVENT_CAPACITY: usize = 256;

/// Notifications published to observers.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    Admitted(TaskView),
    StateChanged { task: TaskView, from: TaskState },
    Log { id: TaskId, issue_key: String, message: String },
    Finished(TaskView),
    /// Removed from the queue before it started.
    Withdrawn(TaskView),
    Paused,
    Resumed,
}

struct QueuedTask {
    task: Task,
    project: ProjectConfig,
    tracker: Arc<dyn IssueTracker>,
}

struct ActiveTask {
    view: TaskView,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<QueuedTask>,
    active: Option<ActiveTask>,
    finished: VecDeque<TaskView>,
    // Every task that reached a terminal state, including those aged out of `finished`.
    retired: HashSet<TaskId>,
}

/// JSON file with the most recent task records.
struct HistoryStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl HistoryStore {
    async fn read(&self) -> Result<Vec<TaskRecord>, OrchestratorError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, record: TaskRecord) -> Result<(), OrchestratorError> {
        let _guard = self.lock.lock().await;
        let mut records = match self.read().await {
            Ok(records) => records,
            Err(OrchestratorError::Json(e)) => {
                warn!(path = %self.path.display(), error = %e, "history file unreadable, starting over");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        records.push(record);
        if records.len() > HISTORY_LIMIT {
            records.drain(..records.len() - HISTORY_LIMIT);
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(&records)?).await?;
        Ok(())
    }

    /// Newest first.
    async fn load(&self, limit: usize) -> Result<Vec<TaskRecord>, OrchestratorError> {
        let _guard = self.lock.lock().await;
        let records = self.read().await?;
        Ok(records.into_iter().rev().take(limit).collect())
    }
}

struct Shared {
    config: Arc<AppConfig>,
    trackers: TrackerSet,
    services: Services,
    inner: Mutex<Inner>,
    paused: watch::Sender<bool>,
    wake: Notify,
    events: broadcast::Sender<OrchestratorEvent>,
    history: HistoryStore,
}

impl Shared {
    // Never held across an await.
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn record(&self, task: &Task) {
        if let Err(e) = self.history.append(TaskRecord::from_task(task)).await {
            warn!(issue = %task.issue_key, error = %e, "could not write task history");
        }
    }
}

impl TaskObserver for Shared {
    fn on_transition(&self, task: &Task, from: TaskState) {
        let view = task.view();
        if let Some(active) = self.inner().active.as_mut().filter(|a| a.view.id == task.id) {
            active.view = view.clone();
        }
        debug!(issue = %task.issue_key, %from, to = %task.state(), "state changed");
        self.publish(OrchestratorEvent::StateChanged { task: view, from });
    }

    fn on_log(&self, task: &Task, message: &str) {
        self.publish(OrchestratorEvent::Log {
            id: task.id,
            issue_key: task.issue_key.clone(),
            message: message.to_string(),
        });
    }
}

/// Owns the task queue and runs one task at a time, in admission order.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(config: Arc<AppConfig>, trackers: TrackerSet, services: Services) -> Self {
        let (paused, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let history = HistoryStore {
            path: config.history_file.clone(),
            lock: tokio::sync::Mutex::new(()),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                trackers,
                services,
                inner: Mutex::new(Inner::default()),
                paused,
                wake: Notify::new(),
                events,
                history,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.shared.events.subscribe()
    }

    /// Admit `issue_key`, picking the project from the key.
    pub fn enqueue(&self, issue_key: &str) -> Result<TaskId, OrchestratorError> {
        self.enqueue_for_project(issue_key, None)
    }

    /// Admit `issue_key` against an explicit project, or the one the key
    /// maps to when `project` is `None`.
    pub fn enqueue_for_project(
        &self,
        issue_key: &str,
        project: Option<&str>,
    ) -> Result<TaskId, OrchestratorError> {
        let issue_key = issue_key.trim();
        if !is_valid_issue_key(issue_key) {
            return Err(OrchestratorError::InvalidIssueKey(issue_key.to_string()));
        }
        let config = &self.shared.config;
        let project = match project {
            Some(name) => config.project(name),
            None => config.project_for_issue(issue_key),
        }
        .ok_or_else(|| OrchestratorError::NoMatchingProject(issue_key.to_string()))?
        .clone();
        let tracker = self.shared.trackers.get(config.tracker_for(&project))?;

        let task = Task::new(
            TaskId::new(),
            issue_key.to_string(),
            project.name.clone(),
            config.workflow.max_retries,
        );
        let id = task.id;
        let view = task.view();
        {
            let mut inner = self.shared.inner();
            let is_active = inner
                .active
                .as_ref()
                .is_some_and(|a| a.view.issue_key.eq_ignore_ascii_case(issue_key));
            let is_queued = inner
                .queue
                .iter()
                .any(|q| q.task.issue_key.eq_ignore_ascii_case(issue_key));
            if is_active || is_queued {
                return Err(OrchestratorError::DuplicateTask(issue_key.to_string()));
            }
            inner.queue.push_back(QueuedTask {
                task,
                project,
                tracker,
            });
        }

        info!(issue = issue_key, %id, "task admitted");
        self.shared.publish(OrchestratorEvent::Admitted(view));
        self.shared.wake.notify_one();
        Ok(id)
    }

    pub fn pause(&self) {
        if !self.shared.paused.send_replace(true) {
            info!("orchestrator paused");
            self.shared.publish(OrchestratorEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.send_replace(false) {
            info!("orchestrator resumed");
            self.shared.publish(OrchestratorEvent::Resumed);
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Cancel a task.
    ///
    /// The active task stops at its next state boundary; a queued task is
    /// withdrawn at once. Cancelling a finished task does nothing.
    pub async fn cancel(&self, id: TaskId) -> Result<(), OrchestratorError> {
        let withdrawn = {
            let mut inner = self.shared.inner();
            if let Some(active) = inner.active.as_ref().filter(|a| a.view.id == id) {
                info!(issue = %active.view.issue_key, "cancel requested");
                active.cancel.send_replace(true);
                return Ok(());
            }
            let position = inner.queue.iter().position(|q| q.task.id == id);
            match position {
                Some(index) => inner.queue.remove(index),
                None if inner.retired.contains(&id) => return Ok(()),
                None => return Err(OrchestratorError::TaskNotFound(id.to_string())),
            }
        };

        let Some(QueuedTask { mut task, .. }) = withdrawn else {
            return Err(OrchestratorError::TaskNotFound(id.to_string()));
        };
        StateMachine::apply(
            &mut task,
            Transition::advance(TaskState::Cancelled, "withdrawn before start"),
        )?;
        let view = task.view();
        self.remember(view.clone());
        info!(issue = %task.issue_key, "task withdrawn");
        self.shared.publish(OrchestratorEvent::Withdrawn(view));
        self.shared.record(&task).await;
        Ok(())
    }

    /// Cancel by issue key, for line commands.
    pub async fn cancel_issue(&self, issue_key: &str) -> Result<(), OrchestratorError> {
        let id = {
            let inner = self.shared.inner();
            let matches = |key: &str| key.eq_ignore_ascii_case(issue_key);
            inner
                .active
                .as_ref()
                .filter(|a| matches(&a.view.issue_key))
                .map(|a| a.view.id)
                .or_else(|| {
                    inner
                        .queue
                        .iter()
                        .find(|q| matches(&q.task.issue_key))
                        .map(|q| q.task.id)
                })
                .or_else(|| {
                    inner
                        .finished
                        .iter()
                        .rev()
                        .find(|v| matches(&v.issue_key))
                        .map(|v| v.id)
                })
        };
        match id {
            Some(id) => self.cancel(id).await,
            None => Err(OrchestratorError::TaskNotFound(issue_key.to_string())),
        }
    }

    /// Active task first, then the queue in FIFO order. Copies only.
    pub fn snapshot(&self) -> Vec<TaskView> {
        let inner = self.shared.inner();
        inner
            .active
            .iter()
            .map(|a| a.view.clone())
            .chain(inner.queue.iter().map(|q| q.task.view()))
            .collect()
    }

    pub fn active(&self) -> Option<TaskView> {
        self.shared.inner().active.as_ref().map(|a| a.view.clone())
    }

    /// Recently finished tasks, oldest first.
    pub fn finished(&self) -> Vec<TaskView> {
        self.shared.inner().finished.iter().cloned().collect()
    }

    /// Persisted records, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<TaskRecord>, OrchestratorError> {
        self.shared.history.load(limit).await
    }

    fn remember(&self, view: TaskView) {
        let mut inner = self.shared.inner();
        inner.retired.insert(view.id);
        inner.finished.push_back(view);
        while inner.finished.len() > FINISHED_LIMIT {
            inner.finished.pop_front();
        }
    }

    /// Serve the queue until the future is dropped.
    pub async fn run(&self) {
        loop {
            if self.run_next().await.is_none() {
                self.shared.wake.notified().await;
            }
        }
    }

    /// Run the oldest queued task to a terminal state.
    ///
    /// Returns `None` when the queue is empty.
    pub async fn run_next(&self) -> Option<TaskView> {
        let (mut task, project, tracker, cancel) = {
            let mut inner = self.shared.inner();
            let QueuedTask {
                task,
                project,
                tracker,
            } = inner.queue.pop_front()?;
            let (cancel_tx, cancel_rx) = watch::channel(false);
            inner.active = Some(ActiveTask {
                view: task.view(),
                cancel: cancel_tx,
            });
            (task, project, tracker, cancel_rx)
        };

        let runner = TaskRunner::new(
            self.shared.config.clone(),
            project,
            tracker,
            self.shared.services.clone(),
            self.shared.clone(),
            RunnerControl {
                paused: self.shared.paused.subscribe(),
                cancel,
            },
        );
        if let Err(e) = runner.run(&mut task).await {
            error!(issue = %task.issue_key, error = %e, "task aborted");
            if !task.state().is_terminal() {
                if let Ok(from) = StateMachine::apply(
                    &mut task,
                    Transition::fail(TaskState::Cancelled, format!("aborted: {e}")),
                ) {
                    self.shared.on_transition(&task, from);
                }
            }
        }

        let view = task.view();
        self.shared.inner().active = None;
        self.remember(view.clone());
        self.shared.publish(OrchestratorEvent::Finished(view.clone()));
        self.shared.record(&task).await;
        Some(view)
    }

    /// Admit one issue and drive the queue until it finishes.
    pub async fn run_single(
        &self,
        issue_key: &str,
        project: Option<&str>,
    ) -> Result<TaskView, OrchestratorError> {
        let id = self.enqueue_for_project(issue_key, project)?;
        while let Some(view) = self.run_next().await {
            if view.id == id {
                return Ok(view);
            }
        }
        // Withdrawn before it ran.
        self.finished()
            .into_iter()
            .find(|v| v.id == id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(issue_key.to_string()))
    }
}
