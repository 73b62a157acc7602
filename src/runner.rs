//! Drives one task through the lifecycle, calling collaborators per state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::CodingAgent;
use crate::config::{AppConfig, ProjectConfig};
use crate::error::{CollaboratorError, OrchestratorError};
use crate::git_host::{GitHost, PullRequestDraft};
use crate::state_machine::{RetryPolicy, StateMachine, Task, TaskState, Transition};
use crate::test_runner::{TestReport, TestRunner};
use crate::tracker::{Issue, IssueTracker};

/// Lines of test output handed to the agent as fix context.
const FIX_CONTEXT_LINES: usize = 50;

/// Collaborators shared by every task. The tracker is resolved per task.
#[derive(Clone)]
pub struct Services {
    pub agent: Arc<dyn CodingAgent>,
    pub tests: Arc<dyn TestRunner>,
    pub git: Arc<dyn GitHost>,
}

/// Receives every transition and progress line of a running task.
pub trait TaskObserver: Send + Sync {
    fn on_transition(&self, task: &Task, from: TaskState);
    fn on_log(&self, task: &Task, message: &str);
}

/// Pause and cancel signals, observed at state boundaries only.
pub struct RunnerControl {
    pub paused: watch::Receiver<bool>,
    pub cancel: watch::Receiver<bool>,
}

/// Branch for an issue: `<prefix>/<key>-<slug>`, lowercased.
///
/// The slug keeps alphanumerics, whitespace and dashes from the summary,
/// joins words with `-` and is cut to 40 characters.
pub fn branch_name(prefix: &str, issue_key: &str, summary: &str) -> String {
    let cleaned: String = summary
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join("-");
    let slug: String = joined.chars().take(40).collect();
    let slug = slug.trim_end_matches('-');

    let name = if slug.is_empty() {
        format!("{prefix}/{issue_key}")
    } else {
        format!("{prefix}/{issue_key}-{slug}")
    };
    name.to_lowercase()
}

// Resolves once the flag holds `want`; never resolves if the sender is gone.
async fn until(rx: &mut watch::Receiver<bool>, want: bool) {
    if rx.wait_for(|v| *v == want).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Executes a single task to a terminal state.
///
/// Collaborator failures become transitions with a recorded `last_error`;
/// only [`OrchestratorError::InvalidTransition`] escapes `run`.
pub struct TaskRunner {
    config: Arc<AppConfig>,
    project: ProjectConfig,
    policy: RetryPolicy,
    tracker: Arc<dyn IssueTracker>,
    services: Services,
    observer: Arc<dyn TaskObserver>,
    control: RunnerControl,
    issue: Option<Issue>,
    fix_context: String,
}

impl TaskRunner {
    pub fn new(
        config: Arc<AppConfig>,
        project: ProjectConfig,
        tracker: Arc<dyn IssueTracker>,
        services: Services,
        observer: Arc<dyn TaskObserver>,
        control: RunnerControl,
    ) -> Self {
        let policy = config.retry_policy();
        Self {
            config,
            project,
            policy,
            tracker,
            services,
            observer,
            control,
            issue: None,
            fix_context: String::new(),
        }
    }

    pub async fn run(mut self, task: &mut Task) -> Result<(), OrchestratorError> {
        info!(issue = %task.issue_key, project = %self.project.name, "task started");
        loop {
            let transition = match task.state() {
                TaskState::Pending => Transition::advance(TaskState::Fetching, "admitted"),
                TaskState::Fetching => self.fetch(task).await,
                TaskState::Implementing => self.implement(task).await,
                TaskState::Testing => self.test(task).await,
                TaskState::Fixing => self.fix(task).await?,
                TaskState::CreatingPr => self.publish(task).await,
                TaskState::UpdatingTracker => self.update_tracker(task).await,
                TaskState::MaxRetriesExceeded => Transition::fail(
                    TaskState::ManualReview,
                    format!(
                        "tests still failing after {} fix attempts: {}",
                        task.attempt(),
                        task.last_error().unwrap_or("unknown failure")
                    ),
                ),
                TaskState::Completed | TaskState::ManualReview | TaskState::Cancelled => break,
            };
            self.apply(task, transition).await?;
        }
        info!(issue = %task.issue_key, state = %task.state(), attempts = task.attempt(), "task finished");
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.project.path
    }

    fn log(&self, task: &Task, message: &str) {
        info!(issue = %task.issue_key, "{message}");
        self.observer.on_log(task, message);
    }

    fn cancel_requested(&self) -> bool {
        *self.control.cancel.borrow()
    }

    /// Wait out a pause; `false` when the task was cancelled.
    async fn checkpoint(&mut self, task: &Task) -> bool {
        if self.cancel_requested() {
            return false;
        }
        if *self.control.paused.borrow() {
            self.log(task, "paused, waiting to resume");
            let paused = &mut self.control.paused;
            let cancel = &mut self.control.cancel;
            tokio::select! {
                // A dropped pause sender counts as resumed.
                _ = paused.wait_for(|p| !*p) => {}
                _ = until(cancel, true) => {}
            }
        }
        !self.cancel_requested()
    }

    async fn apply(&mut self, task: &mut Task, transition: Transition) -> Result<(), OrchestratorError> {
        // Cancel is honoured at every boundary; pause only holds calling states.
        let target = transition.target();
        let cancelled = if target == TaskState::Cancelled {
            false
        } else if target.performs_call() {
            !self.checkpoint(task).await
        } else {
            self.cancel_requested()
        };
        let transition = if cancelled {
            Transition::advance(TaskState::Cancelled, "cancelled by user")
        } else {
            transition
        };
        let from = StateMachine::apply(task, transition)?;
        debug!(issue = %task.issue_key, %from, to = %task.state(), "transition");
        self.observer.on_transition(task, from);
        Ok(())
    }

    async fn fetch(&mut self, task: &mut Task) -> Transition {
        let kind = self.tracker.kind();
        self.log(task, &format!("fetching issue from {kind}"));
        let issue = match self.tracker.fetch_task(&task.issue_key).await {
            Ok(issue) => issue,
            Err(e) => return Transition::fail(TaskState::ManualReview, format!("fetch failed: {e}")),
        };
        task.summary = Some(issue.summary.clone());
        self.log(task, &format!("issue: {}", issue.summary));

        let branch = branch_name(&self.project.branch_prefix, &task.issue_key, &issue.summary);
        if let Err(e) = self.services.git.prepare_branch(self.path(), &branch).await {
            return Transition::fail(
                TaskState::ManualReview,
                format!("could not prepare branch {branch}: {e}"),
            );
        }
        task.branch_name = Some(branch.clone());

        if self.config.workflow.auto_update_tracker {
            let status = self.config.in_progress_status(kind);
            if let Err(e) = self.tracker.update_status(&task.issue_key, status).await {
                warn!(issue = %task.issue_key, error = %e, "could not mark issue in progress");
                self.log(task, &format!("could not set status '{status}': {e}"));
            }
        }

        self.issue = Some(issue);
        Transition::advance(TaskState::Implementing, format!("branch {branch}"))
    }

    async fn implement(&mut self, task: &mut Task) -> Transition {
        let Some(issue) = self.issue.as_ref() else {
            return Transition::fail(TaskState::ManualReview, "issue details missing");
        };
        let prompt = issue.to_prompt(self.tracker.kind());
        let message = format!("{}: {}", task.issue_key, issue.summary);

        self.log(task, "agent is implementing the task");
        if let Err(e) = self.services.agent.implement(&prompt, self.path()).await {
            return Transition::fail(TaskState::ManualReview, format!("implementation failed: {e}"));
        }
        self.commit(task, &message).await;
        Transition::advance(TaskState::Testing, "implementation done")
    }

    // Build first when configured; a failing build counts as a failing run.
    async fn run_suite(&self) -> TestReport {
        if let Some(build) = self.project.build_command.as_deref() {
            match self.services.tests.run(Some(build), self.path()).await {
                Ok(report) if report.passed => {}
                Ok(report) => return report,
                Err(e) => return TestReport::execution_failure(&e),
            }
        }
        match self
            .services
            .tests
            .run(self.project.test_command.as_deref(), self.path())
            .await
        {
            Ok(report) => report,
            Err(e) => TestReport::execution_failure(&e),
        }
    }

    async fn test(&mut self, task: &mut Task) -> Transition {
        self.log(
            task,
            &format!(
                "running tests (attempt {}/{})",
                task.attempt().saturating_add(1),
                task.max_retries().saturating_add(1)
            ),
        );
        let report = self.run_suite().await;
        if report.passed {
            return Transition::advance(TaskState::CreatingPr, report.summary());
        }

        self.fix_context = report.failure_summary(FIX_CONTEXT_LINES);
        let error = format!("tests failed: {}", report.summary());
        self.log(task, &error);
        if RetryPolicy::should_retry(task.attempt(), task.max_retries()) {
            Transition::fail(TaskState::Fixing, error)
        } else {
            Transition::fail(TaskState::MaxRetriesExceeded, error)
        }
    }

    async fn fix(&mut self, task: &mut Task) -> Result<Transition, OrchestratorError> {
        self.log(task, "agent is fixing the failing tests");
        let outcome = self.services.agent.fix(&self.fix_context, self.path()).await;

        // A failed fix still uses up an attempt.
        let attempt = StateMachine::consume_fix_attempt(task)?;
        let transition = match outcome {
            Ok(_) => Transition::advance(
                TaskState::Testing,
                format!("fix attempt {attempt}/{}", task.max_retries()),
            ),
            Err(e) => {
                self.log(task, &format!("fix attempt {attempt} failed: {e}"));
                Transition::fail(TaskState::Testing, format!("fix attempt {attempt} failed: {e}"))
            }
        };
        if self.cancel_requested() {
            return Ok(transition);
        }

        let message = format!("{}: Fix test failures (attempt {attempt})", task.issue_key);
        self.commit(task, &message).await;

        let delay = self.policy.delay_before(attempt);
        if !delay.is_zero() {
            self.wait(task, delay).await;
        }
        Ok(transition)
    }

    async fn wait(&mut self, task: &Task, delay: Duration) {
        debug!(issue = %task.issue_key, ?delay, "waiting before next test run");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = until(&mut self.control.cancel, true) => {}
        }
    }

    async fn commit(&self, task: &Task, message: &str) {
        match self.services.git.commit(self.path(), message).await {
            Ok(Some(hash)) => self.log(task, &format!("committed {hash}")),
            Ok(None) => debug!(issue = %task.issue_key, "nothing to commit"),
            Err(e) => {
                warn!(issue = %task.issue_key, error = %e, "commit failed");
                self.log(task, &format!("commit failed: {e}"));
            }
        }
    }

    async fn publish(&mut self, task: &mut Task) -> Transition {
        let summary = task.summary.clone().unwrap_or_default();
        let branch = match task.branch_name.clone() {
            Some(branch) => branch,
            None => {
                let branch = branch_name(&self.project.branch_prefix, &task.issue_key, &summary);
                task.branch_name = Some(branch.clone());
                branch
            }
        };

        self.log(task, &format!("pushing {branch}"));
        if let Err(e) = self.services.git.push_branch(self.path(), &branch).await {
            return Transition::fail(TaskState::ManualReview, format!("push failed: {e}"));
        }
        if !self.config.workflow.auto_create_pr {
            return Transition::advance(
                TaskState::UpdatingTracker,
                "branch pushed, pull request creation disabled",
            );
        }

        let diff = match self.services.git.diff_summary(self.path()).await {
            Ok(diff) => diff,
            Err(e) => {
                warn!(issue = %task.issue_key, error = %e, "no diff summary");
                String::new()
            }
        };
        let issue_text = self
            .issue
            .as_ref()
            .map(|i| i.to_prompt(self.tracker.kind()))
            .unwrap_or_else(|| summary.clone());
        let description = match self
            .services
            .agent
            .describe_pull_request(&issue_text, &diff, self.path())
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) | Err(_) => fallback_description(&task.issue_key, &issue_text, &diff),
        };

        let draft = PullRequestDraft {
            branch,
            title: format!("{}: {summary}", task.issue_key),
            description,
        };
        match self
            .services
            .git
            .create_pull_request(self.path(), &draft)
            .await
        {
            Ok(pr) => {
                self.log(task, &format!("pull request created: {}", pr.url));
                task.pr_url = Some(pr.url.clone());
                Transition::advance(TaskState::UpdatingTracker, format!("PR #{} {}", pr.id, pr.url))
            }
            Err(e) => {
                Transition::fail(TaskState::ManualReview, format!("pull request failed: {e}"))
            }
        }
    }

    async fn update_tracker(&mut self, task: &mut Task) -> Transition {
        if !self.config.workflow.auto_update_tracker {
            return Transition::advance(TaskState::Completed, "tracker update disabled");
        }

        let kind = self.tracker.kind();
        let mut failures: Vec<CollaboratorError> = Vec::new();
        if let Some(url) = task.pr_url.as_deref() {
            let comment = format!("Pull request created: {url}");
            if let Err(e) = self.tracker.add_comment(&task.issue_key, &comment).await {
                failures.push(e);
            }
        }
        let status = self.config.done_status(kind);
        if let Err(e) = self.tracker.update_status(&task.issue_key, status).await {
            failures.push(e);
        }

        if failures.is_empty() {
            Transition::advance(TaskState::Completed, format!("{kind} status set to '{status}'"))
        } else {
            let detail = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!(issue = %task.issue_key, %detail, "tracker update failed");
            // The work is published; the tracker error is kept on the record.
            Transition::fail(TaskState::Completed, format!("tracker update failed: {detail}"))
        }
    }
}

fn fallback_description(issue_key: &str, issue_text: &str, diff: &str) -> String {
    let mut text = format!("Resolves {issue_key}.\n\n{issue_text}");
    if !diff.is_empty() {
        text.push_str("\n\n## Changes\n```\n");
        text.push_str(diff);
        text.push_str("\n```");
    }
    text
}
