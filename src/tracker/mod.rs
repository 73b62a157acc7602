//! Issue tracker capability and its backends.

pub mod jira;
pub mod redmine;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Response, StatusCode};

use crate::config::{AppConfig, TrackerKind};
use crate::error::{CollaboratorError, OrchestratorError};

pub use jira::JiraClient;
pub use redmine::RedmineClient;

// Jira `DEV-123`, Redmine `123` / `#123` / `PROJ-123`.
static ISSUE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#?[A-Za-z0-9][A-Za-z0-9_-]*$").expect("valid issue key regex")
});

/// Whether `key` is safe to place in a tracker URL path.
pub fn is_valid_issue_key(key: &str) -> bool {
    ISSUE_KEY.is_match(key)
}

/// Tracker-neutral issue data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Issue {
    pub key: String,
    pub summary: String,
    pub description: String,
    pub status: String,
    pub issue_type: String,
    pub priority: Option<String>,
    pub project_key: String,
    pub project_name: String,
    pub labels: Vec<String>,
    pub components: Vec<String>,
}

impl Issue {
    /// Render the issue as the agent's task description.
    pub fn to_prompt(&self, tracker: TrackerKind) -> String {
        let project = if self.project_name.is_empty() {
            &self.project_key
        } else {
            &self.project_name
        };

        let mut parts = vec![
            format!("# {tracker} Issue: {}", self.key),
            format!("## Summary: {}", self.summary),
            format!("**Type:** {}", self.issue_type),
            format!("**Status:** {}", self.status),
            format!(
                "**Priority:** {}",
                self.priority.as_deref().unwrap_or("None")
            ),
            format!("**Project:** {project}"),
        ];
        if !self.labels.is_empty() {
            parts.push(format!("**Labels:** {}", self.labels.join(", ")));
        }
        if !self.components.is_empty() {
            parts.push(format!(
                "**Components/Categories:** {}",
                self.components.join(", ")
            ));
        }
        parts.push(String::new());
        parts.push("## Description:".to_string());
        if self.description.trim().is_empty() {
            parts.push("(No description)".to_string());
        } else {
            parts.push(self.description.clone());
        }
        parts.join("\n")
    }
}

/// Operations the lifecycle needs from an issue tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    fn kind(&self) -> TrackerKind;

    /// Retrieve description and metadata for `key`.
    async fn fetch_task(&self, key: &str) -> Result<Issue, CollaboratorError>;

    /// Move the issue to the status named `status`.
    async fn update_status(&self, key: &str, status: &str) -> Result<(), CollaboratorError>;

    async fn add_comment(&self, key: &str, comment: &str) -> Result<(), CollaboratorError>;

    /// Verify credentials; returns the authenticated user's name.
    async fn check_connection(&self) -> Result<String, CollaboratorError>;
}

/// Tracker backends keyed by kind, resolved per project at admission.
#[derive(Clone, Default)]
pub struct TrackerSet {
    backends: HashMap<TrackerKind, Arc<dyn IssueTracker>>,
}

impl TrackerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tracker: Arc<dyn IssueTracker>) -> Self {
        self.backends.insert(tracker.kind(), tracker);
        self
    }

    /// Build every backend that has a URL configured.
    pub fn from_config(config: &AppConfig) -> Result<Self, CollaboratorError> {
        let mut set = Self::new();
        if !config.jira.url.is_empty() {
            set = set.with(Arc::new(JiraClient::new(&config.jira)?));
        }
        if !config.redmine.url.is_empty() {
            set = set.with(Arc::new(RedmineClient::new(&config.redmine)?));
        }
        Ok(set)
    }

    pub fn get(&self, kind: TrackerKind) -> Result<Arc<dyn IssueTracker>, OrchestratorError> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| OrchestratorError::TrackerNotConfigured(kind.to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> CollaboratorError {
    CollaboratorError::TrackerUnavailable(err.to_string())
}

// 404 → NotFound(what); any other non-success → TrackerUnavailable.
async fn ensure_success(response: Response, what: &str) -> Result<Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(CollaboratorError::NotFound(what.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    Err(CollaboratorError::TrackerUnavailable(format!(
        "HTTP {}: {}",
        status.as_u16(),
        body.trim()
    )))
}

fn http_client() -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(transport_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_keys_are_path_safe() {
        for key in ["DEV-123", "123", "#123", "legacy_app-7"] {
            assert!(is_valid_issue_key(key), "{key}");
        }
        for key in ["", "DEV-1/../admin", "DEV-1?fields=x", "DEV 1", "-1", "#", "DEV-1#x"] {
            assert!(!is_valid_issue_key(key), "{key}");
        }
    }

    fn issue() -> Issue {
        Issue {
            key: "DEV-123".into(),
            summary: "Add login page".into(),
            description: "Users need a login page.".into(),
            status: "To Do".into(),
            issue_type: "Story".into(),
            priority: Some("High".into()),
            project_key: "DEV".into(),
            project_name: "Development".into(),
            labels: vec!["backend".into()],
            components: vec![],
        }
    }

    #[test]
    fn prompt_contains_key_fields() {
        let prompt = issue().to_prompt(TrackerKind::Jira);
        assert!(prompt.starts_with("# Jira Issue: DEV-123"));
        assert!(prompt.contains("## Summary: Add login page"));
        assert!(prompt.contains("**Priority:** High"));
        assert!(prompt.contains("**Project:** Development"));
        assert!(prompt.contains("**Labels:** backend"));
        assert!(!prompt.contains("Components"));
        assert!(prompt.ends_with("Users need a login page."));
    }

    #[test]
    fn prompt_marks_missing_description() {
        let mut issue = issue();
        issue.description = "  ".into();
        issue.priority = None;
        let prompt = issue.to_prompt(TrackerKind::Redmine);
        assert!(prompt.starts_with("# Redmine Issue"));
        assert!(prompt.contains("**Priority:** None"));
        assert!(prompt.ends_with("(No description)"));
    }

    #[test]
    fn tracker_set_reports_missing_backend() {
        let set = TrackerSet::new();
        let err = set.get(TrackerKind::Redmine).err().unwrap();
        assert!(matches!(err, OrchestratorError::TrackerNotConfigured(name) if name == "Redmine"));
    }
}
