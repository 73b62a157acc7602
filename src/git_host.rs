//! Git hosting capability (branch, commit, push, pull request) and the
//! Bitbucket Cloud backend.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::BitbucketConfig;
use crate::error::CollaboratorError;
use crate::git::{GitManager, PushAuth};

// SSH: git@bitbucket.org:workspace/repo.git, HTTPS: https://bitbucket.org/workspace/repo.git
static BITBUCKET_REMOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"bitbucket\.org[:/]([^/]+)/([^/]+?)(?:\.git)?/?$")
        .expect("valid bitbucket remote regex")
});

/// Request for a new pull request from `branch` into the host's base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDraft {
    pub branch: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub id: u64,
    pub url: String,
}

/// Operations the lifecycle needs from the git host and the local clone.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Check out the task branch in the project, creating it from the base.
    async fn prepare_branch(&self, project_path: &Path, branch: &str)
    -> Result<(), CollaboratorError>;

    /// Commit pending changes; `None` when the tree is clean.
    async fn commit(
        &self,
        project_path: &Path,
        message: &str,
    ) -> Result<Option<String>, CollaboratorError>;

    async fn push_branch(&self, project_path: &Path, branch: &str)
    -> Result<(), CollaboratorError>;

    async fn create_pull_request(
        &self,
        project_path: &Path,
        draft: &PullRequestDraft,
    ) -> Result<PullRequest, CollaboratorError>;

    /// File-level summary of the task branch's changes.
    async fn diff_summary(&self, project_path: &Path) -> Result<String, CollaboratorError>;

    async fn check_connection(&self) -> Result<String, CollaboratorError>;
}

#[derive(Debug, Deserialize)]
struct CreatedPullRequest {
    id: u64,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Links {
    html: Href,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Href {
    href: String,
}

/// Bitbucket Cloud REST 2.0 plus libgit2 for the local clone.
pub struct BitbucketHost {
    client: Client,
    api_url: String,
    workspace: String,
    auth: PushAuth,
    base_branch: String,
}

/// `(workspace, repo_slug)` from a Bitbucket remote URL.
pub fn parse_remote(url: &str) -> Option<(String, String)> {
    BITBUCKET_REMOTE
        .captures(url)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
}

// Auth failures from libgit2 become AuthError, everything else GitHostUnavailable.
fn git_error(err: anyhow::Error) -> CollaboratorError {
    let auth = err
        .chain()
        .filter_map(|e| e.downcast_ref::<git2::Error>())
        .any(|e| e.code() == git2::ErrorCode::Auth || e.class() == git2::ErrorClass::Ssh);
    if auth {
        CollaboratorError::AuthError(format!("{err:#}"))
    } else {
        CollaboratorError::GitHostUnavailable(format!("{err:#}"))
    }
}

fn http_error(err: reqwest::Error) -> CollaboratorError {
    CollaboratorError::GitHostUnavailable(err.to_string())
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(CollaboratorError::AuthError(detail))
    } else {
        Err(CollaboratorError::GitHostUnavailable(detail))
    }
}

// Run a GitManager operation on the blocking pool.
async fn with_repo<T, F>(project_path: &Path, op: F) -> Result<T, CollaboratorError>
where
    T: Send + 'static,
    F: FnOnce(&GitManager) -> anyhow::Result<T> + Send + 'static,
{
    let path: PathBuf = project_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let git = GitManager::open(&path)?;
        op(&git)
    })
    .await
    .map_err(|e| CollaboratorError::GitHostUnavailable(format!("git task failed: {e}")))?
    .map_err(git_error)
}

impl BitbucketHost {
    pub fn new(config: &BitbucketConfig) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(http_error)?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            workspace: config.workspace.clone(),
            auth: PushAuth {
                username: config.username.clone(),
                password: config.app_password.clone(),
            },
            base_branch: config.base_branch.clone(),
        })
    }

    async fn repository(&self, project_path: &Path) -> Result<(String, String), CollaboratorError> {
        let url = with_repo(project_path, |git| git.origin_url()).await?;
        let url = url.ok_or_else(|| {
            CollaboratorError::GitHostUnavailable(format!(
                "{} has no 'origin' remote",
                project_path.display()
            ))
        })?;
        let (remote_workspace, slug) = parse_remote(&url).ok_or_else(|| {
            CollaboratorError::GitHostUnavailable(format!("'{url}' is not a Bitbucket remote"))
        })?;
        let workspace = if self.workspace.is_empty() {
            remote_workspace
        } else {
            self.workspace.clone()
        };
        Ok((workspace, slug))
    }
}

#[async_trait]
impl GitHost for BitbucketHost {
    async fn prepare_branch(
        &self,
        project_path: &Path,
        branch: &str,
    ) -> Result<(), CollaboratorError> {
        let branch = branch.to_string();
        let base = self.base_branch.clone();
        with_repo(project_path, move |git| git.prepare_branch(&branch, &base)).await
    }

    async fn commit(
        &self,
        project_path: &Path,
        message: &str,
    ) -> Result<Option<String>, CollaboratorError> {
        let message = message.to_string();
        with_repo(project_path, move |git| git.commit(&message)).await
    }

    async fn push_branch(
        &self,
        project_path: &Path,
        branch: &str,
    ) -> Result<(), CollaboratorError> {
        let branch = branch.to_string();
        let auth = self.auth.clone();
        with_repo(project_path, move |git| git.push(&branch, &auth)).await
    }

    async fn create_pull_request(
        &self,
        project_path: &Path,
        draft: &PullRequestDraft,
    ) -> Result<PullRequest, CollaboratorError> {
        let (workspace, slug) = self.repository(project_path).await?;
        info!(%workspace, %slug, branch = %draft.branch, "creating pull request");

        let response = self
            .client
            .post(format!(
                "{}/repositories/{workspace}/{slug}/pullrequests",
                self.api_url
            ))
            .basic_auth(&self.auth.username, Some(&self.auth.password))
            .json(&json!({
                "title": draft.title,
                "description": draft.description,
                "source": { "branch": { "name": draft.branch } },
                "destination": { "branch": { "name": self.base_branch } },
                "close_source_branch": true,
            }))
            .send()
            .await
            .map_err(http_error)?;
        let created: CreatedPullRequest = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(http_error)?;

        if created.links.html.href.is_empty() {
            warn!(id = created.id, "pull request response has no html link");
        }
        Ok(PullRequest {
            id: created.id,
            url: created.links.html.href,
        })
    }

    async fn diff_summary(&self, project_path: &Path) -> Result<String, CollaboratorError> {
        let base = self.base_branch.clone();
        with_repo(project_path, move |git| git.diff_summary(&base)).await
    }

    async fn check_connection(&self) -> Result<String, CollaboratorError> {
        if self.workspace.is_empty() {
            return Err(CollaboratorError::GitHostUnavailable(
                "bitbucket.workspace is not configured".to_string(),
            ));
        }
        let response = self
            .client
            .get(format!("{}/repositories/{}", self.api_url, self.workspace))
            .basic_auth(&self.auth.username, Some(&self.auth.password))
            .send()
            .await
            .map_err(http_error)?;
        ensure_success(response).await?;
        Ok(format!("workspace {}", self.workspace))
    }
}
