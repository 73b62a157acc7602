use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Issue, IssueTracker, ensure_success, http_client, transport_error};
use crate::config::{JiraConfig, TrackerKind};
use crate::error::CollaboratorError;

const ISSUE_FIELDS: &str = "summary,description,issuetype,status,priority,project,labels,components";

/// Jira Cloud REST v2 client (basic auth with e-mail and API token).
pub struct JiraClient {
    client: Client,
    base_url: String,
    email: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct JiraIssue {
    key: String,
    #[serde(default)]
    fields: JiraFields,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JiraFields {
    summary: String,
    description: Option<String>,
    issuetype: Option<Named>,
    status: Option<Named>,
    priority: Option<Named>,
    project: Option<JiraProject>,
    labels: Vec<String>,
    components: Vec<Named>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Named {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JiraProject {
    key: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TransitionList {
    #[serde(default)]
    transitions: Vec<JiraTransition>,
}

#[derive(Debug, Deserialize)]
struct JiraTransition {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    to: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct Myself {
    #[serde(rename = "displayName", default)]
    display_name: String,
}

impl From<JiraIssue> for Issue {
    fn from(raw: JiraIssue) -> Self {
        let fields = raw.fields;
        let project = fields.project.unwrap_or_default();
        Issue {
            key: raw.key,
            summary: fields.summary,
            description: fields.description.unwrap_or_default(),
            status: fields.status.map(|s| s.name).unwrap_or_default(),
            issue_type: fields.issuetype.map(|t| t.name).unwrap_or_default(),
            priority: fields.priority.map(|p| p.name),
            project_key: project.key,
            project_name: project.name,
            labels: fields.labels,
            components: fields.components.into_iter().map(|c| c.name).collect(),
        }
    }
}

impl JiraClient {
    pub fn new(config: &JiraConfig) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client()?,
            base_url: config.url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
            api_token: config.api_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/api/2{path}", self.base_url)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .basic_auth(&self.email, Some(&self.api_token))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .basic_auth(&self.email, Some(&self.api_token))
    }
}

#[async_trait]
impl IssueTracker for JiraClient {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Jira
    }

    async fn fetch_task(&self, key: &str) -> Result<Issue, CollaboratorError> {
        info!(issue = key, "fetching Jira issue");
        let response = self
            .get(&format!("/issue/{key}"))
            .query(&[("fields", ISSUE_FIELDS)])
            .send()
            .await
            .map_err(transport_error)?;
        let raw: JiraIssue = ensure_success(response, key)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(raw.into())
    }

    async fn update_status(&self, key: &str, status: &str) -> Result<(), CollaboratorError> {
        info!(issue = key, status, "transitioning Jira issue");
        let path = format!("/issue/{key}/transitions");
        let response = self.get(&path).send().await.map_err(transport_error)?;
        let list: TransitionList = ensure_success(response, key)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        // Match by transition name or by the status it leads to.
        let target = list.transitions.iter().find(|t| {
            t.name.eq_ignore_ascii_case(status)
                || t
                    .to
                    .as_ref()
                    .is_some_and(|to| to.name.eq_ignore_ascii_case(status))
        });
        let Some(target) = target else {
            let available: Vec<&str> = list.transitions.iter().map(|t| t.name.as_str()).collect();
            warn!(issue = key, status, ?available, "no matching Jira transition");
            return Err(CollaboratorError::NotFound(format!(
                "transition to '{status}' for {key}"
            )));
        };

        debug!(issue = key, transition = %target.id, "posting transition");
        let response = self
            .post(&path)
            .json(&json!({ "transition": { "id": target.id } }))
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response, key).await?;
        Ok(())
    }

    async fn add_comment(&self, key: &str, comment: &str) -> Result<(), CollaboratorError> {
        let response = self
            .post(&format!("/issue/{key}/comment"))
            .json(&json!({ "body": comment }))
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response, key).await?;
        Ok(())
    }

    async fn check_connection(&self) -> Result<String, CollaboratorError> {
        let response = self.get("/myself").send().await.map_err(transport_error)?;
        let me: Myself = ensure_success(response, "current user")
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(me.display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> JiraClient {
        JiraClient::new(&JiraConfig {
            url: server.uri(),
            email: "bot@acme.io".into(),
            api_token: "token".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_task_parses_issue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/2/issue/DEV-1"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "key": "DEV-1",
                "fields": {
                    "summary": "Add login page",
                    "description": null,
                    "issuetype": { "name": "Story" },
                    "status": { "name": "To Do" },
                    "priority": { "name": "High" },
                    "project": { "key": "DEV", "name": "Development" },
                    "labels": ["backend"],
                    "components": [{ "name": "auth" }]
                }
            })))
            .mount(&server)
            .await;

        let issue = client(&server).fetch_task("DEV-1").await.unwrap();
        assert_eq!(issue.key, "DEV-1");
        assert_eq!(issue.summary, "Add login page");
        assert_eq!(issue.description, "");
        assert_eq!(issue.issue_type, "Story");
        assert_eq!(issue.priority.as_deref(), Some("High"));
        assert_eq!(issue.project_key, "DEV");
        assert_eq!(issue.components, vec!["auth".to_string()]);
    }

    #[tokio::test]
    async fn fetch_task_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/2/issue/DEV-404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server).fetch_task("DEV-404").await.unwrap_err();
        assert_eq!(err, CollaboratorError::NotFound("DEV-404".into()));
    }

    #[tokio::test]
    async fn fetch_task_maps_server_error_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/2/issue/DEV-1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_task("DEV-1").await.unwrap_err();
        assert_eq!(
            err,
            CollaboratorError::TrackerUnavailable("HTTP 503: maintenance".into())
        );
    }

    #[tokio::test]
    async fn update_status_uses_matching_transition() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/2/issue/DEV-1/transitions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transitions": [
                    { "id": "11", "name": "Start", "to": { "name": "In Progress" } },
                    { "id": "31", "name": "Finish", "to": { "name": "Done" } }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/api/2/issue/DEV-1/transitions"))
            .and(body_json(json!({ "transition": { "id": "31" } })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).update_status("DEV-1", "done").await.unwrap();
    }

    #[tokio::test]
    async fn update_status_without_transition_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/2/issue/DEV-1/transitions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "transitions": [] })))
            .mount(&server)
            .await;

        let err = client(&server)
            .update_status("DEV-1", "Done")
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn add_comment_posts_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/api/2/issue/DEV-1/comment"))
            .and(body_json(json!({ "body": "PR: https://bb/pr/1" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "1" })))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .add_comment("DEV-1", "PR: https://bb/pr/1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn check_connection_returns_display_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/2/myself"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "displayName": "Build Bot" })),
            )
            .mount(&server)
            .await;

        assert_eq!(client(&server).check_connection().await.unwrap(), "Build Bot");
    }
}
