use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{Issue, IssueTracker, ensure_success, http_client, transport_error};
use crate::config::{RedmineConfig, TrackerKind};
use crate::error::CollaboratorError;

const API_KEY_HEADER: &str = "X-Redmine-API-Key";

/// Redmine REST client authenticated with an API key header.
pub struct RedmineClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct IssueEnvelope {
    issue: RedmineIssue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RedmineIssue {
    id: u64,
    subject: String,
    description: Option<String>,
    status: Option<Named>,
    tracker: Option<Named>,
    priority: Option<Named>,
    project: Option<RedmineProject>,
    category: Option<Named>,
    custom_fields: Vec<CustomField>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Named {
    id: u64,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RedmineProject {
    identifier: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CustomField {
    name: String,
    value: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StatusList {
    #[serde(default)]
    issue_statuses: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    user: User,
}

#[derive(Debug, Deserialize)]
struct User {
    #[serde(default)]
    login: String,
}

impl CustomField {
    // Non-empty custom fields become "name: value" labels.
    fn as_label(&self) -> Option<String> {
        let value = match self.value.as_ref()? {
            serde_json::Value::Null => return None,
            serde_json::Value::String(s) if s.is_empty() => return None,
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(items) if items.is_empty() => return None,
            other => other.to_string(),
        };
        Some(format!("{}: {value}", self.name))
    }
}

impl From<RedmineIssue> for Issue {
    fn from(raw: RedmineIssue) -> Self {
        let project = raw.project.unwrap_or_default();
        Issue {
            key: raw.id.to_string(),
            summary: raw.subject,
            description: raw.description.unwrap_or_default(),
            status: raw.status.map(|s| s.name).unwrap_or_default(),
            issue_type: raw.tracker.map(|t| t.name).unwrap_or_default(),
            priority: raw.priority.map(|p| p.name),
            project_key: project.identifier,
            project_name: project.name,
            labels: raw
                .custom_fields
                .iter()
                .filter_map(CustomField::as_label)
                .collect(),
            components: raw.category.map(|c| c.name).into_iter().collect(),
        }
    }
}

/// Numeric Redmine id for keys like `123`, `#123` or `PROJ-123`.
fn issue_id(key: &str) -> &str {
    let key = key.trim().trim_start_matches('#');
    key.rsplit('-').next().unwrap_or(key)
}

impl RedmineClient {
    pub fn new(config: &RedmineConfig) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client()?,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
    }

    async fn put_issue(&self, key: &str, body: serde_json::Value) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .put(format!("{}/issues/{}.json", self.base_url, issue_id(key)))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&json!({ "issue": body }))
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response, key).await?;
        Ok(())
    }

    async fn find_status_id(&self, status: &str) -> Result<Option<u64>, CollaboratorError> {
        let response = self
            .get("/issue_statuses.json")
            .send()
            .await
            .map_err(transport_error)?;
        let list: StatusList = ensure_success(response, "issue statuses")
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(list
            .issue_statuses
            .into_iter()
            .find(|s| s.name.eq_ignore_ascii_case(status))
            .map(|s| s.id))
    }
}

#[async_trait]
impl IssueTracker for RedmineClient {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Redmine
    }

    async fn fetch_task(&self, key: &str) -> Result<Issue, CollaboratorError> {
        info!(issue = key, "fetching Redmine issue");
        let response = self
            .get(&format!("/issues/{}.json", issue_id(key)))
            .query(&[("include", "attachments,journals,watchers")])
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: IssueEnvelope = ensure_success(response, key)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(envelope.issue.into())
    }

    async fn update_status(&self, key: &str, status: &str) -> Result<(), CollaboratorError> {
        info!(issue = key, status, "updating Redmine status");
        let Some(status_id) = self.find_status_id(status).await? else {
            warn!(issue = key, status, "unknown Redmine status");
            return Err(CollaboratorError::NotFound(format!("status '{status}'")));
        };
        self.put_issue(key, json!({ "status_id": status_id })).await
    }

    async fn add_comment(&self, key: &str, comment: &str) -> Result<(), CollaboratorError> {
        self.put_issue(key, json!({ "notes": comment })).await
    }

    async fn check_connection(&self) -> Result<String, CollaboratorError> {
        let response = self
            .get("/users/current.json")
            .send()
            .await
            .map_err(transport_error)?;
        let current: CurrentUser = ensure_success(response, "current user")
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(current.user.login)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RedmineClient {
        RedmineClient::new(&RedmineConfig {
            url: format!("{}/", server.uri()),
            api_key: "secret".into(),
            ..RedmineConfig::default()
        })
        .unwrap()
    }

    async fn mount_statuses(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/issue_statuses.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issue_statuses": [
                    { "id": 1, "name": "New" },
                    { "id": 2, "name": "In Progress" },
                    { "id": 5, "name": "Closed" }
                ]
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn issue_id_accepts_common_forms() {
        assert_eq!(issue_id("123"), "123");
        assert_eq!(issue_id("#123"), "123");
        assert_eq!(issue_id("WEB-123"), "123");
    }

    #[tokio::test]
    async fn fetch_task_maps_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/issues/42.json"))
            .and(header(API_KEY_HEADER, "secret"))
            .and(query_param("include", "attachments,journals,watchers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issue": {
                    "id": 42,
                    "subject": "Fix export",
                    "description": "CSV export breaks on commas",
                    "status": { "id": 1, "name": "New" },
                    "tracker": { "id": 1, "name": "Bug" },
                    "priority": { "id": 4, "name": "Urgent" },
                    "project": { "id": 3, "identifier": "web", "name": "Website" },
                    "category": { "id": 7, "name": "Reports" },
                    "custom_fields": [
                        { "id": 1, "name": "Sprint", "value": "12" },
                        { "id": 2, "name": "Empty", "value": "" }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let issue = client(&server).fetch_task("42").await.unwrap();
        assert_eq!(issue.key, "42");
        assert_eq!(issue.summary, "Fix export");
        assert_eq!(issue.issue_type, "Bug");
        assert_eq!(issue.project_key, "web");
        assert_eq!(issue.labels, vec!["Sprint: 12".to_string()]);
        assert_eq!(issue.components, vec!["Reports".to_string()]);
    }

    #[tokio::test]
    async fn fetch_task_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/issues/9.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server).fetch_task("9").await.unwrap_err();
        assert_eq!(err, CollaboratorError::NotFound("9".into()));
    }

    #[tokio::test]
    async fn update_status_puts_status_id() {
        let server = MockServer::start().await;
        mount_statuses(&server).await;
        Mock::given(method("PUT"))
            .and(path("/issues/42.json"))
            .and(body_json(json!({ "issue": { "status_id": 5 } })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).update_status("42", "closed").await.unwrap();
    }

    #[tokio::test]
    async fn update_status_with_unknown_name_fails() {
        let server = MockServer::start().await;
        mount_statuses(&server).await;

        let err = client(&server)
            .update_status("42", "Done")
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn add_comment_puts_notes() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/issues/42.json"))
            .and(body_json(json!({ "issue": { "notes": "see PR" } })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).add_comment("42", "see PR").await.unwrap();
    }

    #[tokio::test]
    async fn check_connection_returns_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/current.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "user": { "login": "bot" } })),
            )
            .mount(&server)
            .await;

        assert_eq!(client(&server).check_connection().await.unwrap(), "bot");
    }

    #[tokio::test]
    async fn check_connection_reports_auth_failure_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/current.json"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server).check_connection().await.unwrap_err();
        assert!(matches!(err, CollaboratorError::TrackerUnavailable(_)));
    }
}
