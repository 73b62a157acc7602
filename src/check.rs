//! Connectivity checks behind `--check`. No task is created.

use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::runner::Services;
use crate::tracker::TrackerSet;

/// Outcome of one collaborator check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub result: Result<String, String>,
}

impl CheckResult {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Check the agent, every tracker a project uses and the git host, in that order.
pub async fn run_checks(
    config: &AppConfig,
    trackers: &TrackerSet,
    services: &Services,
) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(CheckResult {
        name: "agent".to_string(),
        result: services.agent.check().await.map_err(|e| e.to_string()),
    });

    let mut kinds = Vec::new();
    for project in &config.projects {
        let kind = config.tracker_for(project);
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    for kind in kinds {
        let result = match trackers.get(kind) {
            Ok(tracker) => tracker.check_connection().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        results.push(CheckResult {
            name: format!("tracker ({kind})"),
            result,
        });
    }

    results.push(CheckResult {
        name: "git host".to_string(),
        result: services.git.check_connection().await.map_err(|e| e.to_string()),
    });

    for check in &results {
        match &check.result {
            Ok(detail) => debug!(check = %check.name, detail, "check passed"),
            Err(error) => warn!(check = %check.name, error, "check failed"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::Harness;

    #[tokio::test]
    async fn reports_each_collaborator() {
        let harness = Harness::new();
        let config = AppConfig::from_toml_str(
            r#"
            [[projects]]
            name = "backend"
            path = "/b"

            [[projects]]
            name = "legacy"
            path = "/l"
            tracker = "redmine"
            "#,
            |_| None,
        )
        .unwrap();
        let trackers = TrackerSet::new().with(harness.tracker.clone());

        let results = run_checks(&config, &trackers, &harness.services()).await;
        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["agent", "tracker (Jira)", "tracker (Redmine)", "git host"]);

        assert_eq!(results[0].result, Ok("mock 1.0".to_string()));
        assert!(results[1].ok());
        assert_eq!(
            results[2].result,
            Err("Tracker backend 'Redmine' is not configured".to_string())
        );
        assert!(results[3].ok());
    }
}
