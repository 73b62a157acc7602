//! Test execution capability with build-tool detection and output parsing.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::CollaboratorError;

static GRADLE_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) tests? completed(?:, (\d+) failed)?(?:, (\d+) skipped)?")
        .expect("valid gradle summary regex")
});
static GRADLE_FAILURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+) > (\w+).*FAILED").expect("valid gradle failure regex"));

static MAVEN_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tests run: (\d+), Failures: (\d+), Errors: (\d+), Skipped: (\d+)")
        .expect("valid maven summary regex")
});
static MAVEN_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w+)\(([^)]+)\).*<<<\s+(FAILURE|ERROR)").expect("valid maven failure regex")
});

static JEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tests:\s+(?:(\d+) failed,\s+)?(?:(\d+) skipped,\s+)?(\d+) passed,\s+(\d+) total")
        .expect("valid jest summary regex")
});
static JEST_FAILURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[✕×]\s+(.+?)\s+\(").expect("valid jest failure regex"));

static CARGO_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored")
        .expect("valid cargo summary regex")
});
static CARGO_FAILURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"---- (\S+) stdout ----").expect("valid cargo failure regex"));

/// Build tool a project uses, detected from its build files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    Gradle,
    Maven,
    Npm,
    Cargo,
    Unknown,
}

impl ProjectType {
    pub fn detect(project_path: &Path) -> Self {
        let has = |name: &str| project_path.join(name).exists();
        if has("build.gradle") || has("build.gradle.kts") {
            ProjectType::Gradle
        } else if has("pom.xml") {
            ProjectType::Maven
        } else if has("package.json") {
            ProjectType::Npm
        } else if has("Cargo.toml") {
            ProjectType::Cargo
        } else {
            ProjectType::Unknown
        }
    }

    // Parser to use for a configured command, judged by its program name.
    fn from_command(command: &str) -> Option<Self> {
        let program = command.split_whitespace().next()?;
        let program = program.rsplit('/').next().unwrap_or(program);
        match program {
            "gradle" | "gradlew" | "gradlew.bat" => Some(ProjectType::Gradle),
            "mvn" | "mvnw" => Some(ProjectType::Maven),
            "npm" | "npx" | "yarn" | "pnpm" | "jest" => Some(ProjectType::Npm),
            "cargo" => Some(ProjectType::Cargo),
            _ => None,
        }
    }

    pub fn default_test_command(self, project_path: &Path) -> Option<String> {
        match self {
            ProjectType::Gradle if project_path.join("gradlew").exists() => {
                Some("./gradlew test".to_string())
            }
            ProjectType::Gradle => Some("gradle test".to_string()),
            ProjectType::Maven => Some("mvn test".to_string()),
            ProjectType::Npm => Some("npm test".to_string()),
            ProjectType::Cargo => Some("cargo test".to_string()),
            ProjectType::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTest {
    pub class: String,
    pub name: String,
    pub message: String,
}

/// Outcome of one test command run. `passed` comes from the exit status;
/// the counts are whatever the tool's output reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestReport {
    pub passed: bool,
    pub total: u32,
    pub failed: u32,
    pub skipped: u32,
    pub failures: Vec<FailedTest>,
    pub output: String,
    pub duration: Duration,
}

impl TestReport {
    /// Report for a run that never produced test results.
    pub fn execution_failure(error: &CollaboratorError) -> Self {
        Self {
            passed: false,
            output: error.to_string(),
            ..Self::default()
        }
    }

    pub fn passed_count(&self) -> u32 {
        self.total.saturating_sub(self.failed + self.skipped)
    }

    pub fn summary(&self) -> String {
        if self.passed {
            format!("PASSED ({}/{} tests)", self.passed_count(), self.total)
        } else {
            format!(
                "FAILED ({} failures, {} passed)",
                self.failed,
                self.passed_count()
            )
        }
    }

    /// Fix context for the agent: counts, failed tests and the output tail.
    pub fn failure_summary(&self, max_lines: usize) -> String {
        let mut parts = vec![format!("Test Result: {}", self.summary()), String::new()];

        if !self.failures.is_empty() {
            parts.push("Failed Tests:".to_string());
            for failure in &self.failures {
                let name = if failure.class.is_empty() {
                    failure.name.clone()
                } else {
                    format!("{}.{}", failure.class, failure.name)
                };
                parts.push(format!("  - {name}: {}", failure.message));
            }
            parts.push(String::new());
        }

        let output = self.output.trim();
        if !output.is_empty() {
            let lines: Vec<&str> = output.lines().collect();
            if lines.len() > max_lines {
                parts.push(format!("Output (last {max_lines} lines):"));
                parts.extend(lines[lines.len() - max_lines..].iter().map(|l| l.to_string()));
            } else {
                parts.push("Full Output:".to_string());
                parts.extend(lines.iter().map(|l| l.to_string()));
            }
        }
        parts.join("\n")
    }
}

fn number(caps: &regex::Captures<'_>, group: usize) -> u32 {
    caps.get(group)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Fill counts and failures in `report` from the tool's output.
pub fn parse_output(report: &mut TestReport, output: &str, project_type: ProjectType) {
    match project_type {
        ProjectType::Gradle => {
            if let Some(caps) = GRADLE_SUMMARY.captures(output) {
                report.total = number(&caps, 1);
                report.failed = number(&caps, 2);
                report.skipped = number(&caps, 3);
            }
            report.failures = GRADLE_FAILURE
                .captures_iter(output)
                .map(|c| FailedTest {
                    class: c[1].to_string(),
                    name: c[2].to_string(),
                    message: "Test failed".to_string(),
                })
                .collect();
        }
        ProjectType::Maven => {
            // Surefire prints per-class lines first and the aggregate last.
            if let Some(caps) = MAVEN_SUMMARY.captures_iter(output).last() {
                report.total = number(&caps, 1);
                report.failed = number(&caps, 2) + number(&caps, 3);
                report.skipped = number(&caps, 4);
            }
            report.failures = MAVEN_FAILURE
                .captures_iter(output)
                .map(|c| FailedTest {
                    class: c[2].to_string(),
                    name: c[1].to_string(),
                    message: c[3].to_string(),
                })
                .collect();
        }
        ProjectType::Npm => {
            if let Some(caps) = JEST_SUMMARY.captures(output) {
                report.failed = number(&caps, 1);
                report.skipped = number(&caps, 2);
                report.total = number(&caps, 4);
            }
            report.failures = JEST_FAILURE
                .captures_iter(output)
                .map(|c| FailedTest {
                    class: String::new(),
                    name: c[1].to_string(),
                    message: "Test failed".to_string(),
                })
                .collect();
        }
        ProjectType::Cargo => {
            for caps in CARGO_SUMMARY.captures_iter(output) {
                let (passed, failed, ignored) =
                    (number(&caps, 1), number(&caps, 2), number(&caps, 3));
                report.total += passed + failed + ignored;
                report.failed += failed;
                report.skipped += ignored;
            }
            report.failures = CARGO_FAILURE
                .captures_iter(output)
                .map(|c| FailedTest {
                    class: String::new(),
                    name: c[1].to_string(),
                    message: "panicked".to_string(),
                })
                .collect();
        }
        ProjectType::Unknown => {}
    }
}

/// Operations the lifecycle needs from the test runner.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run `command` (or the detected default when `None`) in `project_path`.
    ///
    /// A failing test suite is `Ok` with `passed == false`; `Err` means the
    /// command could not be run to completion.
    async fn run(
        &self,
        command: Option<&str>,
        project_path: &Path,
    ) -> Result<TestReport, CollaboratorError>;
}

/// Runs the command as a child process, split on whitespace.
pub struct ShellTestRunner {
    timeout: Duration,
}

impl ShellTestRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TestRunner for ShellTestRunner {
    async fn run(
        &self,
        command: Option<&str>,
        project_path: &Path,
    ) -> Result<TestReport, CollaboratorError> {
        let detected = ProjectType::detect(project_path);
        let command = match command.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => c.to_string(),
            None => detected.default_test_command(project_path).ok_or_else(|| {
                CollaboratorError::ExecutionError(format!(
                    "cannot determine test command for {}",
                    project_path.display()
                ))
            })?,
        };
        let parser = ProjectType::from_command(&command).unwrap_or(detected);

        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(CollaboratorError::ExecutionError("empty command".to_string()));
        };
        info!(%command, cwd = %project_path.display(), "running tests");

        let started = Instant::now();
        let child = Command::new(program)
            .args(parts)
            .current_dir(project_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CollaboratorError::ExecutionError(format!("{program}: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(%command, "test command timed out");
                CollaboratorError::ExecutionError(format!(
                    "'{command}' timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| CollaboratorError::ExecutionError(e.to_string()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let mut report = TestReport {
            passed: output.status.success(),
            duration: started.elapsed(),
            ..TestReport::default()
        };
        parse_output(&mut report, &text, parser);
        report.output = text;

        debug!(?parser, total = report.total, failed = report.failed, "parsed test output");
        info!(result = %report.summary(), "tests finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(output: &str, project_type: ProjectType) -> TestReport {
        let mut report = TestReport::default();
        parse_output(&mut report, output, project_type);
        report
    }

    #[test]
    fn detects_project_types() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ProjectType::detect(dir.path()), ProjectType::Unknown);
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(ProjectType::detect(dir.path()), ProjectType::Npm);
        std::fs::write(dir.path().join("build.gradle.kts"), "").unwrap();
        assert_eq!(ProjectType::detect(dir.path()), ProjectType::Gradle);
        assert_eq!(
            ProjectType::Gradle.default_test_command(dir.path()).as_deref(),
            Some("gradle test")
        );
        std::fs::write(dir.path().join("gradlew"), "").unwrap();
        assert_eq!(
            ProjectType::Gradle.default_test_command(dir.path()).as_deref(),
            Some("./gradlew test")
        );
    }

    #[test]
    fn parser_follows_configured_program() {
        assert_eq!(
            ProjectType::from_command("./gradlew test --info"),
            Some(ProjectType::Gradle)
        );
        assert_eq!(ProjectType::from_command("mvn -q test"), Some(ProjectType::Maven));
        assert_eq!(ProjectType::from_command("make check"), None);
    }

    #[test]
    fn parses_gradle_output() {
        let output = "LoginTest > rejectsEmptyPassword FAILED\n\
                      java.lang.AssertionError\n\
                      5 tests completed, 1 failed, 1 skipped\n";
        let report = parsed(output, ProjectType::Gradle);
        assert_eq!((report.total, report.failed, report.skipped), (5, 1, 1));
        assert_eq!(report.passed_count(), 3);
        assert_eq!(report.failures[0].class, "LoginTest");
        assert_eq!(report.failures[0].name, "rejectsEmptyPassword");
    }

    #[test]
    fn parses_maven_aggregate_summary() {
        let output = "testLogin(com.acme.LoginTest)  Time elapsed: 0.1 s  <<< FAILURE!\n\
                      Tests run: 2, Failures: 1, Errors: 0, Skipped: 0\n\
                      Results:\n\
                      Tests run: 7, Failures: 1, Errors: 1, Skipped: 2\n";
        let report = parsed(output, ProjectType::Maven);
        assert_eq!((report.total, report.failed, report.skipped), (7, 2, 2));
        assert_eq!(report.failures[0].name, "testLogin");
        assert_eq!(report.failures[0].class, "com.acme.LoginTest");
        assert_eq!(report.failures[0].message, "FAILURE");
    }

    #[test]
    fn parses_jest_output() {
        let output = "  ✕ renders the form (12 ms)\n\
                      Tests:       1 failed, 5 passed, 6 total\n";
        let report = parsed(output, ProjectType::Npm);
        assert_eq!((report.total, report.failed), (6, 1));
        assert_eq!(report.failures[0].name, "renders the form");
    }

    #[test]
    fn parses_cargo_output_across_binaries() {
        let output = "---- tests::it_works stdout ----\n\
                      test result: FAILED. 3 passed; 1 failed; 0 ignored; 0 measured\n\
                      test result: ok. 2 passed; 0 failed; 1 ignored; 0 measured\n";
        let report = parsed(output, ProjectType::Cargo);
        assert_eq!((report.total, report.failed, report.skipped), (7, 1, 1));
        assert_eq!(report.failures[0].name, "tests::it_works");
    }

    #[test]
    fn failure_summary_keeps_output_tail() {
        let output: Vec<String> = (1..=60).map(|i| format!("line {i}")).collect();
        let report = TestReport {
            passed: false,
            total: 3,
            failed: 1,
            failures: vec![FailedTest {
                class: "LoginTest".into(),
                name: "works".into(),
                message: "Test failed".into(),
            }],
            output: output.join("\n"),
            ..TestReport::default()
        };
        let summary = report.failure_summary(50);
        assert!(summary.starts_with("Test Result: FAILED (1 failures, 2 passed)"));
        assert!(summary.contains("  - LoginTest.works: Test failed"));
        assert!(summary.contains("Output (last 50 lines):"));
        assert!(summary.contains("line 11"));
        assert!(!summary.contains("line 10\n"));
        assert!(summary.ends_with("line 60"));
    }

    #[tokio::test]
    async fn exit_status_decides_pass() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellTestRunner::new(Duration::from_secs(10));
        assert!(runner.run(Some("true"), dir.path()).await.unwrap().passed);
        assert!(!runner.run(Some("false"), dir.path()).await.unwrap().passed);
    }

    #[tokio::test]
    async fn unknown_project_without_command_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellTestRunner::new(Duration::from_secs(10));
        let err = runner.run(None, dir.path()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::ExecutionError(_)));
    }

    #[tokio::test]
    async fn missing_program_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellTestRunner::new(Duration::from_secs(10));
        let err = runner
            .run(Some("definitely-not-a-test-tool test"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::ExecutionError(_)));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellTestRunner::new(Duration::from_millis(100));
        let err = runner.run(Some("sleep 5"), dir.path()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::ExecutionError(msg) if msg.contains("timed out")));
    }
}
