//! Configuração do orquestrador carregada a partir de um arquivo TOML.
//!
//! A struct [`AppConfig`] contém todos os parâmetros configuráveis e é
//! carregada uma única vez na inicialização; depois disso é imutável e
//! compartilhada via `Arc`. Valores ausentes usam defaults sensíveis.
//! Segredos nunca ficam no arquivo: campos como `jira.api_token` devem
//! referenciar uma variável de ambiente (`${JIRA_API_TOKEN}`).

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::OrchestratorError;
use crate::state_machine::RetryPolicy;

// Referência `${VAR}` em qualquer posição de uma string.
/// Teto de `workflow.max_retries`.
const MAX_RETRIES_LIMIT: u32 = 100;

static ENV_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env reference regex"));

// Referência `${VAR}` ocupando a string inteira (obrigatório para segredos).
static SECRET_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_]*)\}$").expect("valid secret reference regex")
});

/// Backend de rastreamento de issues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    #[default]
    Jira,
    Redmine,
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerKind::Jira => write!(f, "Jira"),
            TrackerKind::Redmine => write!(f, "Redmine"),
        }
    }
}

/// Configuração de nível superior.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Tracker ativo por padrão; projetos podem sobrescrever.
    #[serde(default)]
    pub tracker: TrackerKind,

    #[serde(default)]
    pub jira: JiraConfig,

    #[serde(default)]
    pub redmine: RedmineConfig,

    #[serde(default)]
    pub bitbucket: BitbucketConfig,

    #[serde(default)]
    pub projects: Vec<ProjectConfig>,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub claude: ClaudeConfig,

    /// Arquivo JSON com o histórico das tarefas concluídas.
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JiraConfig {
    pub url: String,
    pub email: String,
    /// Deve ser uma referência `${VAR}`.
    pub api_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedmineConfig {
    pub url: String,
    /// Deve ser uma referência `${VAR}`.
    pub api_key: String,
    /// Nomes de status do workflow do Redmine.
    pub done_status: String,
    pub in_progress_status: String,
}

impl Default for RedmineConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            done_status: "Closed".to_string(),
            in_progress_status: "In Progress".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BitbucketConfig {
    pub workspace: String,
    pub username: String,
    /// Deve ser uma referência `${VAR}`.
    pub app_password: String,
    pub api_url: String,
    /// Branch de destino dos pull requests.
    pub base_branch: String,
}

impl Default for BitbucketConfig {
    fn default() -> Self {
        Self {
            workspace: String::new(),
            username: String::new(),
            app_password: String::new(),
            api_url: "https://api.bitbucket.org/2.0".to_string(),
            base_branch: "develop".to_string(),
        }
    }
}

/// Um projeto local no qual o agente trabalha.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub path: PathBuf,
    /// Comando de teste; sem ele o tipo de projeto é detectado.
    #[serde(default)]
    pub test_command: Option<String>,
    /// Executado antes dos testes quando presente.
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Prefixo das chaves de issue deste projeto (ex.: `DEV` em `DEV-123`).
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Sobrescreve o tracker global para este projeto.
    #[serde(default)]
    pub tracker: Option<TrackerKind>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Máximo de tentativas de correção antes de exigir revisão manual.
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub auto_create_pr: bool,
    pub auto_update_tracker: bool,
    pub done_status: String,
    pub in_progress_status: String,
    pub test_timeout_minutes: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_seconds: 10,
            auto_create_pr: true,
            auto_update_tracker: true,
            done_status: "Done".to_string(),
            in_progress_status: "In Progress".to_string(),
            test_timeout_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    pub cli_path: String,
    pub model: String,
    pub timeout_minutes: u64,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
            model: "sonnet".to_string(),
            timeout_minutes: 30,
        }
    }
}

// Valor padrão para o prefixo de branch: "feature".
fn default_branch_prefix() -> String {
    "feature".to_string()
}

// Valor padrão para o arquivo de histórico.
fn default_history_file() -> PathBuf {
    PathBuf::from("history.json")
}

/// Locais procurados quando `-c` não é informado, em ordem.
pub fn default_locations() -> Vec<PathBuf> {
    let mut locations = vec![
        PathBuf::from("config/config.toml"),
        PathBuf::from("config.toml"),
    ];
    if let Ok(home) = std::env::var("HOME") {
        locations.push(
            Path::new(&home)
                .join(".task-orchestrator")
                .join("config.toml"),
        );
    }
    locations
}

impl AppConfig {
    /// Carrega, resolve variáveis de ambiente e valida a configuração.
    ///
    /// Um caminho explícito inexistente é erro; sem caminho, o primeiro
    /// arquivo encontrado em [`default_locations`] é usado.
    pub fn load(path: Option<&Path>) -> Result<Self, OrchestratorError> {
        let path = match path {
            Some(p) if p.exists() => p.to_path_buf(),
            Some(p) => {
                return Err(OrchestratorError::Config(format!(
                    "config file {} does not exist",
                    p.display()
                )));
            }
            None => default_locations()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| {
                    OrchestratorError::Config(
                        "no config file found (tried config/config.toml, config.toml, \
                         ~/.task-orchestrator/config.toml)"
                            .to_string(),
                    )
                })?,
        };

        debug!(path = %path.display(), "loading configuration");
        let contents = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&contents, |name| std::env::var(name).ok())
    }

    /// Interpreta um documento TOML usando `lookup` para resolver `${VAR}`.
    pub fn from_toml_str(
        contents: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, OrchestratorError> {
        let mut config: AppConfig = toml::from_str(contents)?;
        config.resolve_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), OrchestratorError> {
        self.jira.api_token = resolve_secret("jira.api_token", &self.jira.api_token, lookup)?;
        self.redmine.api_key = resolve_secret("redmine.api_key", &self.redmine.api_key, lookup)?;
        self.bitbucket.app_password =
            resolve_secret("bitbucket.app_password", &self.bitbucket.app_password, lookup)?;

        for value in [
            &mut self.jira.url,
            &mut self.jira.email,
            &mut self.redmine.url,
            &mut self.bitbucket.workspace,
            &mut self.bitbucket.username,
            &mut self.bitbucket.api_url,
        ] {
            *value = expand_env(value, lookup);
        }
        for project in &mut self.projects {
            let expanded = expand_env(&project.path.to_string_lossy(), lookup);
            project.path = PathBuf::from(expanded);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), OrchestratorError> {
        if self.projects.is_empty() {
            return Err(OrchestratorError::Config(
                "at least one [[projects]] entry is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for project in &self.projects {
            if project.name.trim().is_empty() {
                return Err(OrchestratorError::Config(
                    "project name must not be empty".to_string(),
                ));
            }
            if project.path.as_os_str().is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "project '{}' has no path",
                    project.name
                )));
            }
            if !names.insert(project.name.to_lowercase()) {
                return Err(OrchestratorError::Config(format!(
                    "duplicate project name '{}'",
                    project.name
                )));
            }
        }

        if self.claude.timeout_minutes == 0 {
            return Err(OrchestratorError::Config(
                "claude.timeout_minutes must be greater than zero".to_string(),
            ));
        }
        if self.workflow.max_retries > MAX_RETRIES_LIMIT {
            return Err(OrchestratorError::Config(format!(
                "workflow.max_retries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }
        if self.workflow.test_timeout_minutes == 0 {
            return Err(OrchestratorError::Config(
                "workflow.test_timeout_minutes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Política de retentativa derivada de `[workflow]`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.workflow.max_retries,
            Duration::from_secs(self.workflow.retry_delay_seconds),
        )
    }

    /// Tracker efetivo de um projeto.
    pub fn tracker_for(&self, project: &ProjectConfig) -> TrackerKind {
        project.tracker.unwrap_or(self.tracker)
    }

    /// Status "concluído" no vocabulário do tracker.
    pub fn done_status(&self, tracker: TrackerKind) -> &str {
        match tracker {
            TrackerKind::Redmine => &self.redmine.done_status,
            TrackerKind::Jira => &self.workflow.done_status,
        }
    }

    /// Status "em andamento" no vocabulário do tracker.
    pub fn in_progress_status(&self, tracker: TrackerKind) -> &str {
        match tracker {
            TrackerKind::Redmine => &self.redmine.in_progress_status,
            TrackerKind::Jira => &self.workflow.in_progress_status,
        }
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Escolhe o projeto de uma issue pela chave.
    ///
    /// Ordem: `key_prefix` igual ao prefixo da chave (antes do `-`), nome do
    /// projeto igual ao prefixo, ou o único projeto configurado.
    pub fn project_for_issue(&self, issue_key: &str) -> Option<&ProjectConfig> {
        let prefix = issue_key
            .split_once('-')
            .map(|(prefix, _)| prefix)
            .unwrap_or(issue_key);

        self.projects
            .iter()
            .find(|p| {
                p.key_prefix
                    .as_deref()
                    .is_some_and(|k| k.eq_ignore_ascii_case(prefix))
            })
            .or_else(|| {
                self.projects
                    .iter()
                    .find(|p| p.name.eq_ignore_ascii_case(prefix))
            })
            .or_else(|| match self.projects.as_slice() {
                [only] => Some(only),
                _ => None,
            })
    }
}

/// Substitui cada `${VAR}` pelo valor da variável (vazio se ausente).
pub fn expand_env(value: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    ENV_REF
        .replace_all(value, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

// Segredos só podem vir do ambiente: vazio ou exatamente `${VAR}`.
fn resolve_secret(
    field: &str,
    raw: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, OrchestratorError> {
    if raw.is_empty() {
        return Ok(String::new());
    }
    match SECRET_REF.captures(raw) {
        Some(caps) => Ok(lookup(&caps[1]).unwrap_or_default()),
        None => Err(OrchestratorError::Config(format!(
            "{field} must reference an environment variable (e.g. \"${{MY_SECRET}}\"), \
             not contain the secret itself"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str) -> Option<String> {
        match name {
            "JIRA_TOKEN" => Some("jira-secret".to_string()),
            "BB_PASS" => Some("bb-secret".to_string()),
            "WORK" => Some("/work".to_string()),
            _ => None,
        }
    }

    const MINIMAL: &str = r#"
        [[projects]]
        name = "backend"
        path = "/src/backend"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = AppConfig::from_toml_str(MINIMAL, env).unwrap();
        assert_eq!(config.tracker, TrackerKind::Jira);
        assert_eq!(config.workflow.max_retries, 5);
        assert_eq!(config.workflow.retry_delay_seconds, 10);
        assert!(config.workflow.auto_create_pr);
        assert!(config.workflow.auto_update_tracker);
        assert_eq!(config.claude.timeout_minutes, 30);
        assert_eq!(config.claude.cli_path, "claude");
        assert_eq!(config.bitbucket.base_branch, "develop");
        assert_eq!(config.projects[0].branch_prefix, "feature");
        assert_eq!(config.history_file, PathBuf::from("history.json"));
    }

    #[test]
    fn full_config_with_env_references() {
        let toml_str = r#"
            tracker = "redmine"

            [jira]
            url = "https://acme.atlassian.net"
            email = "bot@acme.io"
            api_token = "${JIRA_TOKEN}"

            [bitbucket]
            workspace = "acme"
            username = "bot"
            app_password = "${BB_PASS}"

            [[projects]]
            name = "backend"
            path = "${WORK}/backend"
            test_command = "gradlew test"
            branch_prefix = "bugfix"
            key_prefix = "DEV"
            tracker = "jira"

            [workflow]
            max_retries = 2
            retry_delay_seconds = 0
            auto_update_tracker = false

            [claude]
            timeout_minutes = 5
        "#;
        let config = AppConfig::from_toml_str(toml_str, env).unwrap();
        assert_eq!(config.tracker, TrackerKind::Redmine);
        assert_eq!(config.jira.api_token, "jira-secret");
        assert_eq!(config.bitbucket.app_password, "bb-secret");
        assert_eq!(config.projects[0].path, PathBuf::from("/work/backend"));
        assert_eq!(config.tracker_for(&config.projects[0]), TrackerKind::Jira);
        assert_eq!(config.retry_policy().max_retries, 2);
        assert_eq!(config.retry_policy().delay, Duration::ZERO);
        assert!(!config.workflow.auto_update_tracker);
    }

    #[test]
    fn literal_secret_is_rejected() {
        let toml_str = r#"
            [jira]
            api_token = "plain-text-token"

            [[projects]]
            name = "backend"
            path = "/src/backend"
        "#;
        let err = AppConfig::from_toml_str(toml_str, env).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(msg) if msg.contains("jira.api_token")));
    }

    #[test]
    fn unknown_tracker_is_rejected() {
        let toml_str = r#"
            tracker = "trello"

            [[projects]]
            name = "backend"
            path = "/src/backend"
        "#;
        let err = AppConfig::from_toml_str(toml_str, env).unwrap_err();
        assert!(matches!(err, OrchestratorError::Toml(_)));
    }

    #[test]
    fn missing_projects_is_rejected() {
        let err = AppConfig::from_toml_str("tracker = \"jira\"", env).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn duplicate_project_names_are_rejected() {
        let toml_str = r#"
            [[projects]]
            name = "backend"
            path = "/a"

            [[projects]]
            name = "Backend"
            path = "/b"
        "#;
        assert!(AppConfig::from_toml_str(toml_str, env).is_err());
    }

    #[test]
    fn zero_agent_timeout_is_rejected() {
        let toml_str = format!("{MINIMAL}\n[claude]\ntimeout_minutes = 0\n");
        assert!(AppConfig::from_toml_str(&toml_str, env).is_err());
    }

    #[test]
    fn oversized_retry_budget_is_rejected() {
        let at_limit = format!("{MINIMAL}\n[workflow]\nmax_retries = 100\n");
        assert_eq!(
            AppConfig::from_toml_str(&at_limit, env).unwrap().workflow.max_retries,
            100
        );
        let oversized = format!("{MINIMAL}\n[workflow]\nmax_retries = 4294967295\n");
        let err = AppConfig::from_toml_str(&oversized, env).unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn status_names_follow_tracker() {
        let config = AppConfig::from_toml_str(MINIMAL, env).unwrap();
        assert_eq!(config.done_status(TrackerKind::Jira), "Done");
        assert_eq!(config.done_status(TrackerKind::Redmine), "Closed");
        assert_eq!(
            config.in_progress_status(TrackerKind::Redmine),
            "In Progress"
        );
    }

    #[test]
    fn project_for_issue_matching_order() {
        let toml_str = r#"
            [[projects]]
            name = "web"
            path = "/web"
            key_prefix = "FE"

            [[projects]]
            name = "api"
            path = "/api"
        "#;
        let config = AppConfig::from_toml_str(toml_str, env).unwrap();
        assert_eq!(config.project_for_issue("FE-12").unwrap().name, "web");
        assert_eq!(config.project_for_issue("api-3").unwrap().name, "api");
        assert!(config.project_for_issue("OPS-1").is_none());
        assert_eq!(config.project("API").unwrap().name, "api");
    }

    #[test]
    fn single_project_is_the_default() {
        let config = AppConfig::from_toml_str(MINIMAL, env).unwrap();
        assert_eq!(config.project_for_issue("12345").unwrap().name, "backend");
    }

    #[test]
    fn expand_env_replaces_missing_with_empty() {
        assert_eq!(expand_env("${WORK}/x/${NOPE}", &env), "/work/x/");
    }

    #[test]
    fn load_fails_for_missing_explicit_path() {
        let err = AppConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.projects.len(), 1);
    }
}
