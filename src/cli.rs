//! Interface de linha de comando baseada em clap.
//!
//! Sem flags de modo, abre o modo interativo; `--run` executa uma única
//! issue e `--check` apenas verifica a conectividade.

use std::path::PathBuf;

use clap::Parser;

/// Orquestrador de tarefas: busca a issue, implementa com o agente, testa,
/// corrige e abre o pull request.
#[derive(Debug, Parser)]
#[command(name = "task-orchestrator", version, about)]
pub struct Cli {
    /// Caminho do arquivo de configuração (padrão: config/config.toml, config.toml, ~/.task-orchestrator/config.toml).
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Executa uma única issue até um estado terminal, sem interface interativa.
    #[arg(long, value_name = "ISSUE", conflicts_with = "check")]
    pub run: Option<String>,

    /// Projeto a usar com `--run` (padrão: deduzido da chave da issue).
    #[arg(long, short, value_name = "NAME", requires = "run")]
    pub project: Option<String>,

    /// Verifica a conexão com o agente, o tracker e o host git.
    #[arg(long, default_value_t = false)]
    pub check: bool,

    /// Habilita logs de depuração.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

/// Modo de execução selecionado pelas flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Interactive,
    Run {
        issue_key: String,
        project: Option<String>,
    },
    Check,
}

impl Cli {
    pub fn mode(&self) -> Mode {
        match (&self.run, self.check) {
            (Some(issue_key), _) => Mode::Run {
                issue_key: issue_key.clone(),
                project: self.project.clone(),
            },
            (None, true) => Mode::Check,
            (None, false) => Mode::Interactive,
        }
    }
}
