mod agent;
mod check;
mod cli;
mod config;
mod error;
mod git;
mod git_host;
mod interactive;
mod logging;
mod orchestrator;
mod runner;
mod state_machine;
mod test_runner;
mod tracker;
mod ui;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use tracing::info;

use agent::ClaudeCli;
use cli::{Cli, Mode};
use config::AppConfig;
use git_host::BitbucketHost;
use orchestrator::Orchestrator;
use runner::Services;
use state_machine::TaskState;
use test_runner::ShellTestRunner;
use tracker::TrackerSet;

/// Exit status for configuration errors.
const CONFIG_ERROR: u8 = 2;

fn build_services(config: &AppConfig) -> Result<Services> {
    let git = BitbucketHost::new(&config.bitbucket).context("failed to build Bitbucket client")?;
    Ok(Services {
        agent: Arc::new(ClaudeCli::new(&config.claude)),
        tests: Arc::new(ShellTestRunner::new(Duration::from_secs(
            config.workflow.test_timeout_minutes * 60,
        ))),
        git: Arc::new(git),
    })
}

async fn run_one(
    orchestrator: &Orchestrator,
    issue_key: &str,
    project: Option<&str>,
) -> Result<ExitCode> {
    let progress = ui::TaskProgress::start(issue_key);
    let mut events = orchestrator.subscribe();

    let run = orchestrator.run_single(issue_key, project);
    tokio::pin!(run);
    let view = loop {
        tokio::select! {
            result = &mut run => break result,
            Ok(event) = events.recv() => progress.handle(&event),
        }
    };
    let view = match view {
        Ok(view) => view,
        Err(e) => {
            progress.abandon();
            return Err(e).context(format!("could not run {issue_key}"));
        }
    };

    progress.complete(&view);
    if let Some(record) = orchestrator
        .history(1)
        .await
        .ok()
        .and_then(|records| records.into_iter().next())
        .filter(|record| record.issue_key == view.issue_key)
    {
        progress.print_record(&record);
    }

    Ok(if view.state == TaskState::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run(mode: Mode, config: Arc<AppConfig>) -> Result<ExitCode> {
    let trackers = TrackerSet::from_config(&config).context("failed to build tracker clients")?;
    let services = build_services(&config)?;

    if mode != Mode::Check {
        let missing: Vec<_> = config
            .projects
            .iter()
            .filter(|p| trackers.get(config.tracker_for(p)).is_err())
            .map(|p| format!("{} ({})", p.name, config.tracker_for(p)))
            .collect();
        if !missing.is_empty() {
            eprintln!(
                "{} no tracker configured for project(s): {}",
                Style::new().red().bold().apply_to("error:"),
                missing.join(", ")
            );
            return Ok(ExitCode::from(CONFIG_ERROR));
        }
    }

    match mode {
        Mode::Check => {
            let results = check::run_checks(&config, &trackers, &services).await;
            for check in &results {
                println!("{}", ui::check_line(&check.name, &check.result));
            }
            Ok(if results.iter().all(|c| c.ok()) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Mode::Run { issue_key, project } => {
            let orchestrator = Orchestrator::new(config, trackers, services);
            run_one(&orchestrator, &issue_key, project.as_deref()).await
        }
        Mode::Interactive => {
            interactive::run(Orchestrator::new(config, trackers, services)).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.debug);
    let red = Style::new().red().bold();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{} {e}", red.apply_to("error:"));
            return ExitCode::from(CONFIG_ERROR);
        }
    };
    info!(projects = config.projects.len(), tracker = %config.tracker, "configuration loaded");

    match run(cli.mode(), config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", red.apply_to("error:"));
            ExitCode::FAILURE
        }
    }
}
