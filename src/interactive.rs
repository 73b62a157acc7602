//! Interactive observer loop: line commands on stdin, events on stdout.

use std::str::FromStr;

use anyhow::{Context, Result};
use console::Style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::orchestrator::Orchestrator;
use crate::ui;

const HISTORY_LINES: usize = 10;

const HELP: &str = "\
commands:
  add <KEY> [project]   queue an issue
  cancel <KEY>          cancel a queued or running task
  pause | resume        hold or release the queue at the next state boundary
  status                active and queued tasks
  history               last finished tasks
  help                  this text
  quit                  stop and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    Add {
        issue_key: String,
        project: Option<String>,
    },
    Cancel(String),
    Pause,
    Resume,
    Status,
    History,
    Help,
    Quit,
}

impl FromStr for UiCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Err("empty command".to_string());
        };
        let args: Vec<&str> = words.collect();

        let parsed = match (command.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("add", [key]) => UiCommand::Add {
                issue_key: key.to_string(),
                project: None,
            },
            ("add", [key, project]) => UiCommand::Add {
                issue_key: key.to_string(),
                project: Some(project.to_string()),
            },
            ("add", _) => return Err("usage: add <KEY> [project]".to_string()),
            ("cancel", [key]) => UiCommand::Cancel(key.to_string()),
            ("cancel", _) => return Err("usage: cancel <KEY>".to_string()),
            ("pause", []) => UiCommand::Pause,
            ("resume", []) => UiCommand::Resume,
            ("status" | "ls", []) => UiCommand::Status,
            ("history", []) => UiCommand::History,
            ("help" | "?", []) => UiCommand::Help,
            ("quit" | "exit" | "q", []) => UiCommand::Quit,
            (other, _) => return Err(format!("unknown command '{other}' (try 'help')")),
        };
        Ok(parsed)
    }
}

/// Apply one command. Returns `false` when the loop should stop.
async fn execute(orchestrator: &Orchestrator, command: UiCommand) -> bool {
    let red = Style::new().red();
    match command {
        UiCommand::Add { issue_key, project } => {
            let admitted = match project {
                Some(project) => orchestrator.enqueue_for_project(&issue_key, Some(&project)),
                None => orchestrator.enqueue(&issue_key),
            };
            if let Err(e) = admitted {
                println!("{}", red.apply_to(e));
            }
        }
        UiCommand::Cancel(issue_key) => {
            if let Err(e) = orchestrator.cancel_issue(&issue_key).await {
                println!("{}", red.apply_to(e));
            }
        }
        UiCommand::Pause => orchestrator.pause(),
        UiCommand::Resume => orchestrator.resume(),
        UiCommand::Status => {
            let tasks = orchestrator.snapshot();
            if tasks.is_empty() {
                println!("no active or queued tasks");
            }
            for view in &tasks {
                println!("{}", ui::task_line(view));
            }
            if orchestrator.is_paused() {
                println!("{}", Style::new().yellow().apply_to("(paused)"));
            }
        }
        UiCommand::History => match orchestrator.history(HISTORY_LINES).await {
            Ok(records) if records.is_empty() => println!("no history yet"),
            Ok(records) => {
                for record in &records {
                    println!("{}", ui::record_line(record));
                }
            }
            Err(e) => println!("{}", red.apply_to(format!("history unavailable: {e}"))),
        },
        UiCommand::Help => println!("{HELP}"),
        UiCommand::Quit => return false,
    }
    true
}

/// Run the queue in the background and serve commands until `quit`, EOF or
/// Ctrl-C. Any running task is dropped on exit.
pub async fn run(orchestrator: Orchestrator) -> Result<()> {
    let mut events = orchestrator.subscribe();
    let worker = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    println!(
        "{} {} project(s) configured, type 'help' for commands",
        Style::new().bold().apply_to("task-orchestrator"),
        orchestrator.config().projects.len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<UiCommand>() {
                    Ok(command) => {
                        if !execute(&orchestrator, command).await {
                            break;
                        }
                    }
                    Err(message) => println!("{}", Style::new().red().apply_to(message)),
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = ui::event_line(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event display fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    worker.abort();
    if let Some(active) = orchestrator.active() {
        warn!(issue = %active.issue_key, state = %active.state, "exiting with a task in progress");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<UiCommand, String> {
        line.parse()
    }

    #[test]
    fn parses_add_with_optional_project() {
        assert_eq!(
            parse("add DEV-1").unwrap(),
            UiCommand::Add {
                issue_key: "DEV-1".into(),
                project: None
            }
        );
        assert_eq!(
            parse("  ADD 42 backend ").unwrap(),
            UiCommand::Add {
                issue_key: "42".into(),
                project: Some("backend".into())
            }
        );
        assert!(parse("add").unwrap_err().starts_with("usage"));
        assert!(parse("add a b c").is_err());
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse("cancel DEV-9").unwrap(), UiCommand::Cancel("DEV-9".into()));
        assert_eq!(parse("pause").unwrap(), UiCommand::Pause);
        assert_eq!(parse("resume").unwrap(), UiCommand::Resume);
        assert_eq!(parse("status").unwrap(), UiCommand::Status);
        assert_eq!(parse("history").unwrap(), UiCommand::History);
        assert_eq!(parse("?").unwrap(), UiCommand::Help);
        assert_eq!(parse("exit").unwrap(), UiCommand::Quit);
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert_eq!(
            parse("deploy now").unwrap_err(),
            "unknown command 'deploy' (try 'help')"
        );
        assert!(parse("pause now").is_err());
        assert!(parse("cancel").is_err());
        assert!(parse("").is_err());
    }

    #[tokio::test]
    async fn commands_drive_the_orchestrator() {
        use crate::config::AppConfig;
        use crate::runner::tests::Harness;
        use crate::tracker::TrackerSet;
        use std::sync::Arc;

        let dir = tempfile::TempDir::new().unwrap();
        let harness = Harness::new();
        let config = AppConfig::from_toml_str(
            &format!(
                "history_file = \"{}\"\n[[projects]]\nname = \"backend\"\npath = \"/b\"\n",
                dir.path().join("h.json").display()
            ),
            |_| None,
        )
        .unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(config),
            TrackerSet::new().with(harness.tracker.clone()),
            harness.services(),
        );

        let add = UiCommand::Add {
            issue_key: "DEV-1".into(),
            project: None,
        };
        assert!(execute(&orchestrator, add).await);
        assert!(execute(&orchestrator, UiCommand::Pause).await);
        assert!(orchestrator.is_paused());
        assert!(execute(&orchestrator, UiCommand::Cancel("dev-1".into())).await);
        assert!(orchestrator.snapshot().is_empty());
        assert!(execute(&orchestrator, UiCommand::History).await);
        assert!(!execute(&orchestrator, UiCommand::Quit).await);
    }
}
