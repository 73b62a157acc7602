//! Interface de terminal: spinner de progresso e saída colorida.
//!
//! Usa `indicatif` para o spinner do modo `--run` e `console` para as cores.
//! As funções de formatação retornam `String` para que o modo interativo e
//! os testes possam reutilizá-las.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::OrchestratorEvent;
use crate::state_machine::{TaskRecord, TaskState, TaskView};

/// Estilo associado a um estado.
pub fn state_style(state: TaskState) -> Style {
    match state {
        TaskState::Completed => Style::new().green().bold(),
        TaskState::ManualReview | TaskState::MaxRetriesExceeded => Style::new().red().bold(),
        TaskState::Cancelled => Style::new().yellow(),
        TaskState::Fixing => Style::new().yellow(),
        TaskState::Pending => Style::new().dim(),
        _ => Style::new().cyan(),
    }
}

fn symbol(state: TaskState) -> &'static str {
    match state {
        TaskState::Completed => "✓",
        TaskState::ManualReview | TaskState::MaxRetriesExceeded => "✗",
        TaskState::Cancelled => "⊘",
        TaskState::Fixing => "↻",
        _ => "•",
    }
}

/// Uma linha por tarefa: chave, estado e resumo.
pub fn task_line(view: &TaskView) -> String {
    let style = state_style(view.state);
    let mut line = format!(
        "{} {:<10} {}",
        style.apply_to(symbol(view.state)),
        view.issue_key,
        style.apply_to(view.status_line())
    );
    if let Some(summary) = &view.summary {
        line.push_str(&format!("  {summary}"));
    }
    if let Some(url) = &view.pr_url {
        line.push_str(&format!("  {url}"));
    }
    if view.state.needs_attention() {
        if let Some(error) = &view.last_error {
            line.push_str(&format!("\n    {}", Style::new().red().apply_to(error)));
        }
    }
    line
}

/// Texto de um evento do orquestrador, ou `None` se não deve ser exibido.
pub fn event_line(event: &OrchestratorEvent) -> Option<String> {
    let dim = Style::new().dim();
    match event {
        OrchestratorEvent::Admitted(view) => Some(format!(
            "{} {} queued ({})",
            dim.apply_to("+"),
            view.issue_key,
            view.project
        )),
        OrchestratorEvent::StateChanged { task, from } => Some(format!(
            "{} {} {} → {}",
            state_style(task.state).apply_to(symbol(task.state)),
            task.issue_key,
            dim.apply_to(from),
            state_style(task.state).apply_to(task.status_line())
        )),
        OrchestratorEvent::Log { issue_key, message, .. } => {
            Some(format!("  {} {}", dim.apply_to(issue_key), dim.apply_to(message)))
        }
        OrchestratorEvent::Finished(view) | OrchestratorEvent::Withdrawn(view) => {
            Some(task_line(view))
        }
        OrchestratorEvent::Paused => Some(Style::new().yellow().apply_to("⏸ paused").to_string()),
        OrchestratorEvent::Resumed => Some(Style::new().green().apply_to("▶ resumed").to_string()),
    }
}

/// Linha resumida de um registro do histórico.
pub fn record_line(record: &TaskRecord) -> String {
    let style = state_style(record.final_state);
    let mut line = format!(
        "{} {:<10} {:<20} attempts {}/{}  {}",
        record.completed_at.format("%Y-%m-%d %H:%M"),
        record.issue_key,
        style.apply_to(record.final_state),
        record.attempts,
        record.max_retries,
        record.pr_url.as_deref().unwrap_or("-")
    );
    if let Some(error) = &record.error {
        line.push_str(&format!("\n    {error}"));
    }
    line
}

/// Resultado de uma verificação do `--check`.
pub fn check_line(name: &str, result: &Result<String, String>) -> String {
    match result {
        Ok(detail) => format!("{} {name}: {detail}", Style::new().green().bold().apply_to("OK  ")),
        Err(error) => format!("{} {name}: {error}", Style::new().red().bold().apply_to("FAIL")),
    }
}

/// Indicador visual de progresso de uma tarefa no modo `--run`.
///
/// Exibe um spinner durante a execução e, ao final, o estado terminal em
/// verde (concluída), vermelho (precisa de atenção) ou amarelo (cancelada).
pub struct TaskProgress {
    pb: ProgressBar,
}

impl TaskProgress {
    /// Inicia o spinner para a issue informada.
    pub fn start(issue_key: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        // Template fixo; um erro aqui só cairia no estilo padrão.
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{issue_key}: {}", TaskState::Pending));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb }
    }

    /// Reage a um evento: estados atualizam o spinner, logs são impressos acima dele.
    pub fn handle(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::StateChanged { task, .. } => {
                self.pb
                    .set_message(format!("{}: {}", task.issue_key, task.status_line()));
            }
            OrchestratorEvent::Log { message, .. } => {
                self.pb
                    .println(format!("  {}", Style::new().dim().apply_to(message)));
            }
            OrchestratorEvent::Paused | OrchestratorEvent::Resumed => {
                if let Some(line) = event_line(event) {
                    self.pb.println(line);
                }
            }
            _ => {}
        }
    }

    /// Remove o spinner sem resultado (erro antes da execução).
    pub fn abandon(&self) {
        self.pb.finish_and_clear();
    }

    /// Finaliza o spinner e exibe o resultado da tarefa.
    pub fn complete(&self, view: &TaskView) {
        self.pb.finish_and_clear();
        println!("{}", task_line(view));
    }

    /// Imprime o registro de auditoria em JSON.
    pub fn print_record(&self, record: &TaskRecord) {
        let style = state_style(record.final_state);
        println!();
        println!("{}", style.apply_to("─── Task Record ───"));
        println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{StateMachine, Task, TaskId, Transition};

    fn plain(text: String) -> String {
        console::strip_ansi_codes(&text).into_owned()
    }

    fn task() -> Task {
        let mut task = Task::new(TaskId::new(), "DEV-1".into(), "backend".into(), 2);
        task.summary = Some("Add login page".into());
        task
    }

    #[test]
    fn task_line_shows_error_when_attention_needed() {
        let mut task = task();
        StateMachine::apply(&mut task, Transition::advance(TaskState::Fetching, "go")).unwrap();
        StateMachine::apply(
            &mut task,
            Transition::fail(TaskState::ManualReview, "fetch failed: boom"),
        )
        .unwrap();

        let line = plain(task_line(&task.view()));
        assert!(line.starts_with("✗ DEV-1"));
        assert!(line.contains("MANUAL_REVIEW"));
        assert!(line.contains("Add login page"));
        assert!(line.contains("fetch failed: boom"));
    }

    #[test]
    fn state_change_event_names_both_states() {
        let mut task = task();
        let from =
            StateMachine::apply(&mut task, Transition::advance(TaskState::Fetching, "go")).unwrap();
        let event = OrchestratorEvent::StateChanged {
            task: task.view(),
            from,
        };
        let line = plain(event_line(&event).unwrap());
        assert_eq!(line, "• DEV-1 PENDING → FETCHING");
    }

    #[test]
    fn record_line_includes_attempts_and_url() {
        let mut task = task();
        task.pr_url = Some("https://bitbucket.org/acme/backend/pull-requests/7".into());
        StateMachine::apply(&mut task, Transition::advance(TaskState::Cancelled, "x")).unwrap();
        let line = plain(record_line(&TaskRecord::from_task(&task)));
        assert!(line.contains("DEV-1"));
        assert!(line.contains("CANCELLED"));
        assert!(line.contains("attempts 0/2"));
        assert!(line.ends_with("pull-requests/7"));
    }

    #[test]
    fn check_line_marks_failures() {
        assert_eq!(
            plain(check_line("tracker", &Ok("Jira: Ada".into()))),
            "OK   tracker: Jira: Ada"
        );
        assert_eq!(
            plain(check_line("agent", &Err("not found".into()))),
            "FAIL agent: not found"
        );
    }
}
