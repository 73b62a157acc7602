//! Diagnostic tracing to stderr.
//!
//! Task progress for humans goes through [`crate::ui`]; this is for
//! operators and `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "task_orchestrator=debug,info"
    } else {
        "task_orchestrator=info,warn"
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `--debug` picks between info and
/// debug for this crate. Output: stderr, compact format.
///
/// ```bash
/// RUST_LOG=task_orchestrator::runner=trace task-orchestrator --run DEV-1
/// ```
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
