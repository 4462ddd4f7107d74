mod app;
mod cli;
mod domain;
mod infra;

use crate::app::{ControllerError, MonitorSnapshot, SessionController};
use crate::cli::CliInvocation;
use crate::domain::{ConnectionState, ReconnectPolicy};
use crate::infra::{ApiClient, ResolveConfigError, SseEventSource, resolve_config};
use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ResolveConfigError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("failed to build tokio runtime: {0}")]
    Runtime(String),
}

fn main() {
    if let Err(error) = run_main() {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "{error}");
        std::process::exit(1);
    }
}

fn run_main() -> Result<(), MainError> {
    let args = std::env::args().collect::<Vec<_>>();
    let invocation = match crate::cli::parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}");
            let _ = writeln!(err);
            print_help();
            std::process::exit(2);
        }
    };

    match invocation {
        CliInvocation::PrintHelp => {
            print_help();
            Ok(())
        }
        CliInvocation::PrintVersion => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliInvocation::Monitor {
            session_id,
            base_url,
            token,
        } => {
            init_tracing();
            let config = resolve_config(base_url.as_deref(), token.as_deref())?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|error| MainError::Runtime(error.to_string()))?;
            runtime.block_on(run_monitor(config, session_id))
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("watchpost=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run_monitor(
    config: crate::infra::MonitorConfig,
    session_id: String,
) -> Result<(), MainError> {
    let api = ApiClient::new(&config);
    let source = Arc::new(SseEventSource::new(&config));
    let mut controller = SessionController::new(api, source, ReconnectPolicy::default());
    let mut updates = controller.subscribe();

    controller.select_session_by_id(&session_id).await?;

    {
        let snapshot = controller.snapshot();
        let mut out = io::stdout().lock();
        if let Some(session) = &snapshot.session {
            let _ = writeln!(
                out,
                "session {} mode={} iteration={} hat={}",
                session.id,
                session.mode.label(),
                session.iteration,
                session.hat
            );
        }
        let _ = writeln!(out, "state: {}", describe(&snapshot.connection));
    }

    let mut rendered = controller.snapshot();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                render_update(&rendered, &snapshot);
                if matches!(snapshot.connection, ConnectionState::Error { .. }) {
                    rendered = snapshot;
                    break;
                }
                rendered = snapshot;
            }
        }
    }

    controller.cancel();

    let metrics = controller.metrics();
    let mut out = io::stdout().lock();
    let _ = writeln!(
        out,
        "totals: input_tokens={} output_tokens={} cost_usd={} duration_ms={}",
        metrics.input_tokens,
        metrics.output_tokens,
        metrics
            .estimated_cost_usd
            .map(|cost| format!("{cost:.4}"))
            .unwrap_or_else(|| "-".to_string()),
        metrics
            .duration_ms
            .map(|ms| format!("{ms:.0}"))
            .unwrap_or_else(|| "-".to_string()),
    );
    Ok(())
}

fn render_update(previous: &MonitorSnapshot, current: &MonitorSnapshot) {
    let mut out = io::stdout().lock();

    if current.connection != previous.connection {
        let _ = writeln!(out, "state: {}", describe(&current.connection));
    }

    // Events are newest-first; print the new head chronologically.
    let fresh = current.events.len().saturating_sub(previous.events.len());
    for record in current.events[..fresh].iter().rev() {
        if record.payload.is_empty() {
            let _ = writeln!(out, "{} {}", record.timestamp, record.topic);
        } else {
            let _ = writeln!(out, "{} {} {}", record.timestamp, record.topic, record.payload);
        }
    }

    if fresh > 0 && current.metrics != previous.metrics {
        let _ = writeln!(
            out,
            "tokens: in={} out={}",
            current.metrics.input_tokens, current.metrics.output_tokens
        );
    }
}

fn describe(connection: &ConnectionState) -> String {
    match connection {
        ConnectionState::Reconnecting { attempt } => {
            format!("reconnecting (attempt {attempt})")
        }
        ConnectionState::Error { message } => format!("error: {message}"),
        other => other.label().to_string(),
    }
}

fn print_help() {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "watchpost - live monitor for orchestrator sessions");
    let _ = writeln!(out);
    let _ = writeln!(out, "Usage: watchpost [OPTIONS] <SESSION_ID>");
    let _ = writeln!(out);
    let _ = writeln!(out, "Options:");
    let _ = writeln!(out, "  --base-url <URL>   Backend base URL (or WATCHPOST_BASE_URL)");
    let _ = writeln!(out, "  --token <TOKEN>    Bearer credential (or WATCHPOST_TOKEN)");
    let _ = writeln!(out, "  -h, --help         Print help");
    let _ = writeln!(out, "  -V, --version      Print version");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Streams a session's workflow events and keeps running token totals."
    );
    let _ = writeln!(
        out,
        "Sessions in mode=complete with no local pause/resume state are shown"
    );
    let _ = writeln!(out, "as disconnected and never opened for streaming.");
}
