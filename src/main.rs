//! CLI entry point for relay.

mod cli;

use clap::Parser;
use relay::api::HttpModelClient;
use relay::config::{load_config, Config};
use relay::permission::PermissionHandle;
use relay::runtime::{RunEvent, RunOutcome, SessionRuntime};
use relay::tools::clock::ClockTool;
use relay::tools::ToolRegistry;
use relay::wal::ConversationLog;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries only the answer.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let loaded = match load_config(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    debug!(source = ?loaded.source, "config loaded");
    let mut config = loaded.config;
    apply_cli_overrides(&mut config, &args);

    if let Some(cli::Command::Log { dir, prune }) = args.command {
        let dir = dir.unwrap_or_else(|| config.wal.dir.clone());
        std::process::exit(run_log_command(dir, prune));
    }

    let Some(prompt) = args.prompt.filter(|p| !p.trim().is_empty()) else {
        eprintln!("error: no prompt given. Usage: relay [OPTIONS] <PROMPT>");
        std::process::exit(2);
    };
    if config.api.api_key.is_empty() {
        eprintln!(
            "error: no API key configured. Set RELAY_API_KEY, [api].api_key, or the variable named by [api].api_key_env."
        );
        std::process::exit(1);
    }

    let mut tools = ToolRegistry::new();
    if let Err(e) = tools.register(ClockTool) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let client = Arc::new(HttpModelClient::new(&config.api));
    let mut runtime = SessionRuntime::new(&config, client, tools);
    if config.wal.enabled && !runtime.reload_from_log() {
        warn!(dir = %config.wal.dir.display(), "starting without previous conversation");
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    runtime.set_cancellation_receiver(Some(cancel_rx.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let handle = runtime.permission_handle();
    let (result, ()) = tokio::join!(
        runtime.run(&prompt, &events_tx),
        render_events(events_rx, handle, cancel_rx)
    );

    let code = match result {
        Ok(summary) => match summary.outcome {
            RunOutcome::Completed => 0,
            RunOutcome::MaxIterations => {
                eprintln!("warning: stopped after {} model calls without an answer", summary.iterations);
                3
            }
            RunOutcome::Cancelled => {
                eprintln!("cancelled");
                130
            }
            RunOutcome::Failed { error } => {
                eprintln!("error: {error}");
                1
            }
        },
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(code);
}

fn apply_cli_overrides(config: &mut Config, args: &cli::Args) {
    if let Some(model) = &args.model {
        config.api.model = model.clone();
    }
    if let Some(url) = &args.base_url {
        config.api.base_url = url.clone();
    }
    if let Some(max) = args.max_iterations {
        config.agent.max_iterations = max.max(1);
    }
}

/// Print run events until `done`, answering permission questions from stdin.
async fn render_events(
    mut events: mpsc::UnboundedReceiver<RunEvent>,
    handle: PermissionHandle,
    mut cancel: watch::Receiver<bool>,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            RunEvent::Thinking { iteration } => debug!(iteration, "thinking"),
            RunEvent::AnswerStart => {}
            RunEvent::AnswerDelta { text } => {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            RunEvent::ToolStart {
                tool_id, arguments, ..
            } => eprintln!("> {tool_id} {arguments}"),
            RunEvent::ToolEnd { tool_id, output, .. } => {
                eprintln!("< {tool_id}: {}", first_line(&output));
            }
            RunEvent::ToolError { tool_id, error, .. } => {
                eprintln!("! {tool_id}: {}", first_line(&error));
            }
            RunEvent::PermissionRequest {
                tool_id, arguments, ..
            } => {
                let reply = ask_operator(&mut stdin, &mut cancel, &tool_id, &arguments).await;
                if let Some((allowed, always)) = reply {
                    handle.respond(&tool_id, allowed, always);
                }
            }
            RunEvent::ContextCleared(report) => eprintln!(
                "(context pruned: {} messages removed, ~{} -> ~{} tokens)",
                report.removed_messages, report.estimated_before, report.estimated_after
            ),
            RunEvent::Done(summary) => {
                if summary.answer.is_some() {
                    let _ = writeln!(stdout);
                }
                break;
            }
        }
    }
}

/// `y` allows once, `a` always allows this tool, anything else denies.
///
/// Returns `None` when the run is cancelled while waiting; the runtime has
/// already withdrawn the question by then.
async fn ask_operator<R: AsyncBufRead + Unpin>(
    input: &mut Lines<R>,
    cancel: &mut watch::Receiver<bool>,
    tool_id: &str,
    arguments: &str,
) -> Option<(bool, bool)> {
    eprint!("allow `{tool_id}` with {arguments}? [y/n/a] ");
    let answer = tokio::select! {
        line = input.next_line() => line.ok().flatten().unwrap_or_default(),
        () = cancelled(cancel) => {
            eprintln!();
            return None;
        }
    };
    Some(match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => (true, false),
        "a" | "always" => (true, true),
        _ => (false, false),
    })
}

/// Resolves once cancellation is signalled; never if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

fn run_log_command(dir: PathBuf, prune: Option<usize>) -> i32 {
    let mut log = ConversationLog::new(&dir);
    if !log.recover() {
        eprintln!("error: failed to recover conversation log in {}", dir.display());
        return 1;
    }
    if let Some(keep) = prune {
        let removed = log.prune(keep);
        println!("pruned {removed} entries; {} remain", log.len());
        return 0;
    }
    for entry in log.entries() {
        match serde_json::to_string(&entry) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to encode log entry"),
        }
    }
    eprintln!(
        "{} entries, ~{} tokens, {} sealed segments",
        log.len(),
        log.total_tokens(),
        log.sealed_segments()
    );
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn operator_reply_maps_to_decision() {
        let (_tx, mut cancel) = watch::channel(false);
        let mut input = BufReader::new(&b"a\nno\n"[..]).lines();
        assert_eq!(
            ask_operator(&mut input, &mut cancel, "clock", "{}").await,
            Some((true, true))
        );
        assert_eq!(
            ask_operator(&mut input, &mut cancel, "clock", "{}").await,
            Some((false, false))
        );
    }

    #[tokio::test]
    async fn cancel_interrupts_a_blocked_prompt() {
        let (tx, mut cancel) = watch::channel(false);
        // The writer half stays open, so the read never completes.
        let (_writer, reader) = tokio::io::duplex(64);
        let mut input = BufReader::new(reader).lines();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            ask_operator(&mut input, &mut cancel, "clock", "{}"),
        )
        .await
        .expect("prompt returned after cancel");
        assert_eq!(reply, None);
    }
}
