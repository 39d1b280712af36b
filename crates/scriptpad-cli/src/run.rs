//! `scriptpad run`: compile and execute a script, streaming its output.

use std::io::{BufRead, Write};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use scriptpad_core::{EnvironmentEvent, RunOptions, RunResult, ScriptEnvironment, Session};

use crate::output::{print_event, print_json, print_lifecycle};
use crate::{EngineArgs, ScriptArgs, colors};

/// Run a script. Returns whether it completed successfully.
pub async fn execute(args: &ScriptArgs, engine: &EngineArgs, json: bool) -> anyhow::Result<bool> {
    let script = args.load()?;
    let (config, dirs) = engine.load()?;
    let session = Session::new(config, dirs)?;
    session.warm_pool().await?;

    let environment = session.open(script)?;

    let mut output = environment.subscribe_output();
    let printer = tokio::spawn(async move {
        while let Some(event) = output.recv().await {
            print_event(&event, json);
        }
    });

    let mut events = environment.subscribe_events();
    let input_target = environment.clone();
    let lifecycle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    print_lifecycle(&event, json);
                    match &event {
                        EnvironmentEvent::InputRequested { prompt, .. } => {
                            answer_from_stdin(input_target.clone(), prompt.clone(), json);
                        }
                        EnvironmentEvent::Disposed { .. } => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} lifecycle events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let run = environment.run(RunOptions::default());
    tokio::pin!(run);
    let mut interrupted = false;
    let result = loop {
        tokio::select! {
            result = &mut run => break result?,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if environment.cancel() {
                    eprintln!("{}Stopping...{}", colors::YELLOW, colors::RESET);
                }
            }
        }
    };

    session.close_all().await;
    let _ = printer.await;
    let _ = lifecycle.await;

    if json {
        print_json(&result);
    } else {
        print_summary(&result);
    }
    Ok(result.is_success())
}

/// Read one line from stdin on a blocking thread and hand it to the script.
fn answer_from_stdin(environment: Arc<ScriptEnvironment>, prompt: String, json: bool) {
    tokio::task::spawn_blocking(move || {
        if !json {
            eprint!("{}", prompt);
            let _ = std::io::stderr().flush();
        }
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) => tracing::debug!("stdin closed while the script waits for input"),
            Ok(_) => {
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if let Err(e) = environment.provide_input(line) {
                    tracing::debug!("Input not delivered: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to read input: {}", e),
        }
    });
}

fn print_summary(result: &RunResult) {
    if result.is_run_cancelled {
        eprintln!(
            "{}Cancelled{} after {:.1} ms",
            colors::YELLOW,
            colors::RESET,
            result.duration_ms
        );
    } else if result.is_success() {
        eprintln!(
            "{}{}Completed{} in {:.1} ms",
            colors::BOLD,
            colors::GREEN,
            colors::RESET,
            result.duration_ms
        );
    } else if !result.is_run_attempt_successful {
        eprintln!("{}Run failed{}", colors::RED, colors::RESET);
    } else {
        eprintln!(
            "{}Script failed{} after {:.1} ms",
            colors::RED,
            colors::RESET,
            result.duration_ms
        );
    }
}
