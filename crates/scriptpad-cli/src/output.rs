//! Terminal and JSON rendering of engine output.

use scriptpad_core::{Diagnostic, EnvironmentEvent, OutputChannel, OutputEvent, OutputPayload, Severity};

use crate::colors;

/// Print one output event as it arrives.
pub fn print_event(event: &OutputEvent, json: bool) {
    if json {
        print_json(event);
        return;
    }

    match &event.payload {
        OutputPayload::Text { text, stderr: false } => {
            print!("{}", text);
            colors::flush_stdout();
        }
        OutputPayload::Text { text, stderr: true } => {
            eprint!("{}{}{}", colors::DIM, text, colors::RESET);
        }
        OutputPayload::Value {
            type_name,
            title,
            debug,
        } => {
            let heading = title.as_deref().unwrap_or(type_name.as_str());
            println!(
                "{}{}{} {}({}){}",
                colors::BOLD,
                heading,
                colors::RESET,
                colors::DIM,
                type_name,
                colors::RESET
            );
            for line in debug.lines() {
                println!("  {}", line);
            }
        }
        OutputPayload::Html { fragment } => {
            println!("{}[html]{} {}", colors::CYAN, colors::RESET, fragment);
        }
        OutputPayload::Error { message } => {
            eprintln!("{}{}{}", colors::RED, message.trim_end(), colors::RESET);
        }
        OutputPayload::Warning { message } => {
            eprintln!("{}warning:{} {}", colors::YELLOW, colors::RESET, message);
        }
    }

    if event.channel != OutputChannel::LOG && event.channel != OutputChannel::RESULTS {
        tracing::debug!("Event on custom channel {}", event.channel);
    }
}

/// Print a lifecycle event. Only shown with `--json` or at debug level.
pub fn print_lifecycle(event: &EnvironmentEvent, json: bool) {
    if json {
        print_json(event);
    } else {
        tracing::debug!("{:?}", event);
    }
}

pub fn print_diagnostics(diagnostics: &[Diagnostic], json: bool) {
    for diagnostic in diagnostics {
        if json {
            print_json(diagnostic);
        } else if diagnostic.severity == Severity::Error || diagnostic.severity == Severity::Warning {
            eprint!("{}", diagnostic.format_terminal());
        }
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!("Failed to serialize output: {}", e),
    }
}
