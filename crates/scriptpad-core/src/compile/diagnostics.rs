//! Compiler diagnostics and mapping them back to the user's lines.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// A compiler message with source location information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Error message
    pub message: String,

    /// Error code (e.g., "E0425")
    pub code: Option<String>,

    /// Severity level
    pub severity: Severity,

    /// Primary location in the user's code.
    /// `None` when the diagnostic points into generated code or nowhere.
    pub location: Option<SourceLocation>,

    /// Additional labelled spans, mapped the same way
    pub spans: Vec<DiagnosticSpan>,

    /// Rendered message as rustc would print it
    pub rendered: Option<String>,
}

/// Severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Note,
    Help,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
            Severity::Help => "help",
        })
    }
}

/// A location in the user's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Line number (1-indexed)
    pub line: usize,

    /// Column number (1-indexed)
    pub column: usize,
}

/// A labelled span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticSpan {
    pub location: Option<SourceLocation>,
    pub label: Option<String>,
    pub is_primary: bool,
}

/// Rustc JSON diagnostic format.
#[derive(Debug, Deserialize)]
struct RustcDiagnostic {
    message: String,
    code: Option<RustcCode>,
    level: String,
    spans: Vec<RustcSpan>,
    rendered: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RustcCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct RustcSpan {
    line_start: usize,
    column_start: usize,
    is_primary: bool,
    label: Option<String>,
}

/// Maps rustc diagnostics onto the user's lines.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticMapper {
    /// Generated lines that hold user code. `None` maps lines one-to-one.
    user_lines: Option<Range<usize>>,
    /// Leading user lines emitted verbatim at the top of the source.
    lifted_lines: usize,
}

impl DiagnosticMapper {
    pub fn new(user_lines: Option<Range<usize>>) -> Self {
        Self {
            user_lines,
            lifted_lines: 0,
        }
    }

    pub fn with_lifted_lines(mut self, lifted_lines: usize) -> Self {
        self.lifted_lines = lifted_lines;
        self
    }

    /// Parse rustc JSON output and map diagnostics to user locations.
    pub fn parse_rustc_output(&self, json_output: &str) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        for line in json_output.lines() {
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<RustcDiagnostic>(line) {
                Ok(diagnostic) => {
                    if let Some(diagnostic) = self.map_diagnostic(&diagnostic) {
                        diagnostics.push(diagnostic);
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        "Failed to parse rustc JSON: {} (line: {})",
                        e,
                        line.chars().take(100).collect::<String>()
                    );
                }
            }
        }

        diagnostics
    }

    fn map_diagnostic(&self, diagnostic: &RustcDiagnostic) -> Option<Diagnostic> {
        let severity = match diagnostic.level.as_str() {
            "error" | "error: internal compiler error" => Severity::Error,
            "warning" => Severity::Warning,
            "note" => Severity::Note,
            "help" => Severity::Help,
            _ => return None,
        };

        // Summary lines repeat what the real diagnostics already said.
        if diagnostic.spans.is_empty() && diagnostic.message.starts_with("aborting due to") {
            return None;
        }

        let location = diagnostic
            .spans
            .iter()
            .find(|s| s.is_primary)
            .and_then(|span| self.map_location(span));

        let spans = diagnostic
            .spans
            .iter()
            .map(|span| DiagnosticSpan {
                location: self.map_location(span),
                label: span.label.clone(),
                is_primary: span.is_primary,
            })
            .collect();

        Some(Diagnostic {
            message: diagnostic.message.clone(),
            code: diagnostic.code.as_ref().map(|c| c.code.clone()),
            severity,
            location,
            spans,
            rendered: diagnostic.rendered.clone(),
        })
    }

    fn map_location(&self, span: &RustcSpan) -> Option<SourceLocation> {
        Some(SourceLocation {
            line: self.map_line(span.line_start)?,
            column: span.column_start,
        })
    }

    /// Map a generated line number to the user's line number.
    pub fn map_line(&self, generated_line: usize) -> Option<usize> {
        if generated_line >= 1 && generated_line <= self.lifted_lines {
            return Some(generated_line);
        }
        match &self.user_lines {
            Some(lines) if lines.contains(&generated_line) => {
                Some(generated_line - lines.start + 1)
            }
            Some(_) => None,
            None => Some(generated_line),
        }
    }

    /// Rewrite `script.rs:LINE:COL` references in runtime text to user lines.
    ///
    /// Lines outside the user's code are left alone.
    pub fn remap_locations(&self, text: &str) -> String {
        const MARKER: &str = "script.rs:";

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find(MARKER) {
            let (before, after) = rest.split_at(pos + MARKER.len());
            out.push_str(before);

            let digits = after.bytes().take_while(u8::is_ascii_digit).count();
            let mapped = after[..digits]
                .parse::<usize>()
                .ok()
                .and_then(|line| self.map_line(line));
            match mapped {
                Some(line) => out.push_str(&line.to_string()),
                None => out.push_str(&after[..digits]),
            }
            rest = &after[digits..];
        }
        out.push_str(rest);
        out
    }
}

impl Diagnostic {
    /// Create a diagnostic with just a message.
    pub fn simple(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            severity,
            location: None,
            spans: Vec::new(),
            rendered: None,
        }
    }

    /// Format the diagnostic for terminal display.
    pub fn format_terminal(&self) -> String {
        let mut output = String::new();

        let level_str = match self.severity {
            Severity::Error => "\x1b[1;31merror\x1b[0m",
            Severity::Warning => "\x1b[1;33mwarning\x1b[0m",
            Severity::Note => "\x1b[1;36mnote\x1b[0m",
            Severity::Help => "\x1b[1;32mhelp\x1b[0m",
        };

        if let Some(code) = &self.code {
            output.push_str(&format!("{level_str}[{code}]: {}\n", self.message));
        } else {
            output.push_str(&format!("{level_str}: {}\n", self.message));
        }

        if let Some(loc) = &self.location {
            output.push_str(&format!(
                "  \x1b[1;34m-->\x1b[0m line {}, column {}\n",
                loc.line, loc.column
            ));
        }

        output
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.severity)?;
        if let Some(code) = &self.code {
            write!(f, "[{}]", code)?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " (line {}, column {})", loc.line, loc.column)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNRESOLVED: &str = r#"{"message":"cannot find value `foobar` in this scope","code":{"code":"E0425"},"level":"error","spans":[{"file_name":"script.rs","line_start":12,"line_end":12,"column_start":1,"column_end":7,"is_primary":true,"label":"not found in this scope"}],"children":[],"rendered":"error[E0425]: cannot find value `foobar` in this scope"}"#;

    #[test]
    fn test_parse_rustc_json() {
        let mapper = DiagnosticMapper::new(Some(12..13));
        let diagnostics = mapper.parse_rustc_output(UNRESOLVED);

        assert_eq!(diagnostics.len(), 1);
        let d = &diagnostics[0];
        assert_eq!(d.code.as_deref(), Some("E0425"));
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.location, Some(SourceLocation { line: 1, column: 1 }));
        assert_eq!(d.spans[0].label.as_deref(), Some("not found in this scope"));
    }

    #[test]
    fn test_generated_code_has_no_location() {
        let mapper = DiagnosticMapper::new(Some(20..25));
        let diagnostics = mapper.parse_rustc_output(UNRESOLVED);

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].location, None);
    }

    #[test]
    fn test_skips_noise() {
        let output = format!(
            "{}\nnot json at all\n{}\n{}",
            UNRESOLVED,
            r#"{"message":"aborting due to 1 previous error","code":null,"level":"error","spans":[],"children":[],"rendered":"error: aborting due to 1 previous error"}"#,
            r#"{"message":"For more information about this error, try `rustc --explain E0425`.","code":null,"level":"failure-note","spans":[],"children":[],"rendered":null}"#,
        );

        let diagnostics = DiagnosticMapper::default().parse_rustc_output(&output);
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_line_mapping() {
        let mapper = DiagnosticMapper::new(Some(10..15));

        assert_eq!(mapper.map_line(10), Some(1));
        assert_eq!(mapper.map_line(14), Some(5));
        assert_eq!(mapper.map_line(15), None);
        assert_eq!(mapper.map_line(3), None);
        assert_eq!(DiagnosticMapper::default().map_line(3), Some(3));
    }

    #[test]
    fn test_lifted_lines_map_to_themselves() {
        let mapper = DiagnosticMapper::new(Some(20..30)).with_lifted_lines(2);

        assert_eq!(mapper.map_line(1), Some(1));
        assert_eq!(mapper.map_line(2), Some(2));
        assert_eq!(mapper.map_line(3), None);
        assert_eq!(mapper.map_line(22), Some(3));
    }

    #[test]
    fn test_remap_panic_locations() {
        let mapper = DiagnosticMapper::new(Some(10..15));
        let text = "panicked at script.rs:12:9:\nboom\nnote: script.rs:40:1";

        assert_eq!(
            mapper.remap_locations(text),
            "panicked at script.rs:3:9:\nboom\nnote: script.rs:40:1"
        );
    }

    #[test]
    fn test_diagnostic_format() {
        let diagnostic = Diagnostic {
            message: "test error".to_string(),
            code: Some("E0001".to_string()),
            severity: Severity::Error,
            location: Some(SourceLocation {
                line: 10,
                column: 5,
            }),
            spans: Vec::new(),
            rendered: None,
        };

        let formatted = diagnostic.format_terminal();
        assert!(formatted.contains("error"));
        assert!(formatted.contains("E0001"));
        assert!(formatted.contains("line 10, column 5"));
        assert_eq!(
            diagnostic.to_string(),
            "error[E0001]: test error (line 10, column 5)"
        );
    }
}
