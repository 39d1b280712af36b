//! Program wrapper: turns a raw snippet into one complete crate.
//!
//! The generated source has a fixed shape:
//!
//! ```text
//! <leading inner attributes>  (programs only, kept on their own lines)
//! // header, crate-level allows, `extern crate scriptpad_runtime;`
//! use <namespace>;            one line per namespace
//! use scriptpad_runtime::prelude::*;
//! macro_rules! println { .. } console macro overrides, one line each
//! <additional code>
//! fn __scriptpad_user_main() .. {     (statements only)
//! <user code>                 <- user_start_line
//! ;                           (statements only, ends a trailing expression)
//! }
//! #[unsafe(no_mangle)] pub unsafe extern "C" fn scriptpad_entry(..)
//! ```
//!
//! The console macros shadow the std ones by textual scope, so `println!`
//! and friends write to the log channel instead of process stdout.

use crate::error::WrapError;
use crate::script::ScriptKind;

/// Name of the generated function that holds a statements snippet.
pub const USER_MAIN: &str = "__scriptpad_user_main";

const CONSOLE_MACROS: &[&str] = &[
    "macro_rules! println { () => { ::scriptpad_runtime::console::write_line(\"\") }; ($($arg:tt)*) => { ::scriptpad_runtime::console::write_line(&::std::format!($($arg)*)) }; }",
    "macro_rules! print { ($($arg:tt)*) => { ::scriptpad_runtime::console::write(&::std::format!($($arg)*)) }; }",
    "macro_rules! eprintln { () => { ::scriptpad_runtime::console::write_error_line(\"\") }; ($($arg:tt)*) => { ::scriptpad_runtime::console::write_error_line(&::std::format!($($arg)*)) }; }",
    "macro_rules! eprint { ($($arg:tt)*) => { ::scriptpad_runtime::console::write_error(&::std::format!($($arg)*)) }; }",
];

/// A complete program produced from a snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedProgram {
    /// The full source text.
    pub source: String,
    /// 1-based line on which the user's code begins.
    pub user_start_line: usize,
    /// Number of lines the user's code occupies.
    pub user_line_count: usize,
    /// Leading lines of a program (inner attributes and comments) emitted
    /// at the top of the crate on their original line numbers.
    pub lifted_lines: usize,
}

impl WrappedProgram {
    /// Translate a line of the generated source to the user's line.
    ///
    /// Returns `None` for lines that belong to generated code.
    pub fn to_user_line(&self, generated_line: usize) -> Option<usize> {
        if generated_line >= 1 && generated_line <= self.lifted_lines {
            return Some(generated_line);
        }
        let end = self.user_start_line + self.user_line_count;
        (generated_line >= self.user_start_line && generated_line < end)
            .then(|| generated_line - self.user_start_line + 1)
    }
}

/// Source text that knows how many lines it holds.
struct SourceBuilder {
    text: String,
    lines: usize,
}

impl SourceBuilder {
    fn new() -> Self {
        Self {
            text: String::new(),
            lines: 0,
        }
    }

    fn next_line(&self) -> usize {
        self.lines + 1
    }

    fn line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        self.lines += 1;
    }

    /// Append a multi-line block, returning how many lines it took.
    fn block(&mut self, block: &str) -> usize {
        let mut count = 0;
        for line in block.lines() {
            self.line(line);
            count += 1;
        }
        count
    }
}

/// Wrap a snippet into a complete program.
///
/// Pure transform: no files are touched.
pub fn wrap(
    code: &str,
    kind: ScriptKind,
    namespaces: &[String],
    additional_code: &[String],
) -> Result<WrappedProgram, WrapError> {
    if kind == ScriptKind::Expression {
        return Err(WrapError::NotSupportedKind(kind));
    }

    let uses = namespace_uses(namespaces)?;
    let lifted_lines = match kind {
        ScriptKind::Program => leading_inner_attributes(code),
        _ => 0,
    };

    let mut src = SourceBuilder::new();
    for line in code.lines().take(lifted_lines) {
        src.line(line);
    }
    src.line("// Generated by scriptpad. Do not edit.");
    src.line("#![allow(unused_imports, unused_macros, unused_variables, unused_mut, unused_extern_crates, dead_code, unreachable_code, redundant_semicolons)]");
    src.line("extern crate scriptpad_runtime;");
    for use_line in &uses {
        src.line(use_line);
    }
    src.line("use ::scriptpad_runtime::prelude::*;");
    for line in CONSOLE_MACROS {
        src.line(line);
    }
    for fragment in additional_code {
        src.block(fragment);
    }

    let entry_target = match kind {
        ScriptKind::Statements => {
            src.line(&format!(
                "fn {}() -> ::std::result::Result<(), ::std::boxed::Box<dyn ::std::error::Error>> {{",
                USER_MAIN
            ));
            USER_MAIN
        }
        _ => "main",
    };

    let user_start_line = src.next_line();
    let user_line_count = if lifted_lines == 0 {
        src.block(code)
    } else {
        let body = code
            .lines()
            .enumerate()
            .map(|(i, line)| if i < lifted_lines { "" } else { line })
            .collect::<Vec<_>>()
            .join("\n");
        src.block(&body)
    };

    if kind == ScriptKind::Statements {
        src.line(";");
        src.line("::std::result::Result::Ok(())");
        src.line("}");
    }

    src.line("#[unsafe(no_mangle)]");
    src.line("pub unsafe extern \"C\" fn scriptpad_entry(host: *const ::scriptpad_runtime::HostCallbacks) -> i32 {");
    src.line(&format!(
        "    unsafe {{ ::scriptpad_runtime::run_entry(host, {}) }}",
        entry_target
    ));
    src.line("}");

    Ok(WrappedProgram {
        source: src.text,
        user_start_line,
        user_line_count,
        lifted_lines,
    })
}

/// Number of leading lines that must sit at the top of the crate: inner
/// attributes, inner doc comments, and the blanks and comments around them.
fn leading_inner_attributes(code: &str) -> usize {
    let mut lifted = 0;
    let mut depth = 0i32;
    for (i, line) in code.lines().enumerate() {
        let trimmed = line.trim();
        if depth > 0 {
            depth += bracket_balance(trimmed);
            if depth <= 0 {
                lifted = i + 1;
            }
        } else if trimmed.starts_with("#![") {
            depth = bracket_balance(trimmed);
            if depth <= 0 {
                lifted = i + 1;
            }
        } else if trimmed.starts_with("//!") {
            lifted = i + 1;
        } else if !(trimmed.is_empty() || trimmed.starts_with("//")) {
            break;
        }
    }
    if depth > 0 { 0 } else { lifted }
}

fn bracket_balance(line: &str) -> i32 {
    line.chars().fold(0, |depth, c| match c {
        '[' => depth + 1,
        ']' => depth - 1,
        _ => depth,
    })
}

/// Turn namespaces into `use` lines, dropping duplicates.
fn namespace_uses(namespaces: &[String]) -> Result<Vec<String>, WrapError> {
    let mut uses: Vec<String> = Vec::new();
    for raw in namespaces {
        let namespace = raw
            .trim()
            .trim_start_matches("use ")
            .trim_end_matches(';')
            .trim();
        if !is_valid_use_path(namespace) {
            return Err(WrapError::InvalidNamespace(raw.clone()));
        }
        let line = format!("use {};", namespace);
        if !uses.contains(&line) {
            uses.push(line);
        }
    }
    Ok(uses)
}

fn is_identifier(segment: &str) -> bool {
    let segment = segment.strip_prefix("r#").unwrap_or(segment);
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric()) && segment != "_"
}

/// Accepts `a::b::C`, `a::b::*`, `a::{b, c::D}` and `a::B as Alias`.
fn is_valid_use_path(path: &str) -> bool {
    let path = path.trim();
    let path = path.strip_prefix("::").unwrap_or(path);

    if let Some(brace) = path.find('{') {
        let (prefix, group) = path.split_at(brace);
        let Some(prefix) = prefix.strip_suffix("::") else {
            return false;
        };
        let Some(inner) = group.strip_prefix('{').and_then(|g| g.strip_suffix('}')) else {
            return false;
        };
        return is_plain_path(prefix)
            && !inner.trim().is_empty()
            && split_top_level(inner).into_iter().all(|item| {
                let item = item.trim();
                item.is_empty() || item == "self" || is_valid_use_path(item)
            });
    }

    let (path, alias) = match path.split_once(" as ") {
        Some((path, alias)) => (path.trim(), Some(alias.trim())),
        None => (path, None),
    };
    if let Some(alias) = alias
        && !is_identifier(alias)
    {
        return false;
    }

    match path.strip_suffix("::*") {
        Some(prefix) => alias.is_none() && is_plain_path(prefix),
        None => is_plain_path(path),
    }
}

fn is_plain_path(path: &str) -> bool {
    !path.is_empty() && path.split("::").all(is_identifier)
}

/// Split on commas that are not nested inside braces.
fn split_top_level(group: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in group.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(&group[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&group[start..]);
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_of(source: &str, needle: &str) -> usize {
        source
            .lines()
            .position(|line| line.contains(needle))
            .map(|i| i + 1)
            .unwrap()
    }

    #[test]
    fn test_statements_are_wrapped_in_entry_function() {
        let wrapped = wrap(
            "let x = 40 + 2;\nprintln!(\"{}\", x);",
            ScriptKind::Statements,
            &[],
            &[],
        )
        .unwrap();

        assert!(wrapped.source.contains("fn __scriptpad_user_main()"));
        assert!(wrapped.source.contains("run_entry(host, __scriptpad_user_main)"));
        assert_eq!(wrapped.user_line_count, 2);
        assert_eq!(
            line_of(&wrapped.source, "let x = 40 + 2;"),
            wrapped.user_start_line
        );
    }

    #[test]
    fn test_program_calls_main() {
        let wrapped = wrap("fn main() {}", ScriptKind::Program, &[], &[]).unwrap();

        assert!(!wrapped.source.contains(USER_MAIN));
        assert!(wrapped.source.contains("run_entry(host, main)"));
        assert_eq!(line_of(&wrapped.source, "fn main() {}"), wrapped.user_start_line);
    }

    #[test]
    fn test_trailing_expression_is_terminated() {
        let wrapped = wrap(
            "let v = vec![1, 2];\nv.dump()",
            ScriptKind::Statements,
            &[],
            &[],
        )
        .unwrap();

        let last_user_line = wrapped.user_start_line + wrapped.user_line_count - 1;
        let lines: Vec<&str> = wrapped.source.lines().collect();
        assert_eq!(lines[last_user_line - 1], "v.dump()");
        assert_eq!(lines[last_user_line], ";");
        assert_eq!(lines[last_user_line + 1], "::std::result::Result::Ok(())");
    }

    #[test]
    fn test_program_inner_attributes_lead_the_crate() {
        let code = "// setup\n#![allow(dead_code)]\n#![cfg_attr(\n    test,\n    allow(unused)\n)]\nfn main() {\n    dump(&1);\n}";
        let wrapped = wrap(code, ScriptKind::Program, &[], &[]).unwrap();
        let lines: Vec<&str> = wrapped.source.lines().collect();

        assert_eq!(wrapped.lifted_lines, 6);
        assert_eq!(lines[0], "// setup");
        assert_eq!(lines[1], "#![allow(dead_code)]");
        assert_eq!(lines[5], ")]");
        assert!(lines[6].starts_with("// Generated"));
        assert_eq!(wrapped.source.matches("#![allow(dead_code)]").count(), 1);

        assert_eq!(line_of(&wrapped.source, "fn main()"), wrapped.user_start_line + 6);
        assert_eq!(wrapped.user_line_count, 9);
        assert_eq!(wrapped.to_user_line(2), Some(2));
        assert_eq!(wrapped.to_user_line(wrapped.user_start_line + 7), Some(8));
        assert_eq!(wrapped.to_user_line(7), None);
    }

    #[test]
    fn test_statements_keep_inner_attributes_in_place() {
        let wrapped = wrap("#![allow(unused)]\nlet a = 1;", ScriptKind::Statements, &[], &[]).unwrap();

        assert_eq!(wrapped.lifted_lines, 0);
        assert_eq!(line_of(&wrapped.source, "#![allow(unused)]"), wrapped.user_start_line);
    }

    #[test]
    fn test_leading_inner_attributes() {
        assert_eq!(leading_inner_attributes("fn main() {}"), 0);
        assert_eq!(leading_inner_attributes("//! Docs\n\nfn main() {}"), 1);
        assert_eq!(leading_inner_attributes("// just a comment\nfn main() {}"), 0);
        assert_eq!(leading_inner_attributes("#![allow(\n    dead_code"), 0);
        assert_eq!(
            leading_inner_attributes("#![allow(dead_code)]\nfn main() {}\n#![allow(unused)]"),
            1
        );
    }

    #[test]
    fn test_expression_kind_is_rejected() {
        let err = wrap("1 + 1", ScriptKind::Expression, &[], &[]).unwrap_err();
        assert_eq!(err, WrapError::NotSupportedKind(ScriptKind::Expression));
    }

    #[test]
    fn test_namespaces_become_uses() {
        let namespaces = vec![
            "std::collections::HashMap".to_string(),
            "use std::fmt::Write;".to_string(),
            "std::collections::HashMap".to_string(),
            "std::io::*".to_string(),
            "std::sync::{Arc, Mutex}".to_string(),
            "std::{io::Read, fmt::{self, Display}}".to_string(),
            "std::io::Result as IoResult".to_string(),
        ];
        let wrapped = wrap("", ScriptKind::Statements, &namespaces, &[]).unwrap();

        assert_eq!(
            wrapped.source.matches("use std::collections::HashMap;").count(),
            1
        );
        assert!(wrapped.source.contains("use std::fmt::Write;"));
        assert!(wrapped.source.contains("use std::io::*;"));
        assert!(wrapped.source.contains("use std::sync::{Arc, Mutex};"));
        assert!(wrapped.source.contains("use std::{io::Read, fmt::{self, Display}};"));
        assert!(wrapped.source.contains("use std::io::Result as IoResult;"));
    }

    #[test]
    fn test_malformed_namespace_is_rejected() {
        for bad in ["", "std::", "std::collections::Hash Map", "1abc", "*", "std::{}"] {
            let err = wrap("", ScriptKind::Statements, &[bad.to_string()], &[]).unwrap_err();
            assert_eq!(err, WrapError::InvalidNamespace(bad.to_string()));
        }
    }

    #[test]
    fn test_additional_code_precedes_user_code() {
        let helper = "fn helper() -> u32 {\n    7\n}".to_string();
        let wrapped = wrap("helper();", ScriptKind::Statements, &[], &[helper]).unwrap();

        assert!(line_of(&wrapped.source, "fn helper()") < wrapped.user_start_line);
        assert_eq!(line_of(&wrapped.source, "helper();"), wrapped.user_start_line);
    }

    #[test]
    fn test_user_line_mapping() {
        let wrapped = wrap("a();\nb();\nc();", ScriptKind::Statements, &[], &[]).unwrap();
        let start = wrapped.user_start_line;

        assert_eq!(wrapped.to_user_line(start), Some(1));
        assert_eq!(wrapped.to_user_line(start + 2), Some(3));
        assert_eq!(wrapped.to_user_line(start + 3), None);
        assert_eq!(wrapped.to_user_line(1), None);
    }
}
