//! `scriptpad check`: compile a script and report diagnostics.

use scriptpad_core::{CompilationInput, CompilerService, wrap};

use crate::output::print_diagnostics;
use crate::{EngineArgs, ScriptArgs, colors};

/// Compile a script. Returns whether it compiled without errors.
pub async fn execute(args: &ScriptArgs, engine: &EngineArgs, json: bool) -> anyhow::Result<bool> {
    let script = args.load()?;
    let (config, _dirs) = engine.load()?;

    let wrapped = wrap(
        &script.code,
        script.config.kind,
        &script.config.namespaces,
        &[],
    )?;
    let input = CompilationInput::from_wrapped(&wrapped)
        .with_references(script.config.references.iter().cloned())
        .with_edition(script.config.edition)
        .with_optimization(config.compiler.optimization);

    let compiler = CompilerService::new(config.compiler)?;
    let result = tokio::task::spawn_blocking(move || compiler.compile(&input)).await??;

    print_diagnostics(&result.diagnostics, json);

    if !json {
        let errors = result.errors().count();
        let warnings = result.warnings().count();
        if result.success {
            eprintln!(
                "{}Compiled{} {} ({} warning{})",
                colors::GREEN,
                colors::RESET,
                script.name,
                warnings,
                if warnings == 1 { "" } else { "s" }
            );
        } else {
            eprintln!(
                "{}Failed{} {}: {} error{}",
                colors::RED,
                colors::RESET,
                script.name,
                errors,
                if errors == 1 { "" } else { "s" }
            );
        }
    }
    Ok(result.success)
}
