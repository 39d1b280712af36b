//! scriptpad CLI - compile and run Rust snippets in isolation.

mod check;
mod colors;
mod output;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use scriptpad_core::compile::{CompilerConfig, OptimizationLevel};
use scriptpad_core::{
    Edition, EngineConfig, EngineDirs, HostKind, Reference, Script, ScriptConfig, ScriptKind,
};

#[derive(Parser)]
#[command(name = "scriptpad")]
#[command(about = "Compile and run Rust snippets in isolation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print events and diagnostics as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a script
    Run {
        #[command(flatten)]
        script: ScriptArgs,
    },

    /// Compile a script without running it
    Check {
        #[command(flatten)]
        script: ScriptArgs,
    },
}

/// Engine-wide settings.
#[derive(Args)]
pub struct EngineArgs {
    /// JSON engine configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root for build artifacts (defaults to the user cache dir)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Execution host: in-process or out-of-process
    #[arg(long, global = true)]
    host: Option<HostKind>,

    /// Build with optimizations
    #[arg(long, global = true)]
    release: bool,
}

impl EngineArgs {
    /// Resolve configuration: file, then `SCRIPTPAD_*` variables, then flags.
    pub fn load(&self) -> anyhow::Result<(EngineConfig, EngineDirs)> {
        let config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        let mut config = config.with_env_overrides()?;

        let dirs = if config.compiler.build_dir != CompilerConfig::default().build_dir {
            EngineDirs::from_build_dir(&config.compiler.build_dir)?
        } else {
            let dirs = match &self.cache_dir {
                Some(root) => EngineDirs::at(root)?,
                None => EngineDirs::user_default()?,
            };
            config.compiler.build_dir = dirs.build_dir.clone();
            dirs
        };

        if let Some(kind) = self.host {
            config.host.kind = kind;
        }
        if self.release {
            config.compiler.optimization = OptimizationLevel::Release;
        }
        Ok((config, dirs))
    }
}

/// Which script to use and how to wrap it.
#[derive(Args)]
pub struct ScriptArgs {
    /// Path to the script file
    script: PathBuf,

    /// statements or program
    #[arg(long, default_value = "statements")]
    kind: ScriptKind,

    /// Language edition
    #[arg(long, default_value = "2021")]
    edition: Edition,

    /// Namespace to import, e.g. std::collections::HashMap (repeatable)
    #[arg(long = "use", value_name = "PATH")]
    namespaces: Vec<String>,

    /// Compiled library to link against (repeatable)
    #[arg(long = "extern", value_name = "RLIB")]
    references: Vec<PathBuf>,
}

impl ScriptArgs {
    pub fn load(&self) -> anyhow::Result<Script> {
        let code = std::fs::read_to_string(&self.script)
            .with_context(|| format!("Script not found: {}", self.script.display()))?;
        let name = self
            .script
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string());

        let mut config = ScriptConfig::default()
            .with_kind(self.kind)
            .with_edition(self.edition);
        for namespace in &self.namespaces {
            config = config.with_namespace(namespace.clone());
        }
        for reference in &self.references {
            config = config.with_reference(Reference::file(reference));
        }

        Ok(Script::new(name, code)
            .with_path(&self.script)
            .with_config(config))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let ok = match &cli.command {
        Commands::Run { script } => run::execute(script, &cli.engine, cli.json).await?,
        Commands::Check { script } => check::execute(script, &cli.engine, cli.json).await?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
