//! The execution host contract: load, run, unload.

use std::path::PathBuf;
use std::sync::Arc;

use super::arena::ModuleArena;
use super::context::RunContext;
use super::in_process::InProcessHost;
use super::out_of_process::{LifetimeCallback, OutOfProcessHost};
use super::result::RunResult;
use crate::compile::CompiledModule;
use crate::config::{HostConfig, HostKind};
use crate::error::{Error, Result};
use crate::ipc::ScriptHostPool;
use crate::paths::EngineDirs;

/// A module loaded for exactly one run.
#[derive(Debug)]
pub struct ModuleHandle {
    name: String,
    user_start_line: Option<usize>,
    loaded: Loaded,
}

#[derive(Debug)]
enum Loaded {
    Arena(ModuleArena),
    File { dir: PathBuf, path: PathBuf },
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One of the two execution strategies.
#[derive(Debug)]
pub enum ExecutionHost {
    InProcess(InProcessHost),
    OutOfProcess(OutOfProcessHost),
}

impl ExecutionHost {
    pub fn for_kind(
        config: &HostConfig,
        dirs: &EngineDirs,
        pool: Option<Arc<ScriptHostPool>>,
    ) -> Self {
        match config.kind {
            HostKind::InProcess => ExecutionHost::InProcess(InProcessHost::new(
                dirs.arena_dir.clone(),
                config.cancel_grace_period(),
            )),
            HostKind::OutOfProcess => ExecutionHost::OutOfProcess(OutOfProcessHost::new(
                config.clone(),
                dirs.host_dir.clone(),
                pool,
            )),
        }
    }

    pub fn kind(&self) -> HostKind {
        match self {
            ExecutionHost::InProcess(_) => HostKind::InProcess,
            ExecutionHost::OutOfProcess(_) => HostKind::OutOfProcess,
        }
    }

    /// Observe host process starts and exits. In-process hosts have none.
    pub fn set_lifetime_callback(&mut self, callback: LifetimeCallback) {
        if let ExecutionHost::OutOfProcess(host) = self {
            host.set_lifetime_callback(callback);
        }
    }

    pub async fn load(&mut self, module: &CompiledModule, ctx: &RunContext) -> Result<ModuleHandle> {
        let loaded = match self {
            ExecutionHost::InProcess(host) => Loaded::Arena(host.load(module, ctx)?),
            ExecutionHost::OutOfProcess(host) => {
                let (dir, path) = host.load(module, ctx).await?;
                Loaded::File { dir, path }
            }
        };
        Ok(ModuleHandle {
            name: module.name.clone(),
            user_start_line: module.user_start_line,
            loaded,
        })
    }

    pub async fn run(&mut self, handle: &mut ModuleHandle, ctx: RunContext) -> RunResult {
        let user_start_line = handle.user_start_line;
        match (self, &mut handle.loaded) {
            (ExecutionHost::InProcess(host), Loaded::Arena(arena)) => {
                host.run(arena, user_start_line, ctx).await
            }
            (ExecutionHost::OutOfProcess(host), Loaded::File { path, .. }) => {
                host.run(&handle.name, path, user_start_line, ctx).await
            }
            _ => RunResult::run_attempt_failure("Module was loaded by a different host"),
        }
    }

    pub async fn unload(&mut self, handle: ModuleHandle) -> Result<()> {
        match (self, handle.loaded) {
            (ExecutionHost::InProcess(host), Loaded::Arena(arena)) => host.unload(arena).await,
            (ExecutionHost::OutOfProcess(host), Loaded::File { dir, .. }) => host.unload(&dir).await,
            _ => Err(Error::InvalidOperation(format!(
                "Module {} was loaded by a different host",
                handle.name
            ))),
        }
    }

    /// Stop any host process. Idempotent.
    pub async fn shutdown(&mut self) {
        if let ExecutionHost::OutOfProcess(host) = self {
            host.shutdown().await;
        }
    }
}
