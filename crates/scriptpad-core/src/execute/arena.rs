//! Disposable load contexts for compiled modules.
//!
//! Every load gets a fresh directory and a uniquely named module file, so the
//! dynamic loader never hands back a handle from an earlier run. Unloading
//! closes every library the arena opened and deletes the directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use libloading::Library;
use rustc_hash::FxHashMap;
use scriptpad_runtime::{ENTRY_SYMBOL, EntryFn};
use uuid::Uuid;

use super::ffi::{CallbackContext, ExecutionStatus, OutputSink};
use super::result::RunResult;
use crate::compile::{DiagnosticMapper, dylib_extension, dylib_prefix};
use crate::error::{Error, Result};
use crate::output::{OutputChannel, OutputPayload};
use crate::script::ScriptId;

const SCRIPT_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Counts the modules resident in this process, per script.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    counts: Mutex<FxHashMap<ScriptId, usize>>,
}

static REGISTRY: LazyLock<ModuleRegistry> = LazyLock::new(ModuleRegistry::default);

impl ModuleRegistry {
    /// The process-wide registry.
    pub fn global() -> &'static ModuleRegistry {
        &REGISTRY
    }

    /// Number of modules currently loaded for `script_id`.
    pub fn resident(&self, script_id: ScriptId) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&script_id)
            .copied()
            .unwrap_or(0)
    }

    fn register(&'static self, script_id: ScriptId) -> Registration {
        *self
            .counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(script_id)
            .or_insert(0) += 1;
        Registration {
            registry: self,
            script_id,
        }
    }
}

/// Decrements the registry when the module's library is finally closed.
#[derive(Debug)]
struct Registration {
    registry: &'static ModuleRegistry,
    script_id: ScriptId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut counts = self.registry.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(&self.script_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.script_id);
            }
        }
    }
}

/// A loaded module. Fields drop in order: library first, then registration.
struct ResidentModule {
    library: Library,
    _registration: Registration,
}

/// What the module's entry point reported.
#[derive(Debug, Clone)]
pub struct ModuleOutcome {
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub restart_requested: bool,
    pub duration_ms: f64,
}

impl ModuleOutcome {
    /// Convert to a [`RunResult`], mapping error locations to the user's lines.
    pub fn into_run_result(self, user_start_line: Option<usize>) -> RunResult {
        let mapper = DiagnosticMapper::new(user_start_line.map(|start| start..usize::MAX));
        match self.status {
            ExecutionStatus::Success => RunResult::success(self.duration_ms),
            ExecutionStatus::Cancelled => RunResult::cancelled(self.duration_ms),
            ExecutionStatus::ScriptError | ExecutionStatus::Panic => {
                let message = mapper.remap_locations(
                    self.error.as_deref().unwrap_or("Script failed without an error message"),
                );
                RunResult::script_completion_failure(self.duration_ms, message)
            }
            ExecutionStatus::AbiMismatch => {
                RunResult::run_attempt_failure("Module was built against a different script runtime")
            }
        }
    }
}

/// The error event a finished run publishes on the log channel, if any.
pub fn error_event(result: &RunResult) -> Option<(OutputChannel, OutputPayload)> {
    if result.is_run_cancelled {
        return None;
    }
    result
        .error
        .as_ref()
        .map(|message| (OutputChannel::LOG, OutputPayload::error(message.clone())))
}

/// A disposable load context holding one module.
pub struct ModuleArena {
    name: String,
    dir: PathBuf,
    module: Option<Arc<ResidentModule>>,
    preloaded: Vec<Library>,
    runner: Option<JoinHandle<()>>,
    abandoned: bool,
}

impl ModuleArena {
    /// Write `bytes` into a fresh arena under `root` and open it.
    ///
    /// Dylibs found in `probing_paths` are opened first and stay open until
    /// the arena is unloaded.
    pub fn load(
        root: &Path,
        script_id: ScriptId,
        name: &str,
        bytes: &[u8],
        probing_paths: &[PathBuf],
    ) -> Result<Self> {
        let dir = root.join(format!("arena-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&dir)?;

        let mut arena = Self {
            name: name.to_string(),
            dir,
            module: None,
            preloaded: Vec::new(),
            runner: None,
            abandoned: false,
        };

        arena.preload(probing_paths)?;

        let path = arena.dir.join(format!(
            "{}{}-{}.{}",
            dylib_prefix(),
            name,
            Uuid::new_v4().simple(),
            dylib_extension()
        ));
        fs::write(&path, bytes)?;

        // SAFETY: the module was produced by our compiler against the runtime
        // ABI; its initializers only set up the runtime's statics.
        let library = unsafe { Library::new(&path) }?;
        // Resolve now so a module without an entry point fails at load.
        unsafe { library.get::<EntryFn>(ENTRY_SYMBOL) }.map_err(|e| {
            Error::Execution(format!("Module {} has no entry point: {}", name, e))
        })?;

        arena.module = Some(Arc::new(ResidentModule {
            library,
            _registration: ModuleRegistry::global().register(script_id),
        }));
        tracing::debug!("Loaded module {} from {}", name, path.display());
        Ok(arena)
    }

    fn preload(&mut self, probing_paths: &[PathBuf]) -> Result<()> {
        let suffix = format!(".{}", dylib_extension());
        for dir in probing_paths {
            let Ok(entries) = fs::read_dir(dir) else {
                tracing::warn!("Skipping missing probing path {}", dir.display());
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() && path.to_string_lossy().ends_with(&suffix) {
                    // SAFETY: probing dylibs are supplied by the caller as trusted references.
                    let library = unsafe { Library::new(&path) }?;
                    self.preloaded.push(library);
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run the module on a dedicated thread.
    ///
    /// `on_done` is called on that thread with the outcome, after the thread
    /// has released its hold on the module.
    pub fn start<F>(&mut self, sink: Arc<dyn OutputSink>, on_done: F) -> Result<()>
    where
        F: FnOnce(ModuleOutcome) + Send + 'static,
    {
        if self.runner.is_some() {
            return Err(Error::InvalidOperation(format!(
                "Module {} is already running",
                self.name
            )));
        }
        let module = self
            .module
            .clone()
            .ok_or_else(|| Error::InvalidOperation(format!("Module {} is unloaded", self.name)))?;

        let runner = thread::Builder::new()
            .name(format!("scriptpad-{}", self.name))
            .stack_size(SCRIPT_STACK_SIZE)
            .spawn(move || {
                let context = CallbackContext::new(sink);
                let table = context.callbacks();
                let started = Instant::now();

                // SAFETY: resolved at load; `module` keeps the library mapped
                // for the whole call.
                let code = match unsafe { module.library.get::<EntryFn>(ENTRY_SYMBOL) } {
                    Ok(entry) => unsafe { entry(&table) },
                    Err(_) => scriptpad_runtime::status::ABI_MISMATCH,
                };

                let outcome = ModuleOutcome {
                    status: ExecutionStatus::from(code),
                    error: context.take_error(),
                    restart_requested: context.restart_requested(),
                    duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                };
                drop(context);
                drop(module);
                on_done(outcome);
            })?;

        self.runner = Some(runner);
        Ok(())
    }

    /// Give up on a run that ignored cancellation.
    ///
    /// The runner thread is detached and keeps the module mapped until it
    /// returns; unloading the arena no longer waits for it.
    pub fn abandon(&mut self) {
        if self.runner.take().is_some() {
            tracing::warn!("Abandoning module {} still running after cancellation", self.name);
            self.abandoned = true;
        }
    }

    /// Close every library and delete the arena directory.
    pub fn unload(mut self) -> Result<()> {
        self.teardown()
    }

    /// Idempotent; safe to call again after a partial failure.
    fn teardown(&mut self) -> Result<()> {
        if let Some(runner) = self.runner.take()
            && runner.join().is_err()
        {
            tracing::warn!("Runner thread for {} panicked", self.name);
        }

        let mut first_error: Option<Error> = None;

        // An abandoned runner still holds the module; it closes on thread exit.
        if let Some(module) = self.module.take()
            && let Ok(ResidentModule {
                library,
                _registration,
            }) = Arc::try_unwrap(module)
            && let Err(e) = library.close()
        {
            first_error.get_or_insert(e.into());
        }

        for library in self.preloaded.drain(..) {
            if let Err(e) = library.close() {
                first_error.get_or_insert(e.into());
            }
        }

        if self.dir.exists()
            && let Err(e) = fs::remove_dir_all(&self.dir)
        {
            // Windows refuses to delete a mapped module.
            if !self.abandoned {
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ModuleArena {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!("Failed to unload module {}: {}", self.name, e);
        }
    }
}

impl std::fmt::Debug for ModuleArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleArena")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("abandoned", &self.abandoned)
            .finish()
    }
}
