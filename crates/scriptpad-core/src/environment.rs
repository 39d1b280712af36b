//! Per-script orchestration: wrap, compile, execute.
//!
//! A [`ScriptEnvironment`] owns one script, its execution host and its output
//! hub. It runs one thing at a time and publishes status changes on a
//! broadcast channel.
//!
//! ```text
//!            run (compile ok)              success / cancelled
//!  Ready ─────────────────────► Running ─────────────────────► Ready
//!    ▲  │                          │ cancel                      ▲
//!    │  │ wrap/compile failure     ▼                             │
//!    │  └──────────────► Error   Stopping ─────────────────────┘
//!    └────── run ─────────┘        │ failure
//!                                  └──────────────────────────► Error
//! ```

use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};

use crate::compile::{CompilationInput, CompilerService, Diagnostic};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::execute::{CancelHandle, ExecutionHost, InputBroker, RunContext, RunResult};
use crate::ipc::ScriptHostPool;
use crate::output::{OutputChannel, OutputHub, OutputPayload, OutputPipeline, OutputSubscription};
use crate::paths::EngineDirs;
use crate::script::{RunId, RunOptions, Script, ScriptId};
use crate::wrap::wrap;

const EVENT_CAPACITY: usize = 256;

/// Where an environment is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Idle, including after a successful or cancelled run.
    #[default]
    Ready,
    /// Compiled and executing.
    Running,
    /// Cancellation requested; waiting for the host to stop.
    Stopping,
    /// The last run failed.
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ready => write!(f, "ready"),
            Status::Running => write!(f, "running"),
            Status::Stopping => write!(f, "stopping"),
            Status::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EnvironmentEvent {
    StatusChanged {
        script_id: ScriptId,
        old: Status,
        new: Status,
    },
    RunCompleted {
        script_id: ScriptId,
        run_id: RunId,
        result: RunResult,
    },
    RunDurationChanged {
        script_id: ScriptId,
        duration_ms: f64,
    },
    /// The running script is blocked reading a line of input.
    InputRequested { script_id: ScriptId, prompt: String },
    /// A host process started or exited.
    HostLifetime { script_id: ScriptId, running: bool },
    Disposed { script_id: ScriptId },
}

/// Commands from the UI side.
#[derive(Debug, Clone)]
pub enum EnvironmentCommand {
    Run(RunOptions),
    Cancel,
    /// Answer a pending [`EnvironmentEvent::InputRequested`].
    ProvideInput(String),
}

#[derive(Debug, Default)]
struct State {
    status: Status,
    in_flight: bool,
    /// Runs admitted and not yet done publishing their completion.
    active_runs: usize,
    disposed: bool,
    cancel: Option<CancelHandle>,
    last_result: Option<RunResult>,
    last_diagnostics: Vec<Diagnostic>,
    last_run_id: Option<RunId>,
}

/// Clears the in-flight flag however the run ends, including a dropped future.
struct InFlight<'a> {
    state: &'a Mutex<State>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight = false;
        state.cancel = None;
    }
}

/// Counts a run as active until `run` returns or its future is dropped.
struct RunSlot<'a> {
    state: &'a Mutex<State>,
    idle: &'a Notify,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active_runs -= 1;
        if state.active_runs == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// Orchestrator and state machine for one open script.
pub struct ScriptEnvironment {
    script_id: ScriptId,
    script: RwLock<Script>,
    state: Mutex<State>,
    idle: Notify,
    host: tokio::sync::Mutex<ExecutionHost>,
    events: broadcast::Sender<EnvironmentEvent>,
    input: Arc<InputBroker>,
    output: OutputHub,
    compiler: Arc<CompilerService>,
    config: EngineConfig,
}

impl ScriptEnvironment {
    pub fn new(
        script: Script,
        compiler: Arc<CompilerService>,
        config: EngineConfig,
        dirs: &EngineDirs,
        pool: Option<Arc<ScriptHostPool>>,
    ) -> Self {
        let script_id = script.id();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut host = ExecutionHost::for_kind(&config.host, dirs, pool);
        let lifetime_events = events.clone();
        host.set_lifetime_callback(Arc::new(move |running| {
            let _ = lifetime_events.send(EnvironmentEvent::HostLifetime { script_id, running });
        }));

        let input = Arc::new(InputBroker::new());
        let input_events = events.clone();
        input.set_announcer(Arc::new(move |prompt: &str| {
            let _ = input_events.send(EnvironmentEvent::InputRequested {
                script_id,
                prompt: prompt.to_string(),
            });
        }));

        Self {
            script_id,
            script: RwLock::new(script),
            state: Mutex::new(State::default()),
            idle: Notify::new(),
            host: tokio::sync::Mutex::new(host),
            events,
            input,
            output: OutputHub::new(config.output.clone()),
            compiler,
            config,
        }
    }

    pub fn script_id(&self) -> ScriptId {
        self.script_id
    }

    /// A copy of the script as it is now.
    pub fn script(&self) -> Script {
        self.script.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Edit the script. Runs already in flight keep the code they started with.
    pub fn update_script(&self, f: impl FnOnce(&mut Script)) -> Result<()> {
        self.ensure_alive()?;
        f(&mut self.script.write().unwrap_or_else(|e| e.into_inner()));
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.lock_state().status
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().in_flight
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_state().disposed
    }

    pub fn last_result(&self) -> Option<RunResult> {
        self.lock_state().last_result.clone()
    }

    /// Diagnostics from the most recent compile, warnings included.
    pub fn last_diagnostics(&self) -> Vec<Diagnostic> {
        self.lock_state().last_diagnostics.clone()
    }

    pub fn last_run_id(&self) -> Option<RunId> {
        self.lock_state().last_run_id
    }

    /// Whether the running script is blocked on [`provide_input`](Self::provide_input).
    pub fn is_waiting_for_input(&self) -> bool {
        self.input.is_waiting()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EnvironmentEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_output(&self) -> OutputSubscription {
        self.output.subscribe()
    }

    pub fn output_hub(&self) -> &OutputHub {
        &self.output
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.lock_state().disposed {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn set_status(&self, new: Status) {
        let mut state = self.lock_state();
        self.replace_status(&mut state, new);
    }

    /// Change status and publish the change under the state lock.
    fn replace_status(&self, state: &mut State, new: Status) {
        let old = std::mem::replace(&mut state.status, new);
        if old != new {
            tracing::debug!("Script {} status {} -> {}", self.script_id, old, new);
            let _ = self.events.send(EnvironmentEvent::StatusChanged {
                script_id: self.script_id,
                old,
                new,
            });
        }
    }

    pub async fn handle_command(&self, command: EnvironmentCommand) -> Result<Option<RunResult>> {
        match command {
            EnvironmentCommand::Run(options) => self.run(options).await.map(Some),
            EnvironmentCommand::Cancel => {
                self.ensure_alive()?;
                self.cancel();
                Ok(None)
            }
            EnvironmentCommand::ProvideInput(line) => {
                self.provide_input(line)?;
                Ok(None)
            }
        }
    }

    /// Wrap, compile and execute the script.
    ///
    /// Fails only with [`Error::AlreadyRunning`] or [`Error::Disposed`]; every
    /// other outcome is described by the returned [`RunResult`].
    pub async fn run(&self, options: RunOptions) -> Result<RunResult> {
        let cancel = CancelHandle::new();
        let run_id = RunId::new();
        {
            let mut state = self.lock_state();
            if state.disposed {
                return Err(Error::Disposed);
            }
            if state.in_flight {
                return Err(Error::AlreadyRunning);
            }
            state.in_flight = true;
            state.active_runs += 1;
            state.cancel = Some(cancel.clone());
            state.last_run_id = Some(run_id);
        }
        let _slot = RunSlot {
            state: &self.state,
            idle: &self.idle,
        };
        let in_flight = InFlight { state: &self.state };

        let script = self.script();
        let pipeline = self.output.begin_run(run_id);
        tracing::info!("Run {} of script '{}' started", run_id, script.name);

        let result = self.execute(run_id, &script, options, &pipeline, cancel).await;

        let final_status = if result.is_run_cancelled {
            pipeline
                .write(
                    OutputChannel::LOG,
                    OutputPayload::text(format!(
                        "Script stopped at: {}\n",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
                    )),
                )
                .await;
            Status::Ready
        } else if result.is_success() {
            Status::Ready
        } else {
            Status::Error
        };
        pipeline.close();

        {
            let mut state = self.lock_state();
            state.last_result = Some(result.clone());
            self.replace_status(&mut state, final_status);
        }
        drop(in_flight);
        let _ = self.events.send(EnvironmentEvent::RunDurationChanged {
            script_id: self.script_id,
            duration_ms: result.duration_ms,
        });
        let _ = self.events.send(EnvironmentEvent::RunCompleted {
            script_id: self.script_id,
            run_id,
            result: result.clone(),
        });
        tracing::info!(
            "Run {} finished: attempt ok {}, script ok {}, cancelled {}, {:.1} ms",
            run_id,
            result.is_run_attempt_successful,
            result.is_script_completed_successfully,
            result.is_run_cancelled,
            result.duration_ms
        );
        Ok(result)
    }

    async fn execute(
        &self,
        run_id: RunId,
        script: &Script,
        options: RunOptions,
        pipeline: &Arc<OutputPipeline>,
        cancel: CancelHandle,
    ) -> RunResult {
        let code = options.code_override.as_deref().unwrap_or(&script.code);
        let probing_paths = script
            .config
            .resolve_probing_paths(&options.additional_references);

        let wrapped = match wrap(
            code,
            script.config.kind,
            &script.config.namespaces,
            &options.additional_code,
        ) {
            Ok(wrapped) => wrapped,
            Err(e) => return self.fail_before_run(pipeline, e.to_string()).await,
        };

        let input = CompilationInput::from_wrapped(&wrapped)
            .with_references(
                script
                    .config
                    .references
                    .iter()
                    .cloned()
                    .chain(options.additional_references),
            )
            .with_edition(script.config.edition)
            .with_optimization(self.config.compiler.optimization);

        let compiler = self.compiler.clone();
        let compiled = tokio::task::spawn_blocking(move || compiler.compile(&input)).await;
        let compiled = match compiled {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return self.fail_before_run(pipeline, e.to_string()).await,
            Err(e) => {
                return self
                    .fail_before_run(pipeline, format!("Compiler task failed: {}", e))
                    .await;
            }
        };
        self.lock_state().last_diagnostics = compiled.diagnostics.clone();
        for warning in compiled.warnings() {
            tracing::debug!("{}", warning);
        }

        let module = match compiled.module {
            Some(module) if compiled.success => module,
            _ => {
                for diagnostic in compiled.errors() {
                    pipeline
                        .write(OutputChannel::LOG, OutputPayload::error(diagnostic.to_string()))
                        .await;
                }
                self.set_status(Status::Error);
                return RunResult::run_attempt_failure("Compilation failed");
            }
        };

        if !self.start_running(&cancel) {
            return RunResult::cancelled(0.0);
        }

        let ctx = RunContext {
            run_id,
            script_id: script.id(),
            script_name: script.name.clone(),
            script_path: script.path.clone(),
            is_dirty: script.dirty,
            probing_paths,
            host_fingerprint: script.config.host_fingerprint(),
            cancel,
            output: pipeline.clone(),
            input: self.input.clone(),
        };

        let mut host = self.host.lock().await;
        let mut handle = match host.load(&module, &ctx).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = format!("Failed to load module {}: {}", module.name, e);
                pipeline
                    .write(OutputChannel::LOG, OutputPayload::error(message.clone()))
                    .await;
                return RunResult::run_attempt_failure(message);
            }
        };

        let result = host.run(&mut handle, ctx).await;

        match host.unload(handle).await {
            Ok(()) => result,
            Err(e) => {
                tracing::warn!("Failed to unload module {}: {}", module.name, e);
                if result.is_run_attempt_successful {
                    RunResult::run_attempt_failure(format!("Failed to unload module: {}", e))
                } else {
                    result
                }
            }
        }
    }

    async fn fail_before_run(&self, pipeline: &OutputPipeline, message: String) -> RunResult {
        pipeline
            .write(OutputChannel::LOG, OutputPayload::error(message.clone()))
            .await;
        self.set_status(Status::Error);
        RunResult::run_attempt_failure(message)
    }

    /// Enter `Running` unless the run was cancelled while compiling.
    fn start_running(&self, cancel: &CancelHandle) -> bool {
        let mut state = self.lock_state();
        if cancel.is_cancelled() {
            return false;
        }
        self.replace_status(&mut state, Status::Running);
        true
    }

    /// Ask the current run to stop. Returns whether a run was signalled.
    ///
    /// Idempotent: later calls for the same run return `false`.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock_state();
        self.cancel_locked(&mut state)
    }

    /// Signal the run and move `Running` to `Stopping` in one step; a run
    /// that already finished keeps its final status.
    fn cancel_locked(&self, state: &mut State) -> bool {
        let signalled = state.cancel.as_ref().is_some_and(CancelHandle::cancel);
        if signalled {
            tracing::info!("Cancellation requested for script {}", self.script_id);
            if state.status == Status::Running {
                self.replace_status(state, Status::Stopping);
            }
        }
        signalled
    }

    /// Answer the script's pending input request.
    ///
    /// Returns `false` when the script is not waiting for input.
    pub fn provide_input(&self, line: impl Into<String>) -> Result<bool> {
        self.ensure_alive()?;
        Ok(self.input.provide(line.into()))
    }

    /// Resolves once no run is in flight or still publishing its completion.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.lock_state().active_runs == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop any run, shut the host down and close every subscription.
    ///
    /// Returns after the run in flight, if any, has completed and published
    /// `RunCompleted`. Idempotent. Every later operation fails with
    /// [`Error::Disposed`].
    pub async fn dispose(&self) {
        {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            self.cancel_locked(&mut state);
        }

        self.wait_idle().await;
        self.input.detach();

        let mut host = self.host.lock().await;
        host.shutdown().await;
        drop(host);

        self.output.close();
        let _ = self.events.send(EnvironmentEvent::Disposed {
            script_id: self.script_id,
        });
        tracing::info!("Disposed environment for script {}", self.script_id);
    }
}

impl std::fmt::Debug for ScriptEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEnvironment")
            .field("script_id", &self.script_id)
            .field("status", &self.status())
            .finish()
    }
}
