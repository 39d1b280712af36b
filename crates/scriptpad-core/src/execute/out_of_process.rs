//! Out-of-process execution in a subordinate `scriptpad-host`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{self, Instant as TokioInstant};

use super::context::RunContext;
use super::result::RunResult;
use crate::compile::{CompiledModule, dylib_extension};
use crate::config::HostConfig;
use crate::error::Result;
use crate::ipc::{HostCommand, HostMessage, HostProcess, RunRequest, ScriptHostPool, find_host_binary};
use crate::output::{OutputChannel, OutputPayload};

/// Called with `true` when a host process starts and `false` when it exits.
pub type LifetimeCallback = Arc<dyn Fn(bool) + Send + Sync>;

const HOST_CRASHED: &str = "script host process stopped unexpectedly";

/// How a run ended from the parent's point of view.
enum Completion {
    Finished {
        result: RunResult,
        restart_host_on_next_run: bool,
    },
    Crashed,
    GracePeriodElapsed,
}

/// Runs modules in a child process that can be killed outright.
pub struct OutOfProcessHost {
    config: HostConfig,
    work_dir: PathBuf,
    pool: Option<Arc<ScriptHostPool>>,
    process: Option<HostProcess>,
    runs_served: usize,
    restart_pending: bool,
    fingerprint: Option<u64>,
    lifetime: Option<LifetimeCallback>,
}

impl OutOfProcessHost {
    pub fn new(config: HostConfig, work_dir: PathBuf, pool: Option<Arc<ScriptHostPool>>) -> Self {
        Self {
            config,
            work_dir,
            pool,
            process: None,
            runs_served: 0,
            restart_pending: false,
            fingerprint: None,
            lifetime: None,
        }
    }

    pub fn set_lifetime_callback(&mut self, callback: LifetimeCallback) {
        self.lifetime = Some(callback);
    }

    /// Pid of the current host process, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(HostProcess::pid)
    }

    fn notify(&self, running: bool) {
        if let Some(callback) = &self.lifetime {
            callback(running);
        }
    }

    /// Write the module where the host process can load it.
    pub async fn load(&self, module: &CompiledModule, ctx: &RunContext) -> Result<(PathBuf, PathBuf)> {
        let dir = self.work_dir.join("runs").join(ctx.run_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("module.{}", dylib_extension()));
        tokio::fs::write(&path, module.bytes.as_slice()).await?;
        Ok((dir, path))
    }

    pub async fn unload(&self, dir: &Path) -> Result<()> {
        if tokio::fs::try_exists(dir).await? {
            tokio::fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn stop_process(&mut self) {
        if let Some(process) = self.process.take() {
            tracing::info!("Stopping script host (pid {})", process.pid());
            process.shutdown(self.config.cancel_grace_period()).await;
            self.notify(false);
        }
    }

    async fn kill_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            tracing::info!("Killing script host (pid {})", process.pid());
            process.kill().await;
            self.notify(false);
        }
    }

    /// Make sure a suitable process is running, restarting it if needed.
    async fn ensure_process(&mut self, fingerprint: u64) -> Result<()> {
        let dead = self.process.as_mut().is_some_and(|p| !p.is_alive());
        let fingerprint_changed = self.fingerprint.is_some_and(|f| f != fingerprint);
        let every_run = self.config.restart_host_on_every_run && self.runs_served > 0;

        if self.process.is_some() && (dead || fingerprint_changed || every_run || self.restart_pending) {
            tracing::info!(
                "Restarting script host (dead: {}, config changed: {}, requested: {})",
                dead,
                fingerprint_changed,
                self.restart_pending || every_run
            );
            self.stop_process().await;
        }

        if self.process.is_none() {
            let process = match &self.pool {
                Some(pool) => pool.take().await?,
                None => {
                    let binary = find_host_binary(self.config.host_binary.as_deref())?;
                    HostProcess::spawn(&binary, self.config.startup_timeout()).await?
                }
            };
            self.process = Some(process);
            self.runs_served = 0;
            self.notify(true);
        }

        self.fingerprint = Some(fingerprint);
        self.restart_pending = false;
        Ok(())
    }

    /// Run the module at `module_path` in the host process.
    pub async fn run(
        &mut self,
        module_name: &str,
        module_path: &Path,
        user_start_line: Option<usize>,
        ctx: RunContext,
    ) -> RunResult {
        if let Err(e) = self.ensure_process(ctx.host_fingerprint).await {
            self.restart_pending = true;
            let message = format!("Failed to start script host: {}", e);
            ctx.output
                .write(OutputChannel::LOG, OutputPayload::error(message.clone()))
                .await;
            return RunResult::run_attempt_failure(message);
        }

        let run_id = ctx.run_id.to_string();
        let request = run_request(&ctx, module_name, module_path, user_start_line);

        let grace = self.config.cancel_grace_period();
        let started = Instant::now();
        let completion = match self.process.as_mut() {
            Some(process) => {
                process.forward_stderr_to(Some(ctx.output.clone()));
                let completion = match process.send(&HostCommand::RunScript(request)).await {
                    Ok(()) => drive_run(process, &run_id, &ctx, grace).await,
                    Err(e) => {
                        tracing::error!("Failed to send run request: {}", e);
                        Completion::Crashed
                    }
                };
                process.forward_stderr_to(None);
                completion
            }
            None => Completion::Crashed,
        };

        match completion {
            Completion::Finished {
                result,
                restart_host_on_next_run,
            } => {
                self.runs_served += 1;
                self.restart_pending = restart_host_on_next_run || !result.is_run_attempt_successful;
                tracing::info!(
                    "Run {} finished in {:.1} ms (script ok: {})",
                    run_id,
                    result.duration_ms,
                    result.is_script_completed_successfully
                );
                result
            }
            Completion::GracePeriodElapsed => {
                tracing::info!("Run {} ignored cancellation; killing script host", run_id);
                self.kill_process().await;
                self.restart_pending = true;
                RunResult::cancelled(started.elapsed().as_secs_f64() * 1000.0)
            }
            Completion::Crashed => {
                tracing::error!("Script host crashed during run {}", run_id);
                ctx.output
                    .write(OutputChannel::LOG, OutputPayload::error(HOST_CRASHED))
                    .await;
                self.kill_process().await;
                self.restart_pending = true;
                RunResult::run_attempt_failure(HOST_CRASHED)
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.stop_process().await;
    }
}

/// The `RunScript` payload for one run.
fn run_request(
    ctx: &RunContext,
    module_name: &str,
    module_path: &Path,
    user_start_line: Option<usize>,
) -> RunRequest {
    RunRequest {
        run_id: ctx.run_id.to_string(),
        script_id: ctx.script_id.to_string(),
        script_name: ctx.script_name.clone(),
        script_path: ctx.script_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
        is_dirty: ctx.is_dirty,
        module_path: module_path.to_string_lossy().into_owned(),
        module_name: module_name.to_string(),
        probing_paths: ctx
            .probing_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        user_start_line: user_start_line.map(|l| l as u64),
    }
}

/// Pump messages for one run until it completes, the host dies, or a
/// cancelled run outlives the grace period.
async fn drive_run(
    process: &mut HostProcess,
    run_id: &str,
    ctx: &RunContext,
    grace: std::time::Duration,
) -> Completion {
    let mut input = ctx.input.attach_remote();
    let completion = pump_messages(process, run_id, ctx, grace, &mut input).await;
    ctx.input.detach();
    completion
}

async fn pump_messages(
    process: &mut HostProcess,
    run_id: &str,
    ctx: &RunContext,
    grace: std::time::Duration,
    input: &mut mpsc::UnboundedReceiver<String>,
) -> Completion {
    let mut cancel_deadline: Option<TokioInstant> = None;

    loop {
        tokio::select! {
            message = process.recv() => match message {
                Some(HostMessage::Output { run_id: id, channel, payload }) => {
                    if id == run_id {
                        ctx.output.write(channel, payload).await;
                    } else {
                        tracing::warn!("Discarding output from stale run {}", id);
                    }
                }
                Some(HostMessage::RunComplete { run_id: id, result, restart_host_on_next_run }) => {
                    if id == run_id {
                        return Completion::Finished { result, restart_host_on_next_run };
                    }
                    tracing::warn!("Discarding completion of stale run {}", id);
                }
                Some(HostMessage::InputRequested { run_id: id, prompt }) => {
                    if id == run_id {
                        ctx.input.request_remote(&prompt);
                    } else {
                        tracing::warn!("Discarding input request from stale run {}", id);
                    }
                }
                Some(other) => tracing::debug!("Ignoring host message during run: {:?}", other),
                None => return Completion::Crashed,
            },
            Some(line) = input.recv() => {
                let answer = HostCommand::ProvideInput { run_id: run_id.to_string(), line };
                if process.send(&answer).await.is_err() {
                    return Completion::Crashed;
                }
            }
            _ = ctx.cancel.cancelled(), if cancel_deadline.is_none() => {
                tracing::debug!("Cancelling run {}", run_id);
                cancel_deadline = Some(TokioInstant::now() + grace);
                let cancel = HostCommand::Cancel { run_id: run_id.to_string() };
                if process.send(&cancel).await.is_err() {
                    return Completion::Crashed;
                }
            }
            _ = time::sleep_until(cancel_deadline.unwrap_or_else(TokioInstant::now)), if cancel_deadline.is_some() => {
                return Completion::GracePeriodElapsed;
            }
        }
    }
}

impl std::fmt::Debug for OutOfProcessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutOfProcessHost")
            .field("pid", &self.pid())
            .field("restart_pending", &self.restart_pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::{CancelHandle, InputBroker};
    use crate::output::OutputHub;
    use crate::script::{RunId, ScriptId};

    #[test]
    fn test_run_request_carries_probing_paths() {
        let run_id = RunId::new();
        let hub = OutputHub::new(Default::default());
        let ctx = RunContext {
            run_id,
            script_id: ScriptId::new(),
            script_name: "Query 1".to_string(),
            script_path: Some(PathBuf::from("/scripts/query.rs")),
            is_dirty: false,
            probing_paths: vec![PathBuf::from("/opt/native"), PathBuf::from("/usr/local/lib")],
            host_fingerprint: 7,
            cancel: CancelHandle::new(),
            output: hub.begin_run(run_id),
            input: Arc::new(InputBroker::new()),
        };

        let request = run_request(&ctx, "script-01", Path::new("/tmp/runs/module.so"), Some(14));

        assert_eq!(request.run_id, run_id.to_string());
        assert_eq!(request.probing_paths, vec!["/opt/native", "/usr/local/lib"]);
        assert_eq!(request.script_path.as_deref(), Some("/scripts/query.rs"));
        assert_eq!(request.module_path, "/tmp/runs/module.so");
        assert_eq!(request.user_start_line, Some(14));
    }
}
