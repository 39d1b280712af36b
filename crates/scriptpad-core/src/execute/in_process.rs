//! In-process execution in disposable module arenas.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::arena::{ModuleArena, error_event};
use super::context::{CancelHandle, RunContext};
use super::ffi::OutputSink;
use super::input::InputBroker;
use super::result::RunResult;
use crate::compile::CompiledModule;
use crate::error::Result;
use crate::output::{OutputChannel, OutputPayload, OutputPipeline};

/// Sink that feeds a run's output pipeline from the script thread.
pub(crate) struct PipelineSink {
    pipeline: Arc<OutputPipeline>,
    cancel: CancelHandle,
    input: Arc<InputBroker>,
}

impl PipelineSink {
    pub(crate) fn new(ctx: &RunContext) -> Self {
        Self {
            pipeline: ctx.output.clone(),
            cancel: ctx.cancel.clone(),
            input: ctx.input.clone(),
        }
    }
}

impl OutputSink for PipelineSink {
    fn write(&self, channel: OutputChannel, payload: OutputPayload) {
        self.pipeline.write_blocking(channel, payload);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn read_line(&self, prompt: &str) -> Option<String> {
        self.input.read_line(prompt, || self.cancel.is_cancelled())
    }
}

/// Runs modules inside this process, one arena per load.
#[derive(Debug)]
pub struct InProcessHost {
    arena_dir: PathBuf,
    grace_period: Duration,
}

impl InProcessHost {
    pub fn new(arena_dir: PathBuf, grace_period: Duration) -> Self {
        Self {
            arena_dir,
            grace_period,
        }
    }

    pub fn load(&self, module: &CompiledModule, ctx: &RunContext) -> Result<ModuleArena> {
        ModuleArena::load(
            &self.arena_dir,
            ctx.script_id,
            &module.name,
            &module.bytes,
            &ctx.probing_paths,
        )
    }

    /// Run the arena's module to completion, cancellation, or abandonment.
    pub async fn run(
        &self,
        arena: &mut ModuleArena,
        user_start_line: Option<usize>,
        ctx: RunContext,
    ) -> RunResult {
        let sink = Arc::new(PipelineSink::new(&ctx));
        let (tx, mut rx) = oneshot::channel();
        let started = Instant::now();

        if let Err(e) = arena.start(sink, move |outcome| {
            let _ = tx.send(outcome);
        }) {
            return RunResult::run_attempt_failure(format!("Failed to start script: {}", e));
        }

        let outcome = tokio::select! {
            outcome = &mut rx => outcome.ok(),
            _ = ctx.cancel.cancelled() => {
                match tokio::time::timeout(self.grace_period, &mut rx).await {
                    Ok(outcome) => outcome.ok(),
                    Err(_) => {
                        arena.abandon();
                        ctx.input.detach();
                        return RunResult::cancelled(started.elapsed().as_secs_f64() * 1000.0);
                    }
                }
            }
        };
        ctx.input.detach();

        let result = match outcome {
            Some(outcome) => outcome.into_run_result(user_start_line),
            None => RunResult::run_attempt_failure("Script thread exited without a result"),
        };
        if let Some((channel, payload)) = error_event(&result) {
            ctx.output.write(channel, payload).await;
        }
        result
    }

    /// Unload on a blocking thread; joining the runner may wait briefly.
    pub async fn unload(&self, arena: ModuleArena) -> Result<()> {
        let name = arena.name().to_string();
        tokio::task::spawn_blocking(move || arena.unload())
            .await
            .map_err(|e| crate::Error::Execution(format!("Unload of {} failed: {}", name, e)))?
    }
}
