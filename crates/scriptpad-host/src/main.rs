//! scriptpad-host - runs compiled script modules for a parent engine.
//!
//! Commands arrive on stdin and messages leave on the original stdout, both
//! as length-prefixed rkyv frames. File descriptor 1 is pointed at stderr
//! once the IPC handle is taken, so stray writes from user code show up as
//! log text in the parent instead of corrupting the stream.

use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::Parser;
use scriptpad_core::execute::{
    InputBroker, ModuleArena, ModuleOutcome, OutputSink, RunResult, error_event,
};
use scriptpad_core::ipc::protocol::{read_message, write_message};
use scriptpad_core::ipc::{HostCommand, HostMessage, RunRequest};
use scriptpad_core::output::{OutputChannel, OutputPayload};
use scriptpad_core::script::ScriptId;
use tracing_subscriber::EnvFilter;

/// Log filter for the host; its stderr ends up in the script's log channel.
const LOG_ENV: &str = "SCRIPTPAD_HOST_LOG";
const PARENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "scriptpad-host")]
#[command(about = "Runs compiled scriptpad modules on behalf of a parent process")]
#[command(version)]
struct Args {
    /// Exit when this process id goes away
    #[arg(long)]
    parent: Option<u32>,

    /// Directory for module arenas (defaults to a per-process temp dir)
    #[arg(long)]
    arena_root: Option<PathBuf>,
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

enum Event {
    Command(HostCommand),
    RunFinished { run_id: String, outcome: ModuleOutcome },
    InputClosed,
    ParentExited,
}

/// Sends a run's output back to the parent.
struct IpcSink {
    run_id: String,
    writer: SharedWriter,
    cancelled: Arc<AtomicBool>,
    input: Arc<InputBroker>,
}

impl OutputSink for IpcSink {
    fn write(&self, channel: OutputChannel, payload: OutputPayload) {
        let message = HostMessage::Output {
            run_id: self.run_id.clone(),
            channel,
            payload,
        };
        if let Err(e) = send(&self.writer, &message) {
            tracing::error!("Failed to send output: {}", e);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn read_line(&self, prompt: &str) -> Option<String> {
        self.input.read_line(prompt, || self.is_cancelled())
    }
}

struct ActiveRun {
    run_id: String,
    user_start_line: Option<usize>,
    arena: ModuleArena,
    cancelled: Arc<AtomicBool>,
    input: Arc<InputBroker>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    let writer: SharedWriter = Arc::new(Mutex::new(take_ipc_stdout()?));
    let (events_tx, events_rx) = mpsc::channel();

    spawn_command_reader(events_tx.clone())?;
    if let Some(parent) = args.parent {
        spawn_parent_watchdog(parent, events_tx.clone())?;
    }

    let arena_root = args
        .arena_root
        .unwrap_or_else(|| std::env::temp_dir().join(format!("scriptpad-host-{}", std::process::id())));
    std::fs::create_dir_all(&arena_root)?;

    send(
        &writer,
        &HostMessage::Ready {
            pid: std::process::id(),
        },
    )?;
    tracing::info!("Script host {} ready", std::process::id());

    let mut active: Option<ActiveRun> = None;

    while let Ok(event) = events_rx.recv() {
        match event {
            Event::Command(HostCommand::RunScript(request)) => {
                if active.is_some() {
                    let failure = RunResult::run_attempt_failure("Another script is still running");
                    complete(&writer, &request.run_id, &failure, false)?;
                    continue;
                }
                match start_run(&arena_root, request.clone(), &writer, &events_tx) {
                    Ok(run) => active = Some(run),
                    Err(message) => {
                        let failure = RunResult::run_attempt_failure(message);
                        report_error(&writer, &request.run_id, &failure)?;
                        complete(&writer, &request.run_id, &failure, false)?;
                    }
                }
            }
            Event::Command(HostCommand::Cancel { run_id }) => match &active {
                Some(run) if run.run_id == run_id => {
                    tracing::debug!("Cancelling run {}", run_id);
                    run.cancelled.store(true, Ordering::Release);
                    run.input.detach();
                }
                _ => tracing::debug!("Ignoring cancel for inactive run {}", run_id),
            },
            Event::Command(HostCommand::ProvideInput { run_id, line }) => match &active {
                Some(run) if run.run_id == run_id => {
                    if !run.input.provide(line) {
                        tracing::debug!("Run {} was not waiting for input", run_id);
                    }
                }
                _ => tracing::debug!("Ignoring input for inactive run {}", run_id),
            },
            Event::Command(HostCommand::Ping) => send(&writer, &HostMessage::Pong)?,
            Event::Command(HostCommand::Shutdown) => {
                tracing::debug!("Shutdown requested");
                break;
            }
            Event::RunFinished { run_id, outcome } => {
                let Some(run) = active.take_if(|run| run.run_id == run_id) else {
                    tracing::warn!("Completion for unknown run {}", run_id);
                    continue;
                };
                run.input.detach();
                let restart = outcome.restart_requested;
                let result = outcome.into_run_result(run.user_start_line);
                report_error(&writer, &run_id, &result)?;
                if let Err(e) = run.arena.unload() {
                    tracing::warn!("Failed to unload module for run {}: {}", run_id, e);
                }
                complete(&writer, &run_id, &result, restart)?;
            }
            Event::InputClosed => {
                tracing::debug!("Parent closed stdin");
                break;
            }
            Event::ParentExited => {
                tracing::info!("Parent process exited");
                break;
            }
        }
    }

    if let Some(mut run) = active.take() {
        // Still inside user code; the process exit reclaims it.
        run.cancelled.store(true, Ordering::Release);
        run.input.detach();
        run.arena.abandon();
    }
    let _ = std::fs::remove_dir_all(&arena_root);
    Ok(())
}

fn start_run(
    arena_root: &std::path::Path,
    request: RunRequest,
    writer: &SharedWriter,
    events: &mpsc::Sender<Event>,
) -> Result<ActiveRun, String> {
    let script_id = ScriptId::from_str(&request.script_id).unwrap_or_default();
    let bytes = std::fs::read(&request.module_path)
        .map_err(|e| format!("Failed to read module {}: {}", request.module_path, e))?;
    let probing_paths: Vec<PathBuf> = request.probing_paths.iter().map(PathBuf::from).collect();

    let mut arena = ModuleArena::load(
        arena_root,
        script_id,
        &request.module_name,
        &bytes,
        &probing_paths,
    )
    .map_err(|e| format!("Failed to load module {}: {}", request.module_name, e))?;

    let cancelled = Arc::new(AtomicBool::new(false));
    let input = Arc::new(InputBroker::new());
    {
        let writer = writer.clone();
        let run_id = request.run_id.clone();
        input.set_announcer(Arc::new(move |prompt: &str| {
            let message = HostMessage::InputRequested {
                run_id: run_id.clone(),
                prompt: prompt.to_string(),
            };
            if let Err(e) = send(&writer, &message) {
                tracing::error!("Failed to request input: {}", e);
            }
        }));
    }
    let sink = Arc::new(IpcSink {
        run_id: request.run_id.clone(),
        writer: writer.clone(),
        cancelled: cancelled.clone(),
        input: input.clone(),
    });

    let events = events.clone();
    let run_id = request.run_id.clone();
    arena
        .start(sink, move |outcome| {
            let _ = events.send(Event::RunFinished { run_id, outcome });
        })
        .map_err(|e| format!("Failed to start script: {}", e))?;

    tracing::debug!("Started run {} of '{}'", request.run_id, request.script_name);
    Ok(ActiveRun {
        run_id: request.run_id,
        user_start_line: request.user_start_line.map(|line| line as usize),
        arena,
        cancelled,
        input,
    })
}

fn report_error(writer: &SharedWriter, run_id: &str, result: &RunResult) -> anyhow::Result<()> {
    if let Some((channel, payload)) = error_event(result) {
        send(
            writer,
            &HostMessage::Output {
                run_id: run_id.to_string(),
                channel,
                payload,
            },
        )?;
    }
    Ok(())
}

fn complete(
    writer: &SharedWriter,
    run_id: &str,
    result: &RunResult,
    restart_host_on_next_run: bool,
) -> anyhow::Result<()> {
    send(
        writer,
        &HostMessage::RunComplete {
            run_id: run_id.to_string(),
            result: result.clone(),
            restart_host_on_next_run,
        },
    )
}

fn send(writer: &SharedWriter, message: &HostMessage) -> anyhow::Result<()> {
    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
    write_message(&mut *writer, message)?;
    Ok(())
}

fn spawn_command_reader(events: mpsc::Sender<Event>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("scriptpad-host-stdin".into())
        .spawn(move || {
            let mut stdin = BufReader::new(std::io::stdin());
            loop {
                match read_message::<_, HostCommand>(&mut stdin) {
                    Ok(Some(command)) => {
                        if events.send(Event::Command(command)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Failed to read command: {}", e);
                        break;
                    }
                }
            }
            let _ = events.send(Event::InputClosed);
        })?;
    Ok(())
}

fn spawn_parent_watchdog(parent: u32, events: mpsc::Sender<Event>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("scriptpad-host-watchdog".into())
        .spawn(move || {
            while parent_alive(parent) {
                thread::sleep(PARENT_POLL_INTERVAL);
            }
            let _ = events.send(Event::ParentExited);
        })?;
    Ok(())
}

/// Duplicate stdout for IPC and point fd 1 at stderr.
#[cfg(unix)]
fn take_ipc_stdout() -> anyhow::Result<Box<dyn Write + Send>> {
    use std::os::fd::FromRawFd;

    // SAFETY: fds 1 and 2 are open for the life of the process; the
    // duplicate is owned by the returned File alone.
    unsafe {
        let ipc = libc::dup(libc::STDOUT_FILENO);
        if ipc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Box::new(std::fs::File::from_raw_fd(ipc)))
    }
}

#[cfg(not(unix))]
fn take_ipc_stdout() -> anyhow::Result<Box<dyn Write + Send>> {
    Ok(Box::new(std::io::stdout()))
}

#[cfg(unix)]
fn parent_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the process exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn parent_alive(_pid: u32) -> bool {
    true
}
