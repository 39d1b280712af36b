//! Script host process management.
//!
//! Provides `HostProcess` for spawning and talking to one `scriptpad-host`
//! child, and `ScriptHostPool` for keeping fresh ones warm.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{HostCommand, HostMessage, read_message_async, write_message_async};
use crate::error::{Error, Result};
use crate::output::{OutputChannel, OutputPayload, OutputPipeline};

const HOST_BINARY: &str = if cfg!(windows) {
    "scriptpad-host.exe"
} else {
    "scriptpad-host"
};

/// Find the `scriptpad-host` binary.
///
/// Looks in this order:
/// 1. `configured`, when given
/// 2. `SCRIPTPAD_HOST_PATH` environment variable
/// 3. Same directory as the current executable (and its parent, for test binaries)
/// 4. System PATH
/// 5. `target/{debug,release}` of the workspace, for development
pub fn find_host_binary(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Ipc(format!(
            "Configured script host {} does not exist",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var("SCRIPTPAD_HOST_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        for dir in [Some(exe_dir), exe_dir.parent()].into_iter().flatten() {
            let candidate = dir.join(HOST_BINARY);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(HOST_BINARY) {
        return Ok(path);
    }

    let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..");
    for profile in ["debug", "release"] {
        let path = workspace.join("target").join(profile).join(HOST_BINARY);
        if path.exists() {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    Err(Error::Ipc(
        "Could not find scriptpad-host binary. Set SCRIPTPAD_HOST_PATH or ensure it's in PATH."
            .to_string(),
    ))
}

/// Where a host's stderr lines go.
type StderrTarget = Arc<Mutex<Option<Arc<OutputPipeline>>>>;

/// A running `scriptpad-host` child.
pub struct HostProcess {
    child: Child,
    stdin: ChildStdin,
    messages: mpsc::Receiver<HostMessage>,
    reader: JoinHandle<()>,
    stderr_target: StderrTarget,
    pid: u32,
}

impl HostProcess {
    /// Spawn a host and wait for it to report ready.
    pub async fn spawn(binary: &Path, startup_timeout: Duration) -> Result<Self> {
        let mut child = Command::new(binary)
            .arg("--parent")
            .arg(std::process::id().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn script host '{}': {}",
                    binary.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get script host stdin".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get script host stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get script host stderr".to_string()))?;

        let (tx, messages) = mpsc::channel(256);
        let reader = tokio::spawn(async move {
            loop {
                match read_message_async::<_, HostMessage>(&mut stdout).await {
                    Ok(Some(message)) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Script host stream failed: {}", e);
                        break;
                    }
                }
            }
        });

        let stderr_target: StderrTarget = Arc::new(Mutex::new(None));
        let target = stderr_target.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let pipeline = target.lock().unwrap_or_else(|e| e.into_inner()).clone();
                match pipeline {
                    Some(pipeline) => {
                        pipeline
                            .write(
                                OutputChannel::LOG,
                                OutputPayload::Text {
                                    text: format!("{}\n", line),
                                    stderr: true,
                                },
                            )
                            .await;
                    }
                    None => tracing::debug!("[scriptpad-host] {}", line),
                }
            }
        });

        let pid = child.id().unwrap_or(0);
        let mut process = Self {
            child,
            stdin,
            messages,
            reader,
            stderr_target,
            pid,
        };

        match tokio::time::timeout(startup_timeout, process.recv()).await {
            Ok(Some(HostMessage::Ready { .. })) => {
                tracing::info!("Started script host (pid {})", pid);
                Ok(process)
            }
            Ok(other) => {
                process.kill().await;
                Err(Error::Ipc(format!(
                    "Unexpected first message from script host: {:?}",
                    other
                )))
            }
            Err(_) => {
                process.kill().await;
                Err(Error::Ipc(format!(
                    "Script host did not start within {:?}",
                    startup_timeout
                )))
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn send(&mut self, command: &HostCommand) -> Result<()> {
        write_message_async(&mut self.stdin, command).await
    }

    /// Next message, or `None` once the host's stdout has closed.
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.messages.recv().await
    }

    /// Route stderr lines to `pipeline` as log text, or to tracing when `None`.
    pub fn forward_stderr_to(&self, pipeline: Option<Arc<OutputPipeline>>) {
        *self.stderr_target.lock().unwrap_or_else(|e| e.into_inner()) = pipeline;
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill immediately and reap.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("Script host {} already gone: {}", self.pid, e);
        }
        self.reader.abort();
    }

    /// Ask the host to exit, killing it if it has not within `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) {
        let _ = self.send(&HostCommand::Shutdown).await;
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("Script host {} exited: {}", self.pid, status),
            _ => self.kill().await,
        }
        self.reader.abort();
    }
}

impl std::fmt::Debug for HostProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProcess").field("pid", &self.pid).finish()
    }
}

/// Fresh, never-used script hosts ready to hand out.
///
/// A host taken from the pool serves one environment and is never returned.
#[derive(Debug)]
pub struct ScriptHostPool {
    binary: PathBuf,
    startup_timeout: Duration,
    size: usize,
    idle: tokio::sync::Mutex<Vec<HostProcess>>,
}

impl ScriptHostPool {
    pub fn new(binary: PathBuf, startup_timeout: Duration, size: usize) -> Self {
        Self {
            binary,
            startup_timeout,
            size,
            idle: tokio::sync::Mutex::new(Vec::with_capacity(size)),
        }
    }

    /// Spawn hosts until the pool is full.
    pub async fn warm(&self) -> Result<()> {
        let mut idle = self.idle.lock().await;
        while idle.len() < self.size {
            idle.push(HostProcess::spawn(&self.binary, self.startup_timeout).await?);
        }
        Ok(())
    }

    /// Take a live idle host, or spawn one.
    pub async fn take(&self) -> Result<HostProcess> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(mut host) = idle.pop() {
                if host.is_alive() {
                    return Ok(host);
                }
                tracing::debug!("Discarding dead pooled script host {}", host.pid());
            }
        }
        HostProcess::spawn(&self.binary, self.startup_timeout).await
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Shut every idle host down.
    pub async fn shutdown(&self) {
        let hosts: Vec<_> = self.idle.lock().await.drain(..).collect();
        for host in hosts {
            host.shutdown(Duration::from_millis(500)).await;
        }
    }
}
