//! Shared helpers for engine integration tests.
//!
//! These tests compile real scripts and need `rustc` on PATH.

#![allow(dead_code)]

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use scriptpad_core::compile::CompilerConfig;
use scriptpad_core::{
    CompilerService, EngineConfig, EngineDirs, EnvironmentEvent, HostKind, OutputEvent,
    OutputPayload, OutputSubscription, Script, ScriptEnvironment, Session, Status,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// One compiler per test binary so the runtime rlib is built once.
static COMPILER: LazyLock<(TempDir, Arc<CompilerService>)> = LazyLock::new(|| {
    let temp = TempDir::new().expect("Failed to create build directory");
    let config = CompilerConfig::default().with_build_dir(temp.path().join("build"));
    let compiler = CompilerService::new(config).expect("rustc must be installed");
    (temp, Arc::new(compiler))
});

/// A session rooted in its own temp directory.
pub struct TestEngine {
    _root: TempDir,
    pub session: Session,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn out_of_process() -> Self {
        Self::with_config(|config| config.host.kind = HostKind::OutOfProcess)
    }

    pub fn with_config(configure: impl FnOnce(&mut EngineConfig)) -> Self {
        let root = TempDir::new().expect("Failed to create engine root");
        let dirs = EngineDirs::at(root.path()).expect("Failed to create engine dirs");
        let mut config = EngineConfig::default();
        config.compiler = COMPILER.1.config().clone();
        configure(&mut config);

        let session = Session::with_compiler(config, dirs, COMPILER.1.clone())
            .expect("Failed to create session");
        Self {
            _root: root,
            session,
        }
    }

    pub fn open(&self, name: &str, code: &str) -> Arc<ScriptEnvironment> {
        self.session
            .open(Script::new(name, code))
            .expect("Failed to open script")
    }
}

/// Wait until the environment reports `status`, or panic after `timeout`.
pub async fn wait_for_status(
    events: &mut broadcast::Receiver<EnvironmentEvent>,
    status: Status,
    timeout: Duration,
) {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(EnvironmentEvent::StatusChanged { new, .. }) if new == status => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("status never became {}", status));
}

/// Every status change currently queued on `events`.
pub fn drain_statuses(events: &mut broadcast::Receiver<EnvironmentEvent>) -> Vec<Status> {
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EnvironmentEvent::StatusChanged { new, .. } = event {
            statuses.push(new);
        }
    }
    statuses
}

pub fn drain(output: &mut OutputSubscription) -> Vec<OutputEvent> {
    output.drain()
}

/// Concatenated text of every payload, for loose assertions.
pub fn all_text(events: &[OutputEvent]) -> String {
    events
        .iter()
        .map(|event| event.payload.body())
        .collect::<Vec<_>>()
        .join("")
}

pub fn errors(events: &[OutputEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match &event.payload {
            OutputPayload::Error { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
