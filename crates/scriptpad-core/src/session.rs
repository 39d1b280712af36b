//! A set of open scripts sharing one compiler and one host pool.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::compile::CompilerService;
use crate::config::{EngineConfig, HostKind};
use crate::environment::ScriptEnvironment;
use crate::error::{Error, Result};
use crate::ipc::{ScriptHostPool, find_host_binary};
use crate::paths::EngineDirs;
use crate::script::{Script, ScriptId};

/// Open environments keyed by script id.
///
/// Environments are independent: several can run at once.
pub struct Session {
    config: EngineConfig,
    dirs: EngineDirs,
    compiler: Arc<CompilerService>,
    pool: Option<Arc<ScriptHostPool>>,
    environments: RwLock<FxHashMap<ScriptId, Arc<ScriptEnvironment>>>,
}

impl Session {
    /// Detect the toolchain and prepare a session under `dirs`.
    pub fn new(config: EngineConfig, dirs: EngineDirs) -> Result<Self> {
        let compiler = Arc::new(CompilerService::new(config.compiler.clone())?);
        Self::with_compiler(config, dirs, compiler)
    }

    /// Use an existing compiler, e.g. one shared between sessions.
    pub fn with_compiler(
        config: EngineConfig,
        dirs: EngineDirs,
        compiler: Arc<CompilerService>,
    ) -> Result<Self> {
        let pool = if config.host.kind == HostKind::OutOfProcess && config.host.pool_size > 0 {
            let binary = find_host_binary(config.host.host_binary.as_deref())?;
            Some(Arc::new(ScriptHostPool::new(
                binary,
                config.host.startup_timeout(),
                config.host.pool_size,
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            dirs,
            compiler,
            pool,
            environments: RwLock::new(FxHashMap::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dirs(&self) -> &EngineDirs {
        &self.dirs
    }

    pub fn compiler(&self) -> &Arc<CompilerService> {
        &self.compiler
    }

    /// Pre-start pooled script hosts. No-op without a pool.
    pub async fn warm_pool(&self) -> Result<()> {
        match &self.pool {
            Some(pool) => pool.warm().await,
            None => Ok(()),
        }
    }

    /// Open an environment for `script`.
    pub fn open(&self, script: Script) -> Result<Arc<ScriptEnvironment>> {
        let id = script.id();
        let mut environments = self
            .environments
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if environments.contains_key(&id) {
            return Err(Error::InvalidOperation(format!("Script {} is already open", id)));
        }

        let environment = Arc::new(ScriptEnvironment::new(
            script,
            self.compiler.clone(),
            self.config.clone(),
            &self.dirs,
            self.pool.clone(),
        ));
        environments.insert(id, environment.clone());
        tracing::debug!("Opened script {}", id);
        Ok(environment)
    }

    pub fn get(&self, id: ScriptId) -> Option<Arc<ScriptEnvironment>> {
        self.environments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn environments(&self) -> Vec<Arc<ScriptEnvironment>> {
        self.environments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.environments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose and forget one environment. Returns whether it was open.
    pub async fn close(&self, id: ScriptId) -> bool {
        let environment = self
            .environments
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match environment {
            Some(environment) => {
                environment.dispose().await;
                true
            }
            None => false,
        }
    }

    /// Dispose every environment and shut the pool down.
    pub async fn close_all(&self) {
        let environments: Vec<_> = self
            .environments
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, environment)| environment)
            .collect();

        futures::future::join_all(environments.iter().map(|e| e.dispose())).await;

        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("environments", &self.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
