//! testsmith: generates unit tests for Python functions and methods with an
//! LLM, executes them in a container that sees the project read-only and
//! reprompts with the failures until a test passes or the budget runs out.

pub mod config;
pub mod error;
pub mod llm;
pub mod logger;
pub mod parser;
pub mod persistence;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod testgen;

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::persistence::TestRecordStore;
use crate::sandbox::{ContainerEngine, DockerCli, SandboxSession};

/// Application shell. The sandbox is up before any task is accepted; both
/// the sandbox and the store are released on shutdown or drop.
pub struct App<E: ContainerEngine = DockerCli> {
    config: AppConfig,
    sandbox: Option<SandboxSession<E>>,
    store: Option<TestRecordStore>,
}

impl App<DockerCli> {
    pub fn start(config: AppConfig, project_root: &Path) -> Result<Self, AppError> {
        let engine = DockerCli::new(config.sandbox.binary.clone());
        Self::start_with(engine, config, project_root)
    }
}

impl<E: ContainerEngine> App<E> {
    pub fn start_with(engine: E, config: AppConfig, project_root: &Path) -> Result<Self, AppError> {
        let store = TestRecordStore::open(store_path(&config, project_root))?;
        let sandbox = SandboxSession::start(
            engine,
            project_root,
            &config.sandbox.image,
            config.sandbox_options(),
        )?;

        info!(root = %sandbox.project_root().display(), store = %store.root().display(), "app started");
        Ok(Self {
            config,
            sandbox: Some(sandbox),
            store: Some(store),
        })
    }

    /// Opens only the store, for commands that never execute code.
    pub fn offline(config: AppConfig, project_root: &Path) -> Result<Self, AppError> {
        let store = TestRecordStore::open(store_path(&config, project_root))?;
        Ok(Self {
            config,
            sandbox: None,
            store: Some(store),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn sandbox(&self) -> Option<&SandboxSession<E>> {
        self.sandbox.as_ref()
    }

    pub fn store(&self) -> Result<&TestRecordStore, AppError> {
        self.store.as_ref().ok_or(AppError::Store(error::StoreError::Closed))
    }

    /// Stops the sandbox, then closes the store. Both are attempted even
    /// when the first fails.
    pub fn shutdown(mut self) -> Result<(), AppError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), AppError> {
        let stopped = match self.sandbox.take() {
            Some(s) => s.stop(),
            None => Ok(()),
        };
        let closed = match self.store.take() {
            Some(s) => s.close(),
            None => Ok(()),
        };
        stopped?;
        closed?;
        info!("app shut down");
        Ok(())
    }
}

impl<E: ContainerEngine> Drop for App<E> {
    fn drop(&mut self) {
        if self.sandbox.is_none() && self.store.is_none() {
            return;
        }
        if let Err(e) = self.release() {
            warn!(error = %e, "shutdown failed");
        }
    }
}

fn store_path(config: &AppConfig, project_root: &Path) -> PathBuf {
    match &config.store.path {
        Some(p) => p.clone(),
        None => {
            let root = project_root
                .canonicalize()
                .unwrap_or_else(|_| project_root.to_path_buf());
            TestRecordStore::default_path(&root)
        }
    }
}
