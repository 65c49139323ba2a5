//! Shared application state.

use crate::config::Config;
use crate::environment::EnvironmentRegistry;
use crate::execution::{ExecutionEngine, Toolchain};
use crate::identity::IdentityClient;
use crate::provision::Provisioner;
use crate::sandbox::SandboxTool;
use crate::store::EnvironmentStore;
use crate::terminal::TerminalSessionRegistry;
use std::sync::Arc;

/// Background sweep period for idle terminal sessions.
pub const REAPER_INTERVAL_SECS: u64 = 60;

/// Every registry is owned here and handed to handlers by clone.
#[derive(Clone)]
pub struct AppState {
    pub environments: Arc<EnvironmentRegistry>,
    pub engine: Arc<ExecutionEngine>,
    pub terminals: Arc<TerminalSessionRegistry>,
    pub provisioner: Arc<Provisioner>,
    pub identity: Arc<IdentityClient>,
}

impl AppState {
    pub fn new(
        config: &Config,
        tool: SandboxTool,
        store: Arc<dyn EnvironmentStore>,
        toolchain: Toolchain,
    ) -> Self {
        let environments = Arc::new(EnvironmentRegistry::new(
            &config.workspace_dir,
            Arc::new(tool),
            store,
        )
        .with_max_file_bytes(config.max_file_bytes));
        let engine = Arc::new(ExecutionEngine::new(
            environments.clone(),
            toolchain,
            config.compile_timeout,
            config.run_timeout,
        ));
        let terminals = Arc::new(TerminalSessionRegistry::new(
            config.shell.clone(),
            config.max_terminal_sessions,
            config.terminal_idle_timeout,
            config.terminal_grace,
        ));
        let provisioner = Arc::new(Provisioner::new(
            environments.clone(),
            vec!["sh".to_string(), config.bootstrap_script.display().to_string()],
        ));
        Self {
            environments,
            engine,
            terminals,
            provisioner,
            identity: Arc::new(IdentityClient::new(&config.identity_url)),
        }
    }
}
