//! Per-user sandbox environments.
//!
//! An environment is a workspace directory plus a provisioning state. Once a
//! base root filesystem has been installed into the workspace (state `Ready`)
//! and the root-changing sandbox tool exists on the host, commands run inside
//! the tool rooted at the workspace. In every other state they run directly
//! against the workspace on the host, so compiling a single file works with
//! no setup at all.

use crate::error::{Error, Result};
use crate::process::{self, Invocation, ProcessOutcome, RunSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest file `write_file` accepts unless configured otherwise.
pub const DEFAULT_MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

/// Host directories made visible inside the sandbox root.
const SANDBOX_BINDS: [&str; 3] = ["/dev", "/proc", "/sys"];

const PROJECT_MANIFEST: &str = r#"[package]
name = "user_project"
version = "0.1.0"
edition = "2021"

[dependencies]
"#;

const PROJECT_MAIN: &str = r#"fn main() {
    println!("Hello, Rust Web IDE!");
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Bare,
    Provisioning,
    Ready,
    Failed,
}

/// The external root-changing tool, probed once at startup.
#[derive(Debug, Clone)]
pub struct SandboxTool {
    binary: String,
    available: bool,
}

impl SandboxTool {
    pub async fn probe(binary: &str) -> Self {
        let spec = RunSpec::new(
            Invocation::argv([binary, "--version"]),
            PROBE_TIMEOUT,
        );
        let available = matches!(
            process::run(&spec).await,
            Ok(ProcessOutcome::Completed(ref result)) if result.success()
        );
        info!(tool = binary, available, "Probed sandbox tool");
        Self {
            binary: binary.to_string(),
            available,
        }
    }

    pub fn unavailable(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            available: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Prefix `argv` so it runs re-rooted at `root` with working directory `cwd`.
    pub fn wrap(&self, root: &Path, cwd: &str, argv: Vec<String>) -> Vec<String> {
        let mut wrapped = vec![
            self.binary.clone(),
            "-r".to_string(),
            root.display().to_string(),
            "-w".to_string(),
            cwd.to_string(),
        ];
        for dir in SANDBOX_BINDS {
            wrapped.push("-b".to_string());
            wrapped.push(dir.to_string());
        }
        wrapped.extend(argv);
        wrapped
    }
}

/// Serializable view of an environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentInfo {
    pub id: String,
    pub user_id: String,
    pub workspace: PathBuf,
    pub state: ProvisionState,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SandboxEnvironment {
    id: String,
    user_id: String,
    workspace: PathBuf,
    created_at: DateTime<Utc>,
    state: Mutex<ProvisionState>,
    last_used: Mutex<DateTime<Utc>>,
    tool: Arc<SandboxTool>,
    max_file_bytes: usize,
}

impl SandboxEnvironment {
    pub fn new(
        id: String,
        user_id: String,
        workspace: PathBuf,
        state: ProvisionState,
        created_at: DateTime<Utc>,
        last_used: DateTime<Utc>,
        tool: Arc<SandboxTool>,
    ) -> Self {
        Self {
            id,
            user_id,
            workspace,
            created_at,
            state: Mutex::new(state),
            last_used: Mutex::new(last_used),
            tool,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: usize) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        *lock(&self.last_used)
    }

    pub fn touch(&self) {
        *lock(&self.last_used) = Utc::now();
    }

    pub fn state(&self) -> ProvisionState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: ProvisionState) {
        let mut current = lock(&self.state);
        info!(env_id = %self.id, from = ?*current, to = ?state, "Provisioning state changed");
        *current = state;
    }

    /// Enter `Provisioning` unless a job already holds it.
    pub fn begin_provisioning(&self) -> bool {
        let mut current = lock(&self.state);
        if *current == ProvisionState::Provisioning {
            return false;
        }
        *current = ProvisionState::Provisioning;
        true
    }

    pub fn is_sandboxed(&self) -> bool {
        self.state() == ProvisionState::Ready && self.tool.is_available()
    }

    pub fn info(&self) -> EnvironmentInfo {
        EnvironmentInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            workspace: self.workspace.clone(),
            state: self.state(),
            created_at: self.created_at,
            last_used: self.last_used(),
        }
    }

    /// Create the workspace and a starter Cargo project; existing files are kept.
    pub fn scaffold(&self) -> Result<()> {
        std::fs::create_dir_all(self.workspace.join("src"))?;
        let manifest = self.workspace.join("Cargo.toml");
        if !manifest.exists() {
            std::fs::write(&manifest, PROJECT_MANIFEST)?;
        }
        let main = self.workspace.join("src").join("main.rs");
        if !main.exists() {
            std::fs::write(&main, PROJECT_MAIN)?;
        }
        Ok(())
    }

    /// Run a command against this environment, through the sandbox tool when
    /// the environment is provisioned and directly on the host otherwise.
    pub async fn run(
        &self,
        invocation: Invocation,
        cwd: Option<&Path>,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ProcessOutcome> {
        self.touch();
        let host_cwd = cwd.map(Path::to_path_buf).unwrap_or_else(|| self.workspace.clone());

        let mut spec = if self.is_sandboxed() {
            let inner_cwd = self.sandbox_path(&host_cwd);
            let mut argv = invocation.into_argv();
            if let Some(program) = argv.first_mut() {
                let path = Path::new(program.as_str());
                if path.is_absolute() && path.starts_with(&self.workspace) {
                    *program = self.sandbox_path(path);
                }
            }
            let argv = self.tool.wrap(&self.workspace, &inner_cwd, argv);
            debug!(env_id = %self.id, cwd = %inner_cwd, "Running inside sandbox");
            RunSpec::new(Invocation::Argv(argv), timeout)
        } else {
            debug!(env_id = %self.id, cwd = ?host_cwd, "Running directly on host");
            RunSpec::new(invocation, timeout).cwd(&host_cwd)
        };
        if let Some(stdin) = stdin {
            spec = spec.stdin(stdin);
        }
        process::run(&spec).await
    }

    /// Argument vector and host working directory for an interactive shell.
    pub fn shell_command(&self, shell: &str) -> (Vec<String>, PathBuf) {
        let argv = vec![shell.to_string()];
        if self.is_sandboxed() {
            (self.tool.wrap(&self.workspace, "/", argv), self.workspace.clone())
        } else {
            (argv, self.workspace.clone())
        }
    }

    /// Map a host path under the workspace to its path inside the sandbox root.
    pub fn sandbox_path(&self, host: &Path) -> String {
        match host.strip_prefix(&self.workspace) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.display()),
            Err(_) => "/".to_string(),
        }
    }

    /// Resolve a caller-supplied path inside the workspace, refusing escapes.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let normalized = path.trim_start_matches('/');
        if normalized.is_empty() {
            return Err(Error::InvalidPath(path.to_string()));
        }
        let relative = Path::new(normalized);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::InvalidPath(path.to_string()));
        }
        Ok(self.workspace.join(relative))
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve(path)?;
        self.touch();
        match tokio::fs::read(&full_path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("file", path))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.resolve(path)?;
        if content.len() > self.max_file_bytes {
            return Err(Error::InvalidInput(format!(
                "file of {} bytes exceeds the {} byte limit",
                content.len(),
                self.max_file_bytes
            )));
        }
        self.touch();
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, content).await?;
        tokio::fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
