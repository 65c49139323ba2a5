//! Runtime configuration.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IDENTITY_URL: &str = "https://api.www.cdifit.cn/user/";

/// Settings shared by every component, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub workspace_dir: PathBuf,
    pub registry_file: PathBuf,
    pub identity_url: String,
    pub sandbox_tool: String,
    pub bootstrap_script: PathBuf,
    pub shell: String,
    pub max_terminal_sessions: usize,
    pub terminal_idle_timeout: Duration,
    pub terminal_grace: Duration,
    pub compile_timeout: Duration,
    pub run_timeout: Duration,
    pub max_file_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5554,
            workspace_dir: PathBuf::from("workspace"),
            registry_file: PathBuf::from("user_db.json"),
            identity_url: DEFAULT_IDENTITY_URL.to_string(),
            sandbox_tool: "proot".to_string(),
            bootstrap_script: PathBuf::from("scripts/bootstrap_rootfs.sh"),
            shell: "sh".to_string(),
            max_terminal_sessions: 100,
            terminal_idle_timeout: Duration::from_secs(3600),
            terminal_grace: Duration::from_millis(500),
            compile_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(10),
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Command-line flags for the `serve` subcommand.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "CODEBOX_PORT", default_value = "5554")]
    pub port: u16,

    /// Directory holding one workspace per user
    #[arg(long, env = "CODEBOX_WORKSPACE_DIR", default_value = "workspace")]
    pub workspace_dir: PathBuf,

    /// JSON file recording each user's environment
    #[arg(long, env = "CODEBOX_REGISTRY_FILE", default_value = "user_db.json")]
    pub registry_file: PathBuf,

    /// Base URL of the identity service
    #[arg(long, env = "CODEBOX_IDENTITY_URL", default_value = DEFAULT_IDENTITY_URL)]
    pub identity_url: String,

    /// Root-changing sandbox tool used for provisioned environments
    #[arg(long, default_value = "proot")]
    pub sandbox_tool: String,

    /// Script that installs a base root filesystem into a workspace
    #[arg(long, default_value = "scripts/bootstrap_rootfs.sh")]
    pub bootstrap_script: PathBuf,

    /// Shell started for interactive terminals
    #[arg(long, default_value = "sh")]
    pub shell: String,

    /// Maximum number of live terminal sessions
    #[arg(long, default_value = "100")]
    pub max_terminal_sessions: usize,

    /// Idle seconds before a terminal session is evicted
    #[arg(long, default_value = "3600")]
    pub terminal_idle_secs: u64,

    /// Milliseconds a polling send waits before collecting output
    #[arg(long, default_value = "500")]
    pub terminal_grace_ms: u64,

    /// Build deadline in seconds
    #[arg(long, default_value = "30")]
    pub compile_timeout_secs: u64,

    /// Run deadline in seconds
    #[arg(long, default_value = "10")]
    pub run_timeout_secs: u64,

    /// Largest file accepted by workspace writes, in bytes
    #[arg(long, default_value = "10485760")]
    pub max_file_bytes: usize,
}

impl From<ServeArgs> for Config {
    fn from(args: ServeArgs) -> Self {
        Self {
            port: args.port,
            workspace_dir: args.workspace_dir,
            registry_file: args.registry_file,
            identity_url: args.identity_url,
            sandbox_tool: args.sandbox_tool,
            bootstrap_script: args.bootstrap_script,
            shell: args.shell,
            max_terminal_sessions: args.max_terminal_sessions,
            terminal_idle_timeout: Duration::from_secs(args.terminal_idle_secs),
            terminal_grace: Duration::from_millis(args.terminal_grace_ms),
            compile_timeout: Duration::from_secs(args.compile_timeout_secs),
            run_timeout: Duration::from_secs(args.run_timeout_secs),
            max_file_bytes: args.max_file_bytes,
        }
    }
}
