//! Codebox - per-user Rust workspaces with compile-and-run, terminals and
//! root filesystem provisioning behind an HTTP API.
//!
//! Usage:
//!   codebox serve [--port 5554]           # Start HTTP server
//!   codebox check                         # Check the host and lay out directories
//!   codebox --run -- <command> [args]     # Run one command with a deadline

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

mod config;
mod environment;
mod error;
mod execution;
mod http_server;
mod identity;
mod process;
mod provision;
mod pty;
mod sandbox;
mod state;
mod store;
mod terminal;

use clap::{Parser, Subcommand};
use config::{Config, ServeArgs};
use execution::Toolchain;
use process::{Invocation, ProcessOutcome, RunSpec};
use sandbox::SandboxTool;
use state::AppState;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use store::JsonFileStore;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "codebox")]
#[command(about = "Per-user Rust workspaces with an HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Run command directly
    #[arg(long)]
    run: bool,

    /// Wall-clock limit in milliseconds
    #[arg(long, default_value = "10000")]
    time: u64,

    /// Command and arguments to run
    #[arg(last = true)]
    cmd_args: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Report toolchain availability and create the working directories
    Check(ServeArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Serve(serve)) => {
            let config = Config::from(serve);
            let tool = SandboxTool::probe(&config.sandbox_tool).await;
            let store = Arc::new(JsonFileStore::new(&config.registry_file));
            let registry_file = store.path().to_path_buf();
            let state = AppState::new(&config, tool, store, Toolchain::cargo());
            info!(
                workspace = ?config.workspace_dir,
                registry = ?registry_file,
                sandboxed = state.environments.tool().is_available(),
                "Loaded configuration"
            );
            if let Err(e) = http_server::run_server(config.port, state).await {
                error!(error = %e, "Server failed");
                exit(1);
            }
        }
        Some(Commands::Check(serve)) => {
            let config = Config::from(serve);
            if let Err(e) = check(&config).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        None if args.run => {
            if args.cmd_args.is_empty() {
                eprintln!("Error: No command specified");
                exit(1);
            }
            let spec = RunSpec::new(
                Invocation::Argv(args.cmd_args),
                Duration::from_millis(args.time),
            );
            match process::run(&spec).await {
                Ok(ProcessOutcome::Completed(result)) => {
                    print!("{}", result.stdout);
                    eprint!("{}", result.stderr);
                    exit(result.exit_code.unwrap_or(1));
                }
                Ok(ProcessOutcome::TimedOut) => {
                    eprintln!("Error: time limit of {} ms exceeded", args.time);
                    exit(124);
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
        None => {
            eprintln!("Error: Use 'serve' or 'check' subcommand or --run flag");
            exit(1);
        }
    }
}

/// Report which external tools are present and create the directory layout
/// the server expects.
async fn check(config: &Config) -> std::io::Result<()> {
    for tool in ["rustc", "cargo"] {
        let spec = RunSpec::new(Invocation::argv([tool, "--version"]), Duration::from_secs(10));
        match process::run(&spec).await {
            Ok(ProcessOutcome::Completed(result)) if result.success() => {
                println!("{:<8} {}", tool, result.stdout.trim());
            }
            _ => println!("{:<8} not found", tool),
        }
    }
    let tool = SandboxTool::probe(&config.sandbox_tool).await;
    println!(
        "{:<8} {}",
        config.sandbox_tool,
        if tool.is_available() { "available" } else { "not found, environments run unsandboxed" }
    );

    let scripts_dir = config
        .bootstrap_script
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    for dir in [config.workspace_dir.as_path(), Path::new("logs"), scripts_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }
    if !config.bootstrap_script.exists() {
        println!("warning: bootstrap script {:?} is missing", config.bootstrap_script);
    }
    if !config.registry_file.exists() {
        tokio::fs::write(&config.registry_file, "{}\n").await?;
        println!("created {:?}", config.registry_file);
    }
    println!("workspace ready at {:?}", config.workspace_dir);
    Ok(())
}
