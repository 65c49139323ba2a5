//! Compile-and-run of user source inside an environment.

use crate::environment::EnvironmentRegistry;
use crate::error::{Error, Result};
use crate::process::{Invocation, ProcessOutcome};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Where the source goes, how it is built and what gets run.
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Entry-point source file, relative to the workspace.
    pub entry_point: PathBuf,
    pub build: Invocation,
    /// Produced executable, relative to the workspace.
    pub binary: PathBuf,
}

impl Toolchain {
    pub fn cargo() -> Self {
        Self {
            entry_point: PathBuf::from("src/main.rs"),
            build: Invocation::argv(["cargo", "build", "--release", "--target-dir", "target"]),
            binary: PathBuf::from("target/release/user_project"),
        }
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::cargo()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    CompileError,
    RuntimeTimeout,
    EnvironmentError,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub stdout: String,
    pub stderr: String,
    /// Absent unless the program actually ran to completion.
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionResult {
    /// The failure this result represents, if any.
    pub fn failure(&self, timeout: Duration) -> Option<Error> {
        match self.outcome {
            ExecutionOutcome::Success => match self.exit_code {
                Some(0) | None => None,
                Some(exit_code) => Some(Error::ExecutionFailure { exit_code }),
            },
            ExecutionOutcome::CompileError => Some(Error::CompileFailure {
                stderr: self.stderr.clone(),
            }),
            ExecutionOutcome::RuntimeTimeout => Some(Error::Timeout(timeout)),
            ExecutionOutcome::EnvironmentError => Some(Error::Io(std::io::Error::other(
                self.message.clone().unwrap_or_default(),
            ))),
        }
    }

    fn without_output(outcome: ExecutionOutcome, message: String) -> Self {
        Self {
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            message: Some(message),
        }
    }
}

pub struct ExecutionEngine {
    environments: Arc<EnvironmentRegistry>,
    toolchain: Toolchain,
    compile_timeout: Duration,
    run_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(
        environments: Arc<EnvironmentRegistry>,
        toolchain: Toolchain,
        compile_timeout: Duration,
        run_timeout: Duration,
    ) -> Self {
        Self {
            environments,
            toolchain,
            compile_timeout,
            run_timeout,
        }
    }

    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    /// Replace the entry point with `source`, build it, and run the result.
    ///
    /// Concurrent calls against one environment are not serialized; the last
    /// write of the entry point before a build wins.
    pub async fn execute(&self, env_id: &str, source: &str, stdin: &str) -> ExecutionResult {
        info!(env_id, source_len = source.len(), "Executing source");
        let result = match self.compile_and_run(env_id, source, stdin).await {
            Ok(result) => result,
            Err(e) => {
                warn!(env_id, error = %e, "Execution failed in the environment");
                ExecutionResult::without_output(ExecutionOutcome::EnvironmentError, e.to_string())
            }
        };
        info!(env_id, outcome = ?result.outcome, exit_code = ?result.exit_code, "Execution finished");
        result
    }

    async fn compile_and_run(&self, env_id: &str, source: &str, stdin: &str) -> Result<ExecutionResult> {
        let env = self.environments.get(env_id).await?;
        if let Err(e) = self.environments.record_use(&env) {
            warn!(env_id, error = %e, "Failed to persist last use");
        }
        let entry_point = env.workspace().join(&self.toolchain.entry_point);
        if let Some(parent) = entry_point.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&entry_point, source).await?;

        let build = env
            .run(self.toolchain.build.clone(), None, None, self.compile_timeout)
            .await?;
        match build {
            ProcessOutcome::TimedOut => {
                info!(env_id, timeout = ?self.compile_timeout, "Build timed out");
                return Ok(ExecutionResult::without_output(
                    ExecutionOutcome::RuntimeTimeout,
                    format!("build exceeded {:?}", self.compile_timeout),
                ));
            }
            ProcessOutcome::Completed(result) if !result.success() => {
                return Ok(ExecutionResult {
                    outcome: ExecutionOutcome::CompileError,
                    stdout: String::new(),
                    stderr: result.stderr,
                    exit_code: None,
                    message: None,
                });
            }
            ProcessOutcome::Completed(_) => {}
        }

        let binary = env.workspace().join(&self.toolchain.binary);
        let run = env
            .run(
                Invocation::Argv(vec![binary.display().to_string()]),
                None,
                Some(stdin.as_bytes().to_vec()),
                self.run_timeout,
            )
            .await?;
        Ok(match run {
            ProcessOutcome::TimedOut => {
                info!(env_id, timeout = ?self.run_timeout, "Run timed out");
                ExecutionResult::without_output(
                    ExecutionOutcome::RuntimeTimeout,
                    format!("execution exceeded {:?}", self.run_timeout),
                )
            }
            ProcessOutcome::Completed(result) => ExecutionResult {
                outcome: ExecutionOutcome::Success,
                stdout: result.stdout,
                stderr: result.stderr,
                exit_code: result.exit_code,
                message: None,
            },
        })
    }
}
