//! Runs one external program to completion under a wall-clock deadline.

use crate::error::{Error, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long output readers may keep draining once the process is gone.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// What to launch: an argument vector or a line for `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Argv(Vec<String>),
    Shell(String),
}

impl Invocation {
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::Argv(args.into_iter().map(Into::into).collect())
    }

    pub fn into_argv(self) -> Vec<String> {
        match self {
            Invocation::Argv(argv) => argv,
            Invocation::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line],
        }
    }
}

/// Everything needed to run one process.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub invocation: Invocation,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl RunSpec {
    pub fn new(invocation: Invocation, timeout: Duration) -> Self {
        Self {
            invocation,
            cwd: None,
            stdin: None,
            env: HashMap::new(),
            timeout,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Result of a process that ran to completion.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Timeouts are an outcome, not an error. A timed-out run carries no output.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Completed(RunResult),
    TimedOut,
}

/// Spawn `spec` in its own process group and wait for it, killing the whole
/// group once the deadline passes.
pub async fn run(spec: &RunSpec) -> Result<ProcessOutcome> {
    let argv = spec.invocation.clone().into_argv();
    let (program, args) = argv.split_first().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        ))
    })?;

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&spec.env)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    debug!(command = ?argv, cwd = ?spec.cwd, timeout = ?spec.timeout, "Spawning process");
    let mut child = command.spawn()?;
    let pid = child.id();

    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            // The child may exit without reading; a broken pipe is expected then.
            let _ = stdin.write_all(&input).await;
        });
    }

    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(status) => {
            let status = status?;
            // Anything the program left behind in its group goes with it.
            kill_group(pid);
            let stdout = collect(stdout_task).await;
            let stderr = collect(stderr_task).await;
            debug!(exit = ?status.code(), signal = ?status.signal(), "Process exited");
            Ok(ProcessOutcome::Completed(RunResult {
                stdout,
                stderr,
                exit_code: status.code(),
                signal: status.signal(),
            }))
        }
        Err(_) => {
            info!(command = ?argv, timeout = ?spec.timeout, "Deadline exceeded, killing process group");
            kill_group(pid);
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to reap timed-out process");
            }
            // Partial output is discarded.
            stdout_task.abort();
            stderr_task.abort();
            Ok(ProcessOutcome::TimedOut)
        }
    }
}

/// SIGKILL every process in the group led by `pid`.
pub fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let Ok(raw) = i32::try_from(pid) else { return };
    // ESRCH just means the group is already empty.
    let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

async fn collect(task: JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            warn!("Output pipe still held open by an escaped process");
            String::new()
        }
    }
}
