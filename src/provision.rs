//! Background jobs that install a base root filesystem into an environment.
//!
//! Each job runs the bootstrap program for one user, turns its output lines
//! into progress events on a broadcast channel, and moves the environment to
//! `Ready` or `Failed` when the program ends. A user has at most one job at a
//! time; a second start is rejected.

use crate::environment::EnvironmentRegistry;
use crate::error::{Error, Result};
use crate::process::kill_group;
use crate::sandbox::{ProvisionState, SandboxEnvironment};
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

const PERCENT_STARTED: u8 = 0;
const PERCENT_RUNNING: u8 = 20;
const PERCENT_FINALIZING: u8 = 50;
const PERCENT_DONE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub message: String,
    pub percent: u8,
    /// Set on the last event a job publishes.
    pub terminal: bool,
}

struct ActiveJob {
    env_id: String,
    events: broadcast::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

enum JobEnd {
    Cancelled,
    Failed(Error),
}

impl From<Error> for JobEnd {
    fn from(e: Error) -> Self {
        JobEnd::Failed(e)
    }
}

impl From<std::io::Error> for JobEnd {
    fn from(e: std::io::Error) -> Self {
        JobEnd::Failed(e.into())
    }
}

pub struct Provisioner {
    environments: Arc<EnvironmentRegistry>,
    /// Bootstrap program and leading arguments; workspace and user id follow.
    command: Vec<String>,
    /// Active jobs keyed by user id.
    active: Mutex<HashMap<String, ActiveJob>>,
    /// Most recent event per environment.
    last_events: Mutex<HashMap<String, ProgressEvent>>,
}

impl Provisioner {
    pub fn new(environments: Arc<EnvironmentRegistry>, command: Vec<String>) -> Self {
        Self {
            environments,
            command,
            active: Mutex::new(HashMap::new()),
            last_events: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule a job and return a receiver for its progress. Returns as soon
    /// as the job is spawned.
    pub async fn start(self: &Arc<Self>, env_id: &str) -> Result<broadcast::Receiver<ProgressEvent>> {
        let env = self.environments.get(env_id).await?;
        let user_id = env.user_id().to_string();

        let (rx, events, cancel) = {
            let mut active = lock(&self.active);
            if active.contains_key(&user_id) || !env.begin_provisioning() {
                info!(env_id, user_id = %user_id, "Provisioning already running");
                return Err(Error::AlreadyRunning(user_id));
            }
            let (events, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            let cancel = CancellationToken::new();
            active.insert(
                user_id.clone(),
                ActiveJob {
                    env_id: env_id.to_string(),
                    events: events.clone(),
                    cancel: cancel.clone(),
                },
            );
            (rx, events, cancel)
        };

        info!(env_id, user_id = %user_id, "Provisioning accepted");
        let this = self.clone();
        tokio::spawn(async move { this.run_job(env, events, cancel).await });
        Ok(rx)
    }

    /// Receiver for the job currently running for this environment's user.
    pub async fn subscribe(&self, env_id: &str) -> Result<Option<broadcast::Receiver<ProgressEvent>>> {
        let env = self.environments.get(env_id).await?;
        Ok(lock(&self.active)
            .get(env.user_id())
            .map(|job| job.events.subscribe()))
    }

    /// Cancel the running job, if any. Returns whether one was running.
    pub async fn cancel(&self, env_id: &str) -> Result<bool> {
        let env = self.environments.get(env_id).await?;
        let token = lock(&self.active)
            .get(env.user_id())
            .map(|job| job.cancel.clone());
        match token {
            Some(token) => {
                info!(env_id, "Cancelling provisioning");
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_running(&self, env_id: &str) -> bool {
        lock(&self.active).values().any(|job| job.env_id == env_id)
    }

    pub fn last_event(&self, env_id: &str) -> Option<ProgressEvent> {
        lock(&self.last_events).get(env_id).cloned()
    }

    async fn run_job(
        self: Arc<Self>,
        env: Arc<SandboxEnvironment>,
        events: broadcast::Sender<ProgressEvent>,
        cancel: CancellationToken,
    ) {
        self.publish(&env, &events, "start", "Starting base filesystem bootstrap", PERCENT_STARTED, false);

        let (state, stage, message, percent) = match self.bootstrap(&env, &events, &cancel).await {
            Ok(()) => (
                ProvisionState::Ready,
                "complete",
                "Environment is ready".to_string(),
                PERCENT_DONE,
            ),
            Err(JobEnd::Cancelled) => (
                ProvisionState::Failed,
                "cancelled",
                "Provisioning was cancelled".to_string(),
                PERCENT_STARTED,
            ),
            Err(JobEnd::Failed(e)) => {
                warn!(env_id = %env.id(), error = %e, "Provisioning failed");
                (ProvisionState::Failed, "error", e.to_string(), PERCENT_STARTED)
            }
        };

        if let Err(e) = self.environments.record_state(&env, state).await {
            warn!(env_id = %env.id(), error = %e, "Failed to persist provisioning state");
        }
        lock(&self.active).remove(env.user_id());
        self.publish(&env, &events, stage, &message, percent, true);
        info!(env_id = %env.id(), ?state, "Provisioning finished");
    }

    async fn bootstrap(
        &self,
        env: &SandboxEnvironment,
        events: &broadcast::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), JobEnd> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| Error::UpstreamUnavailable("no bootstrap command configured".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .arg(env.workspace())
            .arg(env.user_id())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::UpstreamUnavailable(format!("bootstrap {}: {}", program, e)))?;
        let pid = child.id();

        let (line_tx, mut lines) = mpsc::channel(64);
        tokio::spawn(forward_lines(child.stdout.take(), line_tx.clone()));
        tokio::spawn(forward_lines(child.stderr.take(), line_tx));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    kill_group(pid);
                    let _ = child.kill().await;
                    return Err(JobEnd::Cancelled);
                }
                line = lines.recv() => match line {
                    Some(line) => {
                        debug!(env_id = %env.id(), line = %line, "Bootstrap output");
                        self.publish(env, events, "bootstrap", &line, PERCENT_RUNNING, false);
                    }
                    None => break,
                },
            }
        }

        self.publish(env, events, "finalizing", "Waiting for bootstrap to exit", PERCENT_FINALIZING, false);
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                kill_group(pid);
                let _ = child.kill().await;
                return Err(JobEnd::Cancelled);
            }
            status = child.wait() => status?,
        };
        kill_group(pid);

        if status.success() {
            Ok(())
        } else {
            Err(Error::UpstreamUnavailable(format!("bootstrap exited with {}", status)).into())
        }
    }

    fn publish(
        &self,
        env: &SandboxEnvironment,
        events: &broadcast::Sender<ProgressEvent>,
        stage: &str,
        message: &str,
        percent: u8,
        terminal: bool,
    ) {
        let event = ProgressEvent {
            stage: stage.to_string(),
            message: message.to_string(),
            percent,
            terminal,
        };
        lock(&self.last_events).insert(env.id().to_string(), event.clone());
        // No subscribers is fine; the last event is kept for status queries.
        let _ = events.send(event);
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: Option<R>, tx: mpsc::Sender<String>) {
    let Some(stream) = stream else { return };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // Bytes are decoded lossily so the pipe keeps draining.
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Bootstrap output read failed");
                break;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
