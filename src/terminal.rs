//! Registry of live terminal sessions keyed by opaque session id.

use crate::error::{Error, Result};
use crate::pty::PtySession;
use crate::sandbox::SandboxEnvironment;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

/// How a send collects output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    /// Wait the grace period, then return whatever accumulated.
    #[default]
    Poll,
    /// Return immediately; output is fetched separately.
    Stream,
}

pub struct TerminalSessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PtySession>>>,
    shell: String,
    max_sessions: usize,
    idle_timeout: Duration,
    grace: Duration,
}

impl TerminalSessionRegistry {
    pub fn new(shell: impl Into<String>, max_sessions: usize, idle_timeout: Duration, grace: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            shell: shell.into(),
            max_sessions,
            idle_timeout,
            grace,
        }
    }

    /// Start a shell bound to the environment's workspace.
    pub async fn open(&self, env: &SandboxEnvironment) -> Result<String> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(Error::ResourceExhausted(format!(
                "terminal session limit of {} reached",
                self.max_sessions
            )));
        }

        env.touch();
        let (argv, cwd) = env.shell_command(&self.shell);
        let id = uuid::Uuid::new_v4().to_string();
        let session = PtySession::spawn(id.clone(), env.id().to_string(), &argv, &cwd)?;
        sessions.insert(id.clone(), Arc::new(session));
        Ok(id)
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<PtySession>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", session_id))
    }

    /// Send one input line. In poll mode the output gathered during the
    /// grace period is returned; in stream mode nothing is.
    pub async fn send(&self, session_id: &str, line: &str, mode: SendMode) -> Result<Option<String>> {
        let session = self.get(session_id).await?;
        session.send_line(line).await?;
        match mode {
            SendMode::Stream => Ok(None),
            SendMode::Poll => {
                tokio::time::sleep(self.grace).await;
                Ok(Some(session.drain().await))
            }
        }
    }

    pub async fn drain(&self, session_id: &str) -> Result<String> {
        Ok(self.get(session_id).await?.drain().await)
    }

    /// Close and forget a session. Unknown or already closed ids are a no-op.
    pub async fn close(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = removed {
            session.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close sessions idle past the timeout or whose shell has exited.
    pub async fn evict_idle(&self) -> usize {
        let expired: Vec<Arc<PtySession>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| !s.is_alive() || s.idle_for() > self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            info!(
                session_id = %session.id(),
                env_id = %session.env_id(),
                pid = ?session.pid(),
                idle = ?session.idle_for(),
                "Evicting terminal session"
            );
            session.close().await;
        }
        expired.len()
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<PtySession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in drained {
            session.close().await;
        }
    }

    /// Periodically evict idle sessions.
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = interval(period);
            loop {
                interval.tick().await;
                if registry.is_empty().await {
                    continue;
                }
                let evicted = registry.evict_idle().await;
                if evicted > 0 {
                    let remaining = registry.len().await;
                    info!(evicted, remaining, "Reaped idle terminal sessions");
                }
            }
        })
    }
}
