//! Creates and looks up the one current environment per user.

use crate::error::{Error, Result};
use crate::sandbox::{ProvisionState, SandboxEnvironment, SandboxTool, DEFAULT_MAX_FILE_BYTES};
use crate::store::{EnvironmentStore, UserRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Default)]
struct Inner {
    environments: HashMap<String, Arc<SandboxEnvironment>>,
    current: HashMap<String, String>,
}

pub struct EnvironmentRegistry {
    base_dir: PathBuf,
    tool: Arc<SandboxTool>,
    store: Arc<dyn EnvironmentStore>,
    max_file_bytes: usize,
    inner: RwLock<Inner>,
}

impl EnvironmentRegistry {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        tool: Arc<SandboxTool>,
        store: Arc<dyn EnvironmentStore>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            tool,
            store,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Size ceiling for files written into environments created from now on.
    pub fn with_max_file_bytes(mut self, max_file_bytes: usize) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    pub fn tool(&self) -> &SandboxTool {
        &self.tool
    }

    /// Return the user's current environment, reloading a recorded one or
    /// creating a fresh one when nothing usable is recorded.
    pub async fn create_or_get(&self, user_id: &str) -> Result<Arc<SandboxEnvironment>> {
        validate_user_id(user_id)?;
        let mut inner = self.inner.write().await;

        if let Some(env) = inner
            .current
            .get(user_id)
            .and_then(|id| inner.environments.get(id))
            .cloned()
        {
            env.touch();
            return Ok(env);
        }

        let now = Utc::now();
        let recorded = self.store.load(user_id)?.filter(|record| {
            self.workspace_for(user_id, &record.environment_id).is_dir()
        });

        let (env, record) = match recorded {
            Some(record) => {
                let state = if record.initialized {
                    ProvisionState::Ready
                } else {
                    ProvisionState::Bare
                };
                let env = SandboxEnvironment::new(
                    record.environment_id.clone(),
                    user_id.to_string(),
                    self.workspace_for(user_id, &record.environment_id),
                    state,
                    record.created_at,
                    now,
                    self.tool.clone(),
                )
                .with_max_file_bytes(self.max_file_bytes);
                info!(env_id = %env.id(), user_id, ?state, "Loaded recorded environment");
                (env, UserRecord { last_used: now, ..record })
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let env = SandboxEnvironment::new(
                    id.clone(),
                    user_id.to_string(),
                    self.workspace_for(user_id, &id),
                    ProvisionState::Bare,
                    now,
                    now,
                    self.tool.clone(),
                )
                .with_max_file_bytes(self.max_file_bytes);
                info!(env_id = %id, user_id, workspace = ?env.workspace(), "Created environment");
                let record = UserRecord {
                    environment_id: id,
                    created_at: now,
                    last_used: now,
                    initialized: false,
                };
                (env, record)
            }
        };

        let env = Arc::new(env);
        // The workspace must exist before the environment becomes visible.
        tokio::task::spawn_blocking({
            let env = env.clone();
            move || env.scaffold()
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        self.store.save(user_id, &record)?;
        inner.current.insert(user_id.to_string(), env.id().to_string());
        inner.environments.insert(env.id().to_string(), env.clone());
        Ok(env)
    }

    pub async fn get(&self, env_id: &str) -> Result<Arc<SandboxEnvironment>> {
        self.inner
            .read()
            .await
            .environments
            .get(env_id)
            .cloned()
            .ok_or_else(|| Error::not_found("environment", env_id))
    }

    pub async fn current_for(&self, user_id: &str) -> Option<Arc<SandboxEnvironment>> {
        let inner = self.inner.read().await;
        inner
            .current
            .get(user_id)
            .and_then(|id| inner.environments.get(id))
            .cloned()
    }

    /// True once the environment has a provisioned root filesystem.
    pub async fn provisioning_status(&self, env_id: &str) -> Result<bool> {
        Ok(self.get(env_id).await?.state() == ProvisionState::Ready)
    }

    /// Apply a provisioning transition and persist the initialized flag.
    pub async fn record_state(&self, env: &SandboxEnvironment, state: ProvisionState) -> Result<()> {
        env.set_state(state);
        let record = UserRecord {
            environment_id: env.id().to_string(),
            created_at: env.created_at(),
            last_used: env.last_used(),
            initialized: state == ProvisionState::Ready,
        };
        self.store.save(env.user_id(), &record)
    }

    /// Mark the environment as used and persist the new `last_used`.
    pub fn record_use(&self, env: &SandboxEnvironment) -> Result<()> {
        env.touch();
        let initialized = match env.state() {
            ProvisionState::Ready => true,
            // A running job leaves the recorded flag as it was.
            ProvisionState::Provisioning => self
                .store
                .load(env.user_id())?
                .filter(|record| record.environment_id == env.id())
                .is_some_and(|record| record.initialized),
            ProvisionState::Bare | ProvisionState::Failed => false,
        };
        self.store.save(
            env.user_id(),
            &UserRecord {
                environment_id: env.id().to_string(),
                created_at: env.created_at(),
                last_used: env.last_used(),
                initialized,
            },
        )
    }

    fn workspace_for(&self, user_id: &str, env_id: &str) -> PathBuf {
        self.base_dir.join(user_id).join(env_id)
    }
}

fn validate_user_id(user_id: &str) -> Result<()> {
    let mut components = Path::new(user_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::InvalidPath(format!("user id {:?}", user_id))),
    }
}
