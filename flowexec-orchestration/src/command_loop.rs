//! Dispatches `COMMUNICATE` and `FINISH` control commands, reconstructing
//! effective settings and invoking the [`Scanner`] or cleaning up finished
//! runtimes.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use flowexec_shared::config::FlowManagerConfig;
use flowexec_shared::control_bus::{CommandExtra, ControlCommand};
use flowexec_shared::error::FlowResult;
use flowexec_shared::shared_state::{SharedState, KEY_EXECUTOR_COUNT, KEY_SETTINGS_OVERRIDE, KEY_SYNC_SEMAPHORE};

use crate::scanner::Scanner;

/// Injectable hook so the core stays free of any particular cache
/// implementation; called on every `COMMUNICATE` when configured, mirroring
/// the reference codebase's content-type cache eviction (the worker runs
/// outside the request cycle that would otherwise invalidate it).
pub trait CacheEvictor: Send + Sync + std::fmt::Debug {
    fn evict(&self);
}

#[derive(Debug)]
pub struct CommandLoop {
    config: FlowManagerConfig,
    shared_state: SharedState,
    scanner: Scanner,
    cache_evictor: Option<Arc<dyn CacheEvictor>>,
}

impl CommandLoop {
    pub fn new(
        config: FlowManagerConfig,
        shared_state: SharedState,
        scanner: Scanner,
        cache_evictor: Option<Arc<dyn CacheEvictor>>,
    ) -> Self {
        Self {
            config,
            shared_state,
            scanner,
            cache_evictor,
        }
    }

    /// Build effective settings in increasing precedence: host environment,
    /// the shared override map, then per-message overrides.
    async fn effective_settings(
        &self,
        per_message: &Map<String, Value>,
    ) -> FlowResult<Map<String, Value>> {
        let mut settings: Map<String, Value> = FlowManagerConfig::host_environment_settings()
            .into_iter()
            .collect();

        let overrides: Map<String, Value> = self
            .shared_state
            .get(KEY_SETTINGS_OVERRIDE)
            .await?
            .unwrap_or_default();
        settings.extend(overrides);
        settings.extend(per_message.clone());

        Ok(settings)
    }

    /// Invoked with one command at a time by the bus transport.
    #[instrument(skip(self, command))]
    pub async fn handle(&self, command: ControlCommand) -> FlowResult<()> {
        match command {
            ControlCommand::Communicate { settings, extra } => {
                self.handle_communicate(settings, extra).await
            }
            ControlCommand::Finish {
                data_id,
                spawned,
                follow_up_extra,
            } => self.handle_finish(data_id, spawned, follow_up_extra).await,
        }
    }

    async fn handle_communicate(
        &self,
        settings: Map<String, Value>,
        extra: CommandExtra,
    ) -> FlowResult<()> {
        let _effective = self.effective_settings(&settings).await?;

        if self.config.manager.disable_ctype_cache {
            if let Some(evictor) = &self.cache_evictor {
                evictor.evict();
            }
        }

        // The semaphore debit always fires, even if the scan itself errors,
        // so a failing pass cannot pin the barrier.
        let scan_result = self.scanner.scan(extra.executor.as_deref()).await;
        self.shared_state.add(KEY_SYNC_SEMAPHORE, -1).await?;
        scan_result.map(|_| ())
    }

    async fn handle_finish(
        &self,
        data_id: i64,
        spawned: bool,
        follow_up_extra: CommandExtra,
    ) -> FlowResult<()> {
        if !self.config.manager.keep_data {
            self.remove_runtime_dir(data_id).await;
        }

        if spawned {
            self.shared_state.add(KEY_SYNC_SEMAPHORE, 1).await?;
            let scan_result = self
                .scanner
                .scan(follow_up_extra.executor.as_deref())
                .await;
            self.shared_state.add(KEY_SYNC_SEMAPHORE, -1).await?;
            scan_result?;
        }

        self.shared_state.add(KEY_EXECUTOR_COUNT, -1).await?;
        self.shared_state.add(KEY_SYNC_SEMAPHORE, -1).await?;
        Ok(())
    }

    /// Recursively remove the task's runtime directory, with a fallback
    /// that `chmod`s denied entries to `0o700` and retries once.
    async fn remove_runtime_dir(&self, task_id: i64) {
        let dir = Path::new(&self.config.executor.runtime_dir).join(task_id.to_string());
        if !dir.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!(task_id, error = %e, "initial runtime dir removal failed, retrying after chmod");
            if chmod_tree_rwx(&dir).is_ok() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(task_id, error = %e, "runtime dir removal failed even after chmod retry");
                    return;
                }
            }
        }
        info!(task_id, "runtime directory removed");
    }
}

#[cfg(unix)]
fn chmod_tree_rwx(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        if path.is_dir() {
            chmod_tree_rwx(&path)?;
        }
    }
    Ok(())
}
