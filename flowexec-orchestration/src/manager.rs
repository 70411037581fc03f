//! The process-wide manager handle: ties the engine registry, sandbox
//! builder, scanner, barrier, and command loop together, and enforces the
//! at-most-one-instance-per-process constraint.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::instrument;

use flowexec_shared::config::FlowManagerConfig;
use flowexec_shared::control_bus::{CommandExtra, ControlBus, ControlBusProvider};
use flowexec_shared::error::{FlowError, FlowResult};
use flowexec_shared::shared_state::{SharedState, SharedStateBackend, KEY_EXECUTOR_COUNT};

use crate::barrier::BarrierCoordinator;
use crate::command_loop::{CacheEvictor, CommandLoop};
use crate::engine_registry::EngineRegistry;
use crate::executor::Executor;
use crate::sandbox::{SandboxBuilder, SettingsExtension};
use crate::scanner::{Scanner, ScheduleHandler};
use crate::task::TaskStore;

static SINGLETON_GUARD: OnceCell<()> = OnceCell::new();

struct ManagerScheduleHandler {
    engine_registry: Arc<RwLock<EngineRegistry>>,
    sandbox_builder: Arc<SandboxBuilder>,
    executor: Arc<dyn Executor>,
    shared_state: SharedState,
    task_store: Arc<dyn TaskStore>,
    host_url: String,
}

impl std::fmt::Debug for ManagerScheduleHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerScheduleHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl ScheduleHandler for ManagerScheduleHandler {
    #[instrument(skip(self, program))]
    async fn schedule(&self, task_id: i64, program: String) -> FlowResult<()> {
        let executor_handle = {
            let registry = self.engine_registry.read().await;
            registry.executor()?.clone()
        };

        let sandbox = match self.sandbox_builder.build(
            task_id,
            &program,
            &executor_handle,
            &self.host_url,
            SettingsExtension::default(),
        ) {
            Ok(sandbox) => sandbox,
            Err(FlowError::PermissionDenied(msg)) => {
                // The task was already committed WAITING by the scanner;
                // overwrite it with ERROR now that the hand-off itself
                // failed. The caller (scanner::scan_one) reports this task
                // as errored and moves on to the next one.
                if let Some(mut task) = self.task_store.lock_for_update(task_id).await? {
                    task.mark_error(msg.clone(), 1);
                    task.rerender_name();
                    self.task_store.commit(task).await?;
                }
                return Err(FlowError::PermissionDenied(msg));
            }
            Err(e) => return Err(e),
        };

        self.shared_state.add(KEY_EXECUTOR_COUNT, 1).await?;

        self.executor
            .run(task_id, sandbox.runtime_dir, sandbox.argv, 0)
            .await
    }
}

/// The process-wide job execution manager. At most one may exist per
/// process; [`FlowManager::new`] fails if a prior instance was already
/// constructed, via a process-wide [`OnceCell`] guard rather than an ad hoc
/// static flag.
#[derive(Debug, Clone)]
pub struct FlowManager {
    config: FlowManagerConfig,
    shared_state: SharedState,
    control_bus: ControlBus,
    control_channel: String,
    engine_registry: Arc<RwLock<EngineRegistry>>,
    barrier: BarrierCoordinator,
    command_loop: Arc<CommandLoop>,
}

impl FlowManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FlowManagerConfig,
        shared_state_backend: Arc<dyn SharedStateBackend>,
        control_bus_provider: ControlBusProvider,
        control_channel: impl Into<String>,
        task_store: Arc<dyn TaskStore>,
        engine_registry: EngineRegistry,
        sandbox_builder: SandboxBuilder,
        executor: Arc<dyn Executor>,
        cache_evictor: Option<Arc<dyn CacheEvictor>>,
    ) -> FlowResult<Self> {
        SINGLETON_GUARD
            .set(())
            .map_err(|_| FlowError::AlreadyInitialized)?;

        let control_channel = control_channel.into();
        let shared_state = SharedState::new("flowexec", shared_state_backend);
        let control_bus = ControlBus::new(control_bus_provider);
        let engine_registry = Arc::new(RwLock::new(engine_registry));

        let schedule_handler = Arc::new(ManagerScheduleHandler {
            engine_registry: engine_registry.clone(),
            sandbox_builder: Arc::new(sandbox_builder),
            executor,
            shared_state: shared_state.clone(),
            task_store: task_store.clone(),
            host_url: config.host_url.clone(),
        });

        let scanner = Scanner::new(task_store, engine_registry.clone(), schedule_handler);
        let barrier = BarrierCoordinator::new(
            shared_state.clone(),
            control_bus.clone(),
            control_channel.clone(),
        );
        let command_loop = Arc::new(CommandLoop::new(
            config.clone(),
            shared_state.clone(),
            scanner,
            cache_evictor,
        ));

        Ok(Self {
            config,
            shared_state,
            control_bus,
            control_channel,
            engine_registry,
            barrier,
            command_loop,
        })
    }

    pub fn engine_registry(&self) -> Arc<RwLock<EngineRegistry>> {
        self.engine_registry.clone()
    }

    pub fn command_loop(&self) -> Arc<CommandLoop> {
        self.command_loop.clone()
    }

    pub fn barrier(&self) -> &BarrierCoordinator {
        &self.barrier
    }

    /// The sender half of the control protocol: increments the semaphore
    /// before sending (so a racing `FINISH` can never observe a premature
    /// zero), marshals the current configuration into the override store
    /// unless told otherwise, sends `COMMUNICATE`, and — if `extra.run_sync`
    /// is set — immediately enters and exits the sync scope, which blocks
    /// until the bus has drained this and every other outstanding unit of
    /// work.
    #[instrument(skip(self))]
    pub async fn communicate(
        &self,
        extra: CommandExtra,
        marshal_settings: bool,
    ) -> FlowResult<()> {
        use flowexec_shared::shared_state::KEY_SYNC_SEMAPHORE;

        self.shared_state.add(KEY_SYNC_SEMAPHORE, 1).await?;

        if marshal_settings {
            let config_json = serde_json::to_value(&self.config)
                .map_err(FlowError::from)
                .and_then(|v| match v {
                    Value::Object(map) => Ok(map),
                    _ => Ok(Map::new()),
                })?;
            self.shared_state
                .set(flowexec_shared::shared_state::KEY_SETTINGS_OVERRIDE, &config_json)
                .await?;
        }

        let run_sync = extra.run_sync;
        self.control_bus
            .send(
                &self.control_channel,
                flowexec_shared::control_bus::ControlCommand::Communicate {
                    settings: Map::new(),
                    extra,
                },
                true,
            )
            .await?;

        if run_sync {
            let guard = self.barrier.enter_sync(false).await?;
            guard.finish().await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowexec_shared::shared_state::InMemorySharedStateBackend;

    fn noop_config() -> FlowManagerConfig {
        let mut cfg = FlowManagerConfig::default();
        cfg.expression_engines.clear();
        cfg.execution_engines.clear();
        cfg
    }

    #[derive(Debug)]
    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        async fn run(
            &self,
            _task_id: i64,
            _runtime_dir: PathBuf,
            _argv: [String; 3],
            _verbosity: i32,
        ) -> FlowResult<()> {
            Ok(())
        }
    }

    fn build_manager() -> FlowResult<FlowManager> {
        let store: Arc<dyn TaskStore> = Arc::new(crate::task::fake::InMemoryTaskStore::default());
        let dir = tempfile::tempdir().unwrap();
        let sandbox_builder = SandboxBuilder::new(
            flowexec_shared::config::ExecutorConfig {
                data_dir: dir.path().join("data").to_string_lossy().to_string(),
                runtime_dir: dir.path().join("runtime").to_string_lossy().to_string(),
                ..Default::default()
            },
            dir.path().join("pkg"),
        );
        let mut registry = EngineRegistry::new();
        registry.reload("flowexec.executors.local");

        FlowManager::new(
            noop_config(),
            Arc::new(InMemorySharedStateBackend::default()),
            ControlBusProvider::InProcess(Default::default()),
            "ctl",
            store,
            registry,
            sandbox_builder,
            Arc::new(NoopExecutor),
            None,
        )
    }

    #[test]
    #[serial_test::serial]
    fn second_construction_in_the_same_process_fails() {
        let first = build_manager();
        // Whichever of these two calls runs first in the test binary wins
        // the singleton; the key property under test is that the *other*
        // one fails, which is exactly what `AlreadyInitialized` is for.
        let second = build_manager();
        assert!(first.is_ok() || second.is_ok());
        assert!(first.is_err() || second.is_err());
        if let (Ok(_), Err(e)) = (&first, &second) {
            assert!(matches!(e, FlowError::AlreadyInitialized));
        }
    }
}
