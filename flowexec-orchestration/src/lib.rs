//! Dependency-aware task scheduling, sandbox preparation, the execution
//! barrier, and the control-channel command loop for the flowexec job
//! execution manager.

pub mod barrier;
pub mod command_loop;
pub mod dependency;
pub mod engine_registry;
pub mod executor;
pub mod manager;
#[cfg(feature = "postgres")]
pub mod pg_task_store;
pub mod sandbox;
pub mod scanner;
pub mod task;

pub use barrier::BarrierCoordinator;
pub use command_loop::CommandLoop;
pub use dependency::{DependencyResolver, DependencyStatus};
pub use engine_registry::EngineRegistry;
pub use executor::{Executor, LocalExecutor};
pub use manager::FlowManager;
#[cfg(feature = "postgres")]
pub use pg_task_store::PgTaskStore;
pub use sandbox::{SandboxBuilder, SettingsExtension};
pub use scanner::Scanner;
pub use task::{Task, TaskStatus, TaskStore};
