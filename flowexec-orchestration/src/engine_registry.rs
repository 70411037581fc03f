//! Discovery and loading of the executor, expression engines, and
//! execution engines named by configuration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use flowexec_shared::error::{FlowError, FlowResult};

use crate::task::Task;

/// Produces the JSON-able expressions evaluated while building the settings
/// bundle (e.g. Jinja2-style templating over task inputs in the reference
/// codebase). Opaque beyond this contract — the core never inspects the
/// expression language itself.
#[async_trait]
pub trait ExpressionEngine: Send + Sync + std::fmt::Debug {
    async fn evaluate(&self, expression: &str, task: &Task) -> FlowResult<serde_json::Value>;
}

/// Turns a task's `run` section into program text the executor will invoke.
/// Evaluation runs inside the scanner's transaction and may insert spawned
/// tasks; engines that do so must use the same [`crate::task::TaskStore`]
/// handle the scanner passed them rather than opening a new connection.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + std::fmt::Debug {
    async fn evaluate(&self, task: &Task) -> FlowResult<String>;
}

/// Handle identifying the currently active executor package by its dotted
/// module name; `SandboxBuilder` uses this to build the launch argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorHandle {
    pub dotted_name: String,
}

#[derive(Debug, Default)]
pub struct EngineRegistry {
    executor: Option<ExecutorHandle>,
    expression_engines: HashMap<String, Arc<dyn ExpressionEngine>>,
    execution_engines: HashMap<String, Arc<dyn ExecutionEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_expression_engine(
        &mut self,
        name: impl Into<String>,
        engine: Arc<dyn ExpressionEngine>,
    ) {
        self.expression_engines.insert(name.into(), engine);
    }

    pub fn register_execution_engine(
        &mut self,
        name: impl Into<String>,
        engine: Arc<dyn ExecutionEngine>,
    ) {
        self.execution_engines.insert(name.into(), engine);
    }

    /// Rebind the active executor. Invoked at the start of each scan
    /// because a `COMMUNICATE` command may carry a settings override that
    /// names a different executor package.
    pub fn reload(&mut self, executor_name: impl Into<String>) {
        self.executor = Some(ExecutorHandle {
            dotted_name: executor_name.into(),
        });
    }

    pub fn executor(&self) -> FlowResult<&ExecutorHandle> {
        self.executor
            .as_ref()
            .ok_or_else(|| FlowError::Config("no executor loaded; call reload() first".into()))
    }

    pub fn expression_engine(&self, name: &str) -> FlowResult<Arc<dyn ExpressionEngine>> {
        self.expression_engines
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::unsupported_expression_engine(name))
    }

    pub fn execution_engine(&self, name: &str) -> FlowResult<Arc<dyn ExecutionEngine>> {
        self.execution_engines
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::unsupported_execution_engine(name))
    }
}
