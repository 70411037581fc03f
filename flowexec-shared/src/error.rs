//! Unified error taxonomy for the flowexec core.
//!
//! Every fallible operation in `flowexec-shared` and `flowexec-orchestration`
//! returns a [`FlowError`]. Lower layers use `?` freely via the `#[from]`
//! conversions; component-level code maps the generic `Io`/`Os` variants down
//! to the task-visible taxonomy the scanner and sandbox builder need
//! (`PermissionDenied`, `OsError`) where the caller must distinguish them.

use thiserror::Error;

pub type FlowResult<T> = Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("no engine registered for {kind} '{name}'")]
    UnsupportedEngine { kind: &'static str, name: String },

    #[error("engine rejected task script: {0}")]
    EvaluationError(String),

    #[error("permission denied building sandbox: {0}")]
    PermissionDenied(String),

    #[error("OS error building sandbox: {0}")]
    OsError(String),

    #[error("database integrity violation: {0}")]
    IntegrityError(String),

    #[error("only one caller at a time may enter a synchronization transaction")]
    AlreadySynchronizing,

    #[error("unknown control-bus command: {0}")]
    UnknownCommand(String),

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shared-state backend error: {0}")]
    SharedState(String),

    #[error("control-bus transport error: {0}")]
    ControlBus(String),

    #[error("manager already initialized in this process")]
    AlreadyInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "redis-backend")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "pgmq-backend")]
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl FlowError {
    /// Classify an I/O error the way the sandbox builder's contract requires:
    /// `ErrorKind::PermissionDenied` becomes the task-visible `PermissionDenied`
    /// variant, everything else becomes `OsError`.
    pub fn from_sandbox_io(err: std::io::Error, context: impl std::fmt::Display) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            FlowError::PermissionDenied(format!("{context}: {err}"))
        } else {
            FlowError::OsError(format!("{context}: {err}"))
        }
    }

    pub fn unsupported_expression_engine(name: impl Into<String>) -> Self {
        FlowError::UnsupportedEngine {
            kind: "expression",
            name: name.into(),
        }
    }

    pub fn unsupported_execution_engine(name: impl Into<String>) -> Self {
        FlowError::UnsupportedEngine {
            kind: "execution",
            name: name.into(),
        }
    }
}
