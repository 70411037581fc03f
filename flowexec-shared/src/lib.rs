//! Shared configuration, error taxonomy, and cross-process coordination
//! primitives used by `flowexec-orchestration` and `flowexec-cli`.

pub mod config;
pub mod control_bus;
pub mod error;
pub mod json_coerce;
pub mod logging;
pub mod shared_state;

pub use control_bus::{CommandExtra, ControlBus, ControlBusProvider, ControlCommand};
pub use error::{FlowError, FlowResult};
pub use shared_state::{SharedState, SharedStateBackend};
