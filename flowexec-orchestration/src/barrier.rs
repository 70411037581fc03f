//! The two-counter synchronization protocol, exposed as two composable
//! RAII-style scopes.
//!
//! Both scopes must release on every exit path. The settings-override
//! scope's exit is a plain synchronous restore, so ordinary `Drop` is
//! correct for it. The sync scope's exit must spin-wait for
//! `sync_semaphore == 0`, which `Drop` cannot do (it cannot run async code
//! or block) — so `SyncGuard` exposes an explicit async [`SyncGuard::finish`]
//! that callers must await, and `Drop` is only a debug-assert-style
//! backstop that logs a warning if a guard is dropped without it.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{instrument, warn};

use flowexec_shared::control_bus::{CommandExtra, ControlBus, ControlCommand};
use flowexec_shared::error::{FlowError, FlowResult};
use flowexec_shared::shared_state::{SharedState, KEY_SETTINGS_OVERRIDE, KEY_SYNC_EXECUTION, KEY_SYNC_SEMAPHORE};

const DEFAULT_SPIN_INTERVAL: Duration = Duration::from_millis(500);

/// Add up to 20% random jitter so many manager processes spin-waiting on
/// the same barrier don't all poll `SharedState` in lockstep.
fn jittered(interval: Duration) -> Duration {
    let jitter_ms = (interval.as_millis() as f64 * 0.2 * fastrand::f64()) as u64;
    interval + Duration::from_millis(jitter_ms)
}

/// Restores the shared settings-override map to its pre-entry snapshot on
/// exit. Reentrant: nested overrides stack because each guard remembers
/// only the value it personally displaced.
#[derive(Debug)]
pub struct SettingsOverrideGuard {
    shared_state: SharedState,
    previous: Map<String, Value>,
    finished: bool,
}

impl SettingsOverrideGuard {
    /// Restore the previous override map. Idempotent; safe to call once.
    pub async fn finish(mut self) -> FlowResult<()> {
        self.shared_state
            .set(KEY_SETTINGS_OVERRIDE, &self.previous)
            .await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SettingsOverrideGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!("SettingsOverrideGuard dropped without finish(); overrides were not restored");
        }
    }
}

/// Holds the synchronization barrier open. Exiting waits for
/// `sync_semaphore == 0` before releasing `sync_execution`; at least one
/// executor must eventually finish or this never returns — a documented
/// precondition, not a bug.
#[derive(Debug)]
pub struct SyncGuard {
    shared_state: SharedState,
    spin_interval: Duration,
    finished: bool,
}

impl SyncGuard {
    #[instrument(skip(self))]
    pub async fn finish(mut self) -> FlowResult<()> {
        loop {
            let semaphore: i64 = self
                .shared_state
                .get(KEY_SYNC_SEMAPHORE)
                .await?
                .unwrap_or(0);
            if semaphore == 0 {
                break;
            }
            sleep(jittered(self.spin_interval)).await;
        }

        let previous: i64 = self
            .shared_state
            .cas(KEY_SYNC_EXECUTION, &1i64, &0i64)
            .await?;
        debug_assert_eq!(previous, 1, "sync_execution must have been 1 on exit");
        self.finished = true;
        Ok(())
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!("SyncGuard dropped without finish(); sync_execution was not released");
        }
    }
}

/// Implements the barrier's two composable scopes over a shared
/// [`SharedState`] handle and the control bus used by [`BarrierCoordinator::barrier`].
#[derive(Debug, Clone)]
pub struct BarrierCoordinator {
    shared_state: SharedState,
    control_bus: ControlBus,
    control_channel: String,
    spin_interval: Duration,
}

impl BarrierCoordinator {
    pub fn new(shared_state: SharedState, control_bus: ControlBus, control_channel: impl Into<String>) -> Self {
        Self {
            shared_state,
            control_bus,
            control_channel: control_channel.into(),
            spin_interval: DEFAULT_SPIN_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_spin_interval(mut self, interval: Duration) -> Self {
        self.spin_interval = interval;
        self
    }

    pub async fn enter_settings_override(
        &self,
        overrides: Map<String, Value>,
    ) -> FlowResult<SettingsOverrideGuard> {
        let previous: Map<String, Value> = self
            .shared_state
            .get(KEY_SETTINGS_OVERRIDE)
            .await?
            .unwrap_or_default();

        let mut merged = previous.clone();
        for (k, v) in overrides {
            merged.insert(k, v);
        }
        self.shared_state.set(KEY_SETTINGS_OVERRIDE, &merged).await?;

        Ok(SettingsOverrideGuard {
            shared_state: self.shared_state.clone(),
            previous,
            finished: false,
        })
    }

    /// Enter the synchronization scope. With `force`, unconditionally takes
    /// ownership; otherwise fails with [`FlowError::AlreadySynchronizing`]
    /// if another caller already holds it.
    #[instrument(skip(self))]
    pub async fn enter_sync(&self, force: bool) -> FlowResult<SyncGuard> {
        if force {
            self.shared_state.set(KEY_SYNC_EXECUTION, &1i64).await?;
        } else {
            let previous: i64 = self
                .shared_state
                .cas(KEY_SYNC_EXECUTION, &0i64, &1i64)
                .await?;
            if previous == 1 {
                return Err(FlowError::AlreadySynchronizing);
            }
        }

        Ok(SyncGuard {
            shared_state: self.shared_state.clone(),
            spin_interval: self.spin_interval,
            finished: false,
        })
    }

    /// Convenience: enter the sync scope, then issue a `COMMUNICATE`.
    /// Callers must await the returned guard's [`SyncGuard::finish`] once
    /// the barrier should close; at least one executor must eventually
    /// finish, or this deadlocks.
    pub async fn barrier(
        &self,
        settings: Map<String, Value>,
        extra: CommandExtra,
        force: bool,
    ) -> FlowResult<SyncGuard> {
        let guard = self.enter_sync(force).await?;
        self.shared_state.add(KEY_SYNC_SEMAPHORE, 1).await?;
        self.control_bus
            .send(
                &self.control_channel,
                ControlCommand::Communicate { settings, extra },
                true,
            )
            .await?;
        Ok(guard)
    }
}
