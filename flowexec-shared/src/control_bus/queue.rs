use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::error::FlowResult;

use super::ControlCommand;

/// In-process control-bus transport: a `dashmap`-backed map of named
/// `VecDeque`s, each behind its own `Mutex`. Used for tests and
/// single-process deployments where no Postgres-backed `pgmq` queue is
/// available.
///
/// Held behind an `Arc` so that cloning a provider (as every consumer of
/// `ControlBus` does — the command loop, the barrier, each spawned
/// executor) shares the same underlying channels rather than forking off an
/// independent, immediately-stale copy.
#[derive(Debug, Default, Clone)]
pub struct InProcessQueueProvider {
    channels: Arc<DashMap<String, Mutex<VecDeque<ControlCommand>>>>,
}

impl InProcessQueueProvider {
    pub async fn send(&self, channel: &str, command: &ControlCommand) -> FlowResult<()> {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .lock()
            .unwrap()
            .push_back(command.clone());
        Ok(())
    }

    pub async fn recv(&self, channel: &str) -> FlowResult<Option<ControlCommand>> {
        Ok(self
            .channels
            .get(channel)
            .and_then(|q| q.lock().unwrap().pop_front()))
    }

    pub async fn drain(&self, channel: &str) -> FlowResult<()> {
        if let Some(q) = self.channels.get(channel) {
            q.lock().unwrap().clear();
        }
        Ok(())
    }
}
