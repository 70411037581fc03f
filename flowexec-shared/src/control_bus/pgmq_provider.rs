use std::sync::Arc;

use dashmap::DashSet;

use crate::error::{FlowError, FlowResult};

use super::ControlCommand;

/// Postgres-backed control-bus transport for multi-process deployments,
/// built on the `pgmq` crate. Each control-bus channel is a distinct pgmq
/// queue, created lazily on first use.
#[derive(Clone)]
pub struct PgmqProvider {
    queue: Arc<pgmq::PGMQueue>,
    known_queues: Arc<DashSet<String>>,
    /// Visibility timeout applied to `read`; control messages are consumed
    /// and deleted immediately, so this only bounds how long a message is
    /// hidden if the process crashes mid-handling.
    visibility_timeout_secs: i32,
}

impl std::fmt::Debug for PgmqProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgmqProvider").finish_non_exhaustive()
    }
}

impl PgmqProvider {
    pub async fn connect(database_url: &str) -> FlowResult<Self> {
        let queue = pgmq::PGMQueue::new(database_url.to_string())
            .await
            .map_err(|e| FlowError::ControlBus(e.to_string()))?;
        Ok(Self {
            queue: Arc::new(queue),
            known_queues: Arc::new(DashSet::new()),
            visibility_timeout_secs: 30,
        })
    }

    async fn ensure_queue(&self, channel: &str) -> FlowResult<()> {
        if self.known_queues.contains(channel) {
            return Ok(());
        }
        self.queue
            .create(channel)
            .await
            .map_err(|e| FlowError::ControlBus(e.to_string()))?;
        self.known_queues.insert(channel.to_string());
        Ok(())
    }

    pub async fn send(&self, channel: &str, command: &ControlCommand) -> FlowResult<()> {
        self.ensure_queue(channel).await?;
        self.queue
            .send(channel, command)
            .await
            .map_err(|e| FlowError::ControlBus(e.to_string()))?;
        Ok(())
    }

    pub async fn recv(&self, channel: &str) -> FlowResult<Option<ControlCommand>> {
        self.ensure_queue(channel).await?;
        let message = self
            .queue
            .read::<ControlCommand>(channel, Some(self.visibility_timeout_secs))
            .await
            .map_err(|e| FlowError::ControlBus(e.to_string()))?;
        match message {
            Some(msg) => {
                self.queue
                    .delete(channel, msg.msg_id)
                    .await
                    .map_err(|e| FlowError::ControlBus(e.to_string()))?;
                Ok(Some(msg.message))
            }
            None => Ok(None),
        }
    }

    pub async fn drain(&self, channel: &str) -> FlowResult<()> {
        self.ensure_queue(channel).await?;
        self.queue
            .purge(channel)
            .await
            .map_err(|e| FlowError::ControlBus(e.to_string()))?;
        Ok(())
    }
}
