use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::FlowResult;

use super::SharedStateBackend;

/// Redis-backed implementation used across manager processes in production.
/// `add` maps directly to `INCRBY`; `cas` uses a `WATCH`/`MULTI` transaction
/// since Redis has no single-key compare-and-set command for arbitrary
/// byte strings.
#[derive(Clone)]
pub struct RedisSharedStateBackend {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl std::fmt::Debug for RedisSharedStateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedStateBackend")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisSharedStateBackend {
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> FlowResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl SharedStateBackend for RedisSharedStateBackend {
    async fn get_raw(&self, key: &str) -> FlowResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>) -> FlowResult<()> {
        let mut conn = self.conn.clone();
        conn.set(self.full_key(key), value).await?;
        Ok(())
    }

    async fn cas_raw(&self, key: &str, expected: Vec<u8>, new: Vec<u8>) -> FlowResult<Vec<u8>> {
        let full_key = self.full_key(key);
        let mut conn = self.conn.clone();
        loop {
            redis::cmd("WATCH").arg(&full_key).query_async(&mut conn).await?;
            let current: Option<Vec<u8>> = conn.get(&full_key).await?;
            let current = current.unwrap_or_default();
            if current != expected {
                redis::cmd("UNWATCH").query_async(&mut conn).await?;
                return Ok(current);
            }
            let mut pipe = redis::pipe();
            pipe.atomic().set(&full_key, &new);
            let result: Option<()> = pipe.query_async(&mut conn).await?;
            if result.is_some() {
                return Ok(current);
            }
            // Another writer interleaved between WATCH and EXEC; retry.
        }
    }

    async fn add(&self, key: &str, delta: i64) -> FlowResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(self.full_key(key), delta).await?;
        Ok(value)
    }

    async fn clear(&self) -> FlowResult<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.key_prefix);
        let keys: Vec<String> = conn.keys(pattern).await?;
        if !keys.is_empty() {
            conn.del(keys).await?;
        }
        Ok(())
    }
}
