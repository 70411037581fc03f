//! Cross-process counters, flags, and an override map, keyed by a common
//! prefix and reached through a pluggable [`SharedStateBackend`].
//!
//! The production backend is Redis (`INCRBY` for [`SharedState::add`], a
//! `WATCH`/`MULTI` transaction for [`SharedState::cas`]); an in-process
//! fake backs unit and scenario tests. Counters are always signed 64-bit;
//! everything else is opaque, serde-serializable bytes.

mod in_memory;
#[cfg(feature = "redis-backend")]
mod redis_backend;

pub use in_memory::InMemorySharedStateBackend;
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisSharedStateBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::FlowResult;

pub const KEY_SYNC_EXECUTION: &str = "sync_execution";
pub const KEY_SYNC_SEMAPHORE: &str = "sync_semaphore";
pub const KEY_EXECUTOR_COUNT: &str = "executor_count";
pub const KEY_SETTINGS_OVERRIDE: &str = "settings_override";

/// Linearizable-per-key key/value store with atomic compare-and-set and
/// increment primitives. Implementors need not provide cross-key
/// transactions; every operation the manager relies on touches one key.
#[async_trait]
pub trait SharedStateBackend: Send + Sync + std::fmt::Debug {
    async fn get_raw(&self, key: &str) -> FlowResult<Option<Vec<u8>>>;
    async fn set_raw(&self, key: &str, value: Vec<u8>) -> FlowResult<()>;
    /// Atomically replace `key`'s value with `new` if and only if it
    /// currently holds `expected`; returns the value observed before the
    /// (possibly no-op) write.
    async fn cas_raw(&self, key: &str, expected: Vec<u8>, new: Vec<u8>) -> FlowResult<Vec<u8>>;
    /// Atomically add `delta` to the signed 64-bit integer at `key`
    /// (treated as 0 if absent) and return the post-update value.
    async fn add(&self, key: &str, delta: i64) -> FlowResult<i64>;
    /// Remove every key under this backend's prefix.
    async fn clear(&self) -> FlowResult<()>;
}

/// A namespaced handle over a [`SharedStateBackend`], exposing the
/// serde-typed operations the manager's components call.
#[derive(Clone, Debug)]
pub struct SharedState {
    prefix: String,
    backend: Arc<dyn SharedStateBackend>,
}

impl SharedState {
    pub fn new(prefix: impl Into<String>, backend: Arc<dyn SharedStateBackend>) -> Self {
        Self {
            prefix: prefix.into(),
            backend,
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> FlowResult<Option<T>> {
        match self.backend.get_raw(&self.namespaced(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> FlowResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.set_raw(&self.namespaced(key), bytes).await
    }

    pub async fn cas<T: Serialize + DeserializeOwned + Sync>(
        &self,
        key: &str,
        expected: &T,
        new: &T,
    ) -> FlowResult<T> {
        let expected_bytes = serde_json::to_vec(expected)?;
        let new_bytes = serde_json::to_vec(new)?;
        let prev = self
            .backend
            .cas_raw(&self.namespaced(key), expected_bytes, new_bytes)
            .await?;
        Ok(serde_json::from_slice(&prev)?)
    }

    pub async fn add(&self, key: &str, delta: i64) -> FlowResult<i64> {
        self.backend.add(&self.namespaced(key), delta).await
    }

    /// Zero `sync_semaphore` and `executor_count`, clear `sync_execution`,
    /// and drop the settings-override map. Does not synchronize with
    /// in-flight scans; callers must ensure quiescence first.
    pub async fn reset(&self) -> FlowResult<()> {
        self.backend.clear().await?;
        self.set(KEY_SYNC_EXECUTION, &0i64).await?;
        self.set(KEY_SYNC_SEMAPHORE, &0i64).await?;
        self.set(KEY_EXECUTOR_COUNT, &0i64).await?;
        self.set::<serde_json::Map<String, serde_json::Value>>(
            KEY_SETTINGS_OVERRIDE,
            &serde_json::Map::new(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SharedState {
        SharedState::new("test", Arc::new(InMemorySharedStateBackend::default()))
    }

    #[tokio::test]
    async fn get_on_missing_key_is_none() {
        let s = state();
        let v: Option<i64> = s.get("nope").await.unwrap();
        assert_eq!(v, None);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let s = state();
        s.set("k", &42i64).await.unwrap();
        let v: Option<i64> = s.get("k").await.unwrap();
        assert_eq!(v, Some(42));
    }

    #[tokio::test]
    async fn add_accumulates_and_returns_post_value() {
        let s = state();
        assert_eq!(s.add(KEY_SYNC_SEMAPHORE, 1).await.unwrap(), 1);
        assert_eq!(s.add(KEY_SYNC_SEMAPHORE, 1).await.unwrap(), 2);
        assert_eq!(s.add(KEY_SYNC_SEMAPHORE, -2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cas_succeeds_when_expected_matches() {
        let s = state();
        s.set(KEY_SYNC_EXECUTION, &0i64).await.unwrap();
        let prev: i64 = s.cas(KEY_SYNC_EXECUTION, &0i64, &1i64).await.unwrap();
        assert_eq!(prev, 0);
        let now: Option<i64> = s.get(KEY_SYNC_EXECUTION).await.unwrap();
        assert_eq!(now, Some(1));
    }

    #[tokio::test]
    async fn cas_is_noop_when_expected_does_not_match() {
        let s = state();
        s.set(KEY_SYNC_EXECUTION, &1i64).await.unwrap();
        let prev: i64 = s.cas(KEY_SYNC_EXECUTION, &0i64, &1i64).await.unwrap();
        assert_eq!(prev, 1);
        let now: Option<i64> = s.get(KEY_SYNC_EXECUTION).await.unwrap();
        assert_eq!(now, Some(1), "value must be unchanged on a failed CAS");
    }

    #[tokio::test]
    async fn reset_zeroes_counters_and_clears_overrides() {
        let s = state();
        s.add(KEY_SYNC_SEMAPHORE, 5).await.unwrap();
        s.set(KEY_SYNC_EXECUTION, &1i64).await.unwrap();
        s.reset().await.unwrap();
        let sem: Option<i64> = s.get(KEY_SYNC_SEMAPHORE).await.unwrap();
        let flag: Option<i64> = s.get(KEY_SYNC_EXECUTION).await.unwrap();
        assert_eq!(sem, Some(0));
        assert_eq!(flag, Some(0));
    }

    #[tokio::test]
    async fn two_namespaces_do_not_collide() {
        let backend: Arc<dyn SharedStateBackend> = Arc::new(InMemorySharedStateBackend::default());
        let a = SharedState::new("a", backend.clone());
        let b = SharedState::new("b", backend);
        a.set("k", &1i64).await.unwrap();
        b.set("k", &2i64).await.unwrap();
        let av: Option<i64> = a.get("k").await.unwrap();
        let bv: Option<i64> = b.get("k").await.unwrap();
        assert_eq!(av, Some(1));
        assert_eq!(bv, Some(2));
    }
}
