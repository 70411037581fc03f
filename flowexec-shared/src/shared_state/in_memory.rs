use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::FlowResult;

use super::SharedStateBackend;

/// In-process, single-`Mutex` backend used by unit and scenario tests in
/// place of Redis. Linearizable by construction (one lock for all keys).
#[derive(Debug, Default)]
pub struct InMemorySharedStateBackend {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl SharedStateBackend for InMemorySharedStateBackend {
    async fn get_raw(&self, key: &str) -> FlowResult<Option<Vec<u8>>> {
        Ok(self.store.lock().unwrap().get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>) -> FlowResult<()> {
        self.store.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn cas_raw(&self, key: &str, expected: Vec<u8>, new: Vec<u8>) -> FlowResult<Vec<u8>> {
        let mut guard = self.store.lock().unwrap();
        let current = guard.get(key).cloned().unwrap_or_default();
        if current == expected {
            guard.insert(key.to_string(), new);
        }
        Ok(current)
    }

    async fn add(&self, key: &str, delta: i64) -> FlowResult<i64> {
        let mut guard = self.store.lock().unwrap();
        let current = guard
            .get(key)
            .map(|bytes| serde_json::from_slice::<i64>(bytes).unwrap_or(0))
            .unwrap_or(0);
        let updated = current + delta;
        guard.insert(key.to_string(), serde_json::to_vec(&updated).unwrap());
        Ok(updated)
    }

    async fn clear(&self) -> FlowResult<()> {
        self.store.lock().unwrap().clear();
        Ok(())
    }
}
