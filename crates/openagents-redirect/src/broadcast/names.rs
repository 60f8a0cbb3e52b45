use std::sync::{Arc, Mutex};

use super::store::{KeyValueStore, StoreError};

const KEY_PREFIX: &str = "openagents.redirect.channels";

/// Durable list of live channel names, partitioned by origin, so that a
/// callback context which shares no memory with the opener can find it.
pub struct ChannelNameRegistry {
    store: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
}

impl ChannelNameRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn register(&self, partition: &str, name: &str) -> Result<(), StoreError> {
        self.update(partition, |names| {
            if names.iter().any(|existing| existing == name) {
                return false;
            }
            names.push(name.to_string());
            true
        })
    }

    pub fn unregister(&self, partition: &str, name: &str) -> Result<(), StoreError> {
        self.update(partition, |names| {
            let before = names.len();
            names.retain(|existing| existing != name);
            names.len() != before
        })
    }

    pub fn active(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.load(partition)
    }

    fn update(
        &self,
        partition: &str,
        apply: impl FnOnce(&mut Vec<String>) -> bool,
    ) -> Result<(), StoreError> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names = self.load(partition)?;
        if !apply(&mut names) {
            return Ok(());
        }
        let key = partition_key(partition);
        if names.is_empty() {
            return self.store.remove(&key);
        }
        let encoded = serde_json::to_string(&names).map_err(|error| StoreError::Corrupt {
            path: key.clone().into(),
            message: error.to_string(),
        })?;
        self.store.set(&key, &encoded)
    }

    fn load(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        let key = partition_key(partition);
        match self.store.get(&key)? {
            None => Ok(Vec::new()),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(names) => Ok(names),
                Err(error) => {
                    tracing::warn!(
                        partition,
                        %error,
                        "Discarding unreadable channel name registry"
                    );
                    Ok(Vec::new())
                }
            },
        }
    }
}

fn partition_key(partition: &str) -> String {
    format!("{KEY_PREFIX}.{partition}")
}
