use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::identity::OperationId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("operation {0} is already registered")]
    DuplicateId(OperationId),
}

#[derive(Debug)]
struct RegistryEntry<T> {
    seq: u64,
    attribute: Option<String>,
    value: T,
}

#[derive(Debug)]
struct RegistryInner<T> {
    entries: HashMap<OperationId, RegistryEntry<T>>,
    next_seq: u64,
}

/// Table of pending operations, keyed by id and optionally by a secondary
/// attribute (a URL scheme for host-delivered callbacks).
///
/// When several pending operations share an attribute, the one registered first
/// is matched first.
#[derive(Debug)]
pub struct OperationRegistry<T> {
    inner: Mutex<RegistryInner<T>>,
}

impl<T> Default for OperationRegistry<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }
}

impl<T: Clone> OperationRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(
        &self,
        id: OperationId,
        attribute: Option<&str>,
        value: T,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            id,
            RegistryEntry {
                seq,
                attribute: attribute.map(normalize_attribute),
                value,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, id: &OperationId) -> Option<T> {
        self.lock().entries.get(id).map(|entry| entry.value.clone())
    }

    #[must_use]
    pub fn lookup_by_attribute(&self, attribute: &str) -> Option<T> {
        let wanted = normalize_attribute(attribute);
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.attribute.as_deref() == Some(wanted.as_str()))
            .min_by_key(|entry| entry.seq)
            .map(|entry| entry.value.clone())
    }

    /// Every pending value carrying `attribute`, oldest registration first.
    #[must_use]
    pub fn matching_attribute(&self, attribute: &str) -> Vec<(OperationId, T)> {
        let wanted = normalize_attribute(attribute);
        let inner = self.lock();
        let mut matches = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.attribute.as_deref() == Some(wanted.as_str()))
            .map(|(id, entry)| (entry.seq, *id, entry.value.clone()))
            .collect::<Vec<_>>();
        drop(inner);
        matches.sort_by_key(|(seq, _, _)| *seq);
        matches
            .into_iter()
            .map(|(_, id, value)| (id, value))
            .collect()
    }

    pub fn remove(&self, id: &OperationId) -> Option<T> {
        self.lock().entries.remove(id).map(|entry| entry.value)
    }

    #[must_use]
    pub fn contains(&self, id: &OperationId) -> bool {
        self.lock().entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn pending_ids(&self) -> Vec<OperationId> {
        let inner = self.lock();
        let mut ids = inner
            .entries
            .iter()
            .map(|(id, entry)| (entry.seq, *id))
            .collect::<Vec<_>>();
        drop(inner);
        ids.sort_by_key(|(seq, _)| *seq);
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

fn normalize_attribute(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
