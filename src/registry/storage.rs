//! Pluggable persistence for the registry.
//!
//! The production deployment backs this with a replicated log; the
//! in-memory implementation here serves tests and single-node use. The
//! registrar treats any storage failure as fatal to leadership.

use super::state::Registry;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Errors from the backing store.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageError(pub String);

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error: {}", self.0)
    }
}

impl std::error::Error for StorageError {}

/// Durable storage for registry snapshots.
///
/// `persist` must be atomic: after a crash, `recover` returns either
/// the previous snapshot or the new one, never a torn mix.
pub trait RegistryStorage: Send {
    /// Load the last persisted registry, or `None` on first boot.
    fn recover(&mut self) -> Result<Option<Registry>, StorageError>;

    /// Persist a full snapshot of the registry.
    fn persist(&mut self, registry: &Registry) -> Result<(), StorageError>;
}

/// In-memory storage holding a serialized snapshot.
///
/// Serializing through JSON keeps the failure surface of a real store:
/// a registry that cannot round-trip is caught in tests, not in
/// production.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    snapshot: Arc<Mutex<Option<Vec<u8>>>>,
    /// When set, every persist fails. Used by tests to drive the
    /// abdication path.
    fail_persists: Arc<Mutex<bool>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a registry, as if a previous master had persisted it.
    pub fn with_registry(registry: &Registry) -> Self {
        let storage = Self::new();
        let bytes = serde_json::to_vec(registry).expect("registry snapshots always serialize");
        *storage.snapshot.lock().expect("storage lock poisoned") = Some(bytes);
        storage
    }

    pub fn set_fail_persists(&self, fail: bool) {
        *self.fail_persists.lock().expect("storage lock poisoned") = fail;
    }
}

impl RegistryStorage for MemoryStorage {
    fn recover(&mut self) -> Result<Option<Registry>, StorageError> {
        let snapshot = self.snapshot.lock().expect("storage lock poisoned");
        match snapshot.as_ref() {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| StorageError(format!("corrupt snapshot: {}", e))),
        }
    }

    fn persist(&mut self, registry: &Registry) -> Result<(), StorageError> {
        if *self.fail_persists.lock().expect("storage lock poisoned") {
            return Err(StorageError("injected persist failure".to_string()));
        }

        let bytes = serde_json::to_vec(registry)
            .map_err(|e| StorageError(format!("serialize failed: {}", e)))?;
        *self.snapshot.lock().expect("storage lock poisoned") = Some(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentId;
    use crate::messages::AgentInfo;
    use crate::resources::Resources;

    #[test]
    fn test_recover_empty() {
        let mut storage = MemoryStorage::new();
        assert_eq!(storage.recover().unwrap(), None);
    }

    #[test]
    fn test_persist_recover_roundtrip() {
        let mut registry = Registry::new();
        let mut info = AgentInfo::new("host1", Resources::cpus_mem(4.0, 8192.0));
        info.id = Some(AgentId::new("a1"));
        registry.admitted.push(info);

        let mut storage = MemoryStorage::new();
        storage.persist(&registry).unwrap();
        assert_eq!(storage.recover().unwrap(), Some(registry));
    }

    #[test]
    fn test_injected_failure() {
        let mut storage = MemoryStorage::new();
        storage.set_fail_persists(true);
        assert!(storage.persist(&Registry::new()).is_err());
    }
}
