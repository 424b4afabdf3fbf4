//! The registrar: serialized, durable application of registry
//! operations.
//!
//! Callers submit operations through a [`RegistrarHandle`] and receive
//! the commit result once the mutation has been applied and persisted.
//! Operations are applied strictly in submission order, which is what
//! makes registry commits linearize from the master's point of view.

use super::state::{Registry, RegistryError, RegistryOperation};
use super::storage::RegistryStorage;
use crate::ids::AgentId;
use slog::{error, info, warn, Logger};
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};

type ApplyRequest = (
    RegistryOperation,
    oneshot::Sender<Result<bool, RegistryError>>,
);

/// Handle for submitting operations to a running registrar.
#[derive(Clone)]
pub struct RegistrarHandle {
    tx: mpsc::UnboundedSender<ApplyRequest>,
}

impl RegistrarHandle {
    /// Submit one operation, returning a receiver for the commit
    /// result. Submission itself is synchronous so that commits land in
    /// submission order even when callers await the results out of
    /// band.
    pub fn submit(
        &self,
        operation: RegistryOperation,
    ) -> oneshot::Receiver<Result<bool, RegistryError>> {
        let (tx, rx) = oneshot::channel();
        // A stopped registrar drops `tx`; the receiver then yields an
        // error the caller maps to Unavailable.
        let _ = self.tx.send((operation, tx));
        rx
    }

    /// Apply one operation and wait for the commit result.
    ///
    /// `Ok(true)` means the registry mutated, `Ok(false)` a no-op.
    /// `Err(Unavailable)` means durability is gone; the caller must
    /// abdicate leadership rather than keep mutating in-memory state.
    pub async fn apply(&self, operation: RegistryOperation) -> Result<bool, RegistryError> {
        self.submit(operation)
            .await
            .map_err(|_| RegistryError::Unavailable("registrar stopped".to_string()))?
    }
}

/// The registrar task: owns the registry and its storage.
pub struct Registrar {
    registry: Registry,
    admitted_ids: HashSet<AgentId>,
    storage: Box<dyn RegistryStorage>,
    rx: mpsc::UnboundedReceiver<ApplyRequest>,
    logger: Logger,
}

impl Registrar {
    /// Recover the registry from storage and start the registrar task.
    ///
    /// Returns the recovered registry snapshot (for the master to build
    /// its in-memory view from) and the handle for future mutations.
    pub fn recover(
        mut storage: Box<dyn RegistryStorage>,
        logger: Logger,
    ) -> Result<(Registry, RegistrarHandle), RegistryError> {
        let registry = storage
            .recover()
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?
            .unwrap_or_default();

        info!(logger, "Recovered registry";
            "admitted" => registry.admitted.len(),
            "unreachable" => registry.unreachable.len()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let registrar = Registrar {
            admitted_ids: registry.admitted_ids(),
            registry: registry.clone(),
            storage,
            rx,
            logger,
        };

        tokio::spawn(registrar.run());

        Ok((registry, RegistrarHandle { tx }))
    }

    async fn run(mut self) {
        while let Some((operation, reply)) = self.rx.recv().await {
            let result = self.apply(&operation);
            // A dropped receiver means the caller gave up; the mutation
            // is still committed.
            let _ = reply.send(result);
        }
    }

    fn apply(&mut self, operation: &RegistryOperation) -> Result<bool, RegistryError> {
        // Apply against a scratch copy so a failed persist leaves the
        // in-memory registry matching what storage last saw.
        let mut registry = self.registry.clone();
        let mut admitted_ids = self.admitted_ids.clone();

        if let RegistryOperation::MarkReachable { info } = operation {
            if let Some(id) = &info.id {
                let known = admitted_ids.contains(id)
                    || registry.unreachable.iter().any(|entry| &entry.id == id);
                if !known {
                    warn!(self.logger, "Allowing unknown agent to reregister";
                        "agent_id" => %id);
                }
            }
        }

        let mutated = operation.apply(&mut registry, &mut admitted_ids)?;

        if mutated {
            if let Err(e) = self.storage.persist(&registry) {
                error!(self.logger, "Failed to persist registry";
                    "operation" => operation.kind(),
                    "error" => %e);
                return Err(RegistryError::Unavailable(e.to_string()));
            }
            self.registry = registry;
            self.admitted_ids = admitted_ids;
        }

        Ok(mutated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::AgentInfo;
    use crate::registry::MemoryStorage;
    use crate::resources::Resources;
    use std::time::SystemTime;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn agent(id: &str) -> AgentInfo {
        let mut info = AgentInfo::new(format!("host-{}", id), Resources::cpus_mem(2.0, 4096.0));
        info.id = Some(AgentId::new(id));
        info
    }

    #[tokio::test]
    async fn test_apply_commits_in_order() {
        let (registry, handle) =
            Registrar::recover(Box::new(MemoryStorage::new()), logger()).unwrap();
        assert!(registry.admitted.is_empty());

        assert_eq!(
            handle.apply(RegistryOperation::Admit { info: agent("a1") }).await,
            Ok(true)
        );
        assert_eq!(
            handle.apply(RegistryOperation::Admit { info: agent("a2") }).await,
            Ok(true)
        );
        assert!(matches!(
            handle.apply(RegistryOperation::Admit { info: agent("a1") }).await,
            Err(RegistryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_sees_previous_commits() {
        let storage = MemoryStorage::new();

        {
            let (_, handle) =
                Registrar::recover(Box::new(storage.clone()), logger()).unwrap();
            handle
                .apply(RegistryOperation::Admit { info: agent("a1") })
                .await
                .unwrap();
            handle
                .apply(RegistryOperation::MarkUnreachable {
                    info: agent("a1"),
                    since: SystemTime::now(),
                })
                .await
                .unwrap();
        }

        let (registry, _) = Registrar::recover(Box::new(storage), logger()).unwrap();
        assert!(registry.admitted.is_empty());
        assert_eq!(registry.unreachable.len(), 1);
        assert_eq!(registry.unreachable[0].id, AgentId::new("a1"));
    }

    #[tokio::test]
    async fn test_failed_persist_reports_unavailable_and_rolls_back() {
        let storage = MemoryStorage::new();
        let (_, handle) = Registrar::recover(Box::new(storage.clone()), logger()).unwrap();

        storage.set_fail_persists(true);
        assert!(matches!(
            handle.apply(RegistryOperation::Admit { info: agent("a1") }).await,
            Err(RegistryError::Unavailable(_))
        ));

        // The failed mutation must not linger in memory: once storage
        // recovers, the same admit succeeds.
        storage.set_fail_persists(false);
        assert_eq!(
            handle.apply(RegistryOperation::Admit { info: agent("a1") }).await,
            Ok(true)
        );
    }
}
