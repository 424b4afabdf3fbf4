//! Registry state and the mutating operations applied to it.

use crate::ids::AgentId;
use crate::messages::AgentInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::SystemTime;

/// An entry in the unreachable list. Order of the list matches the
/// order agents were marked unreachable, which the garbage collector
/// relies on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnreachableAgent {
    pub id: AgentId,
    pub since: SystemTime,
}

/// The durable registry: admitted agents plus unreachable agents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub admitted: Vec<AgentInfo>,
    pub unreachable: Vec<UnreachableAgent>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of all admitted agents. The registrar keeps this index
    /// alongside the registry so operations avoid linear scans for
    /// membership checks.
    pub fn admitted_ids(&self) -> HashSet<AgentId> {
        self.admitted
            .iter()
            .filter_map(|info| info.id.clone())
            .collect()
    }
}

/// Errors from applying a registry operation.
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryError {
    /// The operation's precondition does not hold (duplicate admission,
    /// mutation of an unknown agent). A retry observing a committed
    /// prior attempt will see this; callers decide whether it counts as
    /// success.
    Conflict(String),

    /// The operation payload is unusable (e.g. an info without an id).
    Malformed(String),

    /// The backing store failed; the registry's durability guarantee is
    /// gone and the master must stop acting as leader.
    Unavailable(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Conflict(msg) => write!(f, "Registry conflict: {}", msg),
            RegistryError::Malformed(msg) => write!(f, "Malformed registry operation: {}", msg),
            RegistryError::Unavailable(msg) => write!(f, "Registry unavailable: {}", msg),
        }
    }
}

impl std::error::Error for RegistryError {}

/// A serialized, durable mutation of the registry.
///
/// `apply` returns `Ok(true)` when the registry changed, `Ok(false)`
/// for a no-op, and an error when a precondition fails. Re-applying an
/// identical command never duplicates state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RegistryOperation {
    /// Add a new agent to the admitted list. Fails if already admitted.
    Admit { info: AgentInfo },

    /// Move an agent from admitted to unreachable. Fails if not
    /// admitted.
    MarkUnreachable { info: AgentInfo, since: SystemTime },

    /// Move an agent back to admitted. No-op when already admitted;
    /// admits with a warning when the registry has no record at all
    /// (its metadata may have been garbage collected).
    MarkReachable { info: AgentInfo },

    /// Drop the listed ids from the unreachable list. Ids not present
    /// are skipped; they may have been removed concurrently.
    PruneUnreachable { ids: HashSet<AgentId> },

    /// Remove an agent from the admitted list entirely. Fails if not
    /// admitted.
    Remove { info: AgentInfo },
}

impl RegistryOperation {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryOperation::Admit { .. } => "Admit",
            RegistryOperation::MarkUnreachable { .. } => "MarkUnreachable",
            RegistryOperation::MarkReachable { .. } => "MarkReachable",
            RegistryOperation::PruneUnreachable { .. } => "PruneUnreachable",
            RegistryOperation::Remove { .. } => "Remove",
        }
    }

    pub fn apply(
        &self,
        registry: &mut Registry,
        admitted_ids: &mut HashSet<AgentId>,
    ) -> Result<bool, RegistryError> {
        match self {
            RegistryOperation::Admit { info } => {
                let id = required_id(info)?;

                // Only possible on an id collision, which is negligible
                // in practice: ids are prefixed with the master's uuid.
                if admitted_ids.contains(&id) {
                    return Err(RegistryError::Conflict(format!(
                        "agent {} already admitted",
                        id
                    )));
                }

                registry.admitted.push(info.clone());
                admitted_ids.insert(id);
                Ok(true)
            }

            RegistryOperation::MarkUnreachable { info, since } => {
                let id = required_id(info)?;

                if !admitted_ids.contains(&id) {
                    return Err(RegistryError::Conflict(format!(
                        "agent {} not yet admitted",
                        id
                    )));
                }

                registry
                    .admitted
                    .retain(|admitted| admitted.id.as_ref() != Some(&id));
                admitted_ids.remove(&id);
                registry.unreachable.push(UnreachableAgent {
                    id,
                    since: *since,
                });
                Ok(true)
            }

            RegistryOperation::MarkReachable { info } => {
                let id = required_id(info)?;

                // Agents usually race to re-register with a new master
                // before being marked unreachable; the registry is then
                // already in the right state.
                if admitted_ids.contains(&id) {
                    return Ok(false);
                }

                registry.unreachable.retain(|entry| entry.id != id);

                // Admit even when the agent was in neither list: it may
                // have been unreachable long enough to be pruned. The
                // registrar logs the anomaly.
                registry.admitted.push(info.clone());
                admitted_ids.insert(id);
                Ok(true)
            }

            RegistryOperation::PruneUnreachable { ids } => {
                let before = registry.unreachable.len();
                registry.unreachable.retain(|entry| !ids.contains(&entry.id));
                Ok(registry.unreachable.len() != before)
            }

            RegistryOperation::Remove { info } => {
                let id = required_id(info)?;

                if !admitted_ids.contains(&id) {
                    return Err(RegistryError::Conflict(format!(
                        "agent {} not yet admitted",
                        id
                    )));
                }

                registry
                    .admitted
                    .retain(|admitted| admitted.id.as_ref() != Some(&id));
                admitted_ids.remove(&id);
                Ok(true)
            }
        }
    }
}

fn required_id(info: &AgentInfo) -> Result<AgentId, RegistryError> {
    info.id
        .clone()
        .ok_or_else(|| RegistryError::Malformed("agent info is missing its id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Resources;

    fn agent(id: &str) -> AgentInfo {
        let mut info = AgentInfo::new(format!("host-{}", id), Resources::cpus_mem(4.0, 8192.0));
        info.id = Some(AgentId::new(id));
        info
    }

    fn apply(
        registry: &mut Registry,
        op: RegistryOperation,
    ) -> Result<bool, RegistryError> {
        let mut ids = registry.admitted_ids();
        op.apply(registry, &mut ids)
    }

    #[test]
    fn test_admit_then_admit_conflicts() {
        let mut registry = Registry::new();

        assert_eq!(apply(&mut registry, RegistryOperation::Admit { info: agent("a1") }), Ok(true));
        assert_eq!(registry.admitted.len(), 1);

        let second = apply(&mut registry, RegistryOperation::Admit { info: agent("a1") });
        assert!(matches!(second, Err(RegistryError::Conflict(_))));
        // Registry unchanged by the failed attempt.
        assert_eq!(registry.admitted.len(), 1);
    }

    #[test]
    fn test_mark_unreachable_then_reachable_roundtrip() {
        let mut registry = Registry::new();
        apply(&mut registry, RegistryOperation::Admit { info: agent("a1") }).unwrap();
        let snapshot = registry.clone();

        let since = SystemTime::now();
        assert_eq!(
            apply(
                &mut registry,
                RegistryOperation::MarkUnreachable {
                    info: agent("a1"),
                    since
                }
            ),
            Ok(true)
        );
        assert!(registry.admitted.is_empty());
        assert_eq!(registry.unreachable.len(), 1);

        assert_eq!(
            apply(&mut registry, RegistryOperation::MarkReachable { info: agent("a1") }),
            Ok(true)
        );
        assert_eq!(registry, snapshot);
    }

    #[test]
    fn test_mark_unreachable_requires_admission() {
        let mut registry = Registry::new();
        let result = apply(
            &mut registry,
            RegistryOperation::MarkUnreachable {
                info: agent("ghost"),
                since: SystemTime::now(),
            },
        );
        assert!(matches!(result, Err(RegistryError::Conflict(_))));
    }

    #[test]
    fn test_mark_reachable_is_noop_when_admitted() {
        let mut registry = Registry::new();
        apply(&mut registry, RegistryOperation::Admit { info: agent("a1") }).unwrap();

        assert_eq!(
            apply(&mut registry, RegistryOperation::MarkReachable { info: agent("a1") }),
            Ok(false)
        );
        assert_eq!(registry.admitted.len(), 1);
    }

    #[test]
    fn test_mark_reachable_admits_unknown_agent() {
        let mut registry = Registry::new();

        // Neither admitted nor unreachable: the registry may have pruned
        // its record. Still admitted.
        assert_eq!(
            apply(&mut registry, RegistryOperation::MarkReachable { info: agent("gc") }),
            Ok(true)
        );
        assert_eq!(registry.admitted.len(), 1);
    }

    #[test]
    fn test_prune_skips_missing_ids() {
        let mut registry = Registry::new();
        apply(&mut registry, RegistryOperation::Admit { info: agent("a1") }).unwrap();
        apply(
            &mut registry,
            RegistryOperation::MarkUnreachable {
                info: agent("a1"),
                since: SystemTime::now(),
            },
        )
        .unwrap();

        let ids: HashSet<AgentId> =
            [AgentId::new("a1"), AgentId::new("missing")].into_iter().collect();
        assert_eq!(
            apply(&mut registry, RegistryOperation::PruneUnreachable { ids: ids.clone() }),
            Ok(true)
        );
        assert!(registry.unreachable.is_empty());

        // Nothing left to prune: a clean no-op.
        assert_eq!(
            apply(&mut registry, RegistryOperation::PruneUnreachable { ids }),
            Ok(false)
        );
    }

    #[test]
    fn test_remove_requires_admission() {
        let mut registry = Registry::new();
        assert!(matches!(
            apply(&mut registry, RegistryOperation::Remove { info: agent("a1") }),
            Err(RegistryError::Conflict(_))
        ));

        apply(&mut registry, RegistryOperation::Admit { info: agent("a1") }).unwrap();
        assert_eq!(
            apply(&mut registry, RegistryOperation::Remove { info: agent("a1") }),
            Ok(true)
        );
        assert!(registry.admitted.is_empty());
    }

    #[test]
    fn test_no_agent_in_both_lists() {
        let mut registry = Registry::new();
        apply(&mut registry, RegistryOperation::Admit { info: agent("a1") }).unwrap();
        apply(
            &mut registry,
            RegistryOperation::MarkUnreachable {
                info: agent("a1"),
                since: SystemTime::now(),
            },
        )
        .unwrap();
        apply(&mut registry, RegistryOperation::MarkReachable { info: agent("a1") }).unwrap();

        let admitted = registry.admitted_ids();
        for entry in &registry.unreachable {
            assert!(!admitted.contains(&entry.id));
        }
    }
}
