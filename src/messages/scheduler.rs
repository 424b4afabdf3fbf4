//! The framework-facing call and event surface.

use super::{TaskStatus, Unavailability};
use crate::ids::{AgentId, ExecutorId, FrameworkId, OfferId, TaskId};
use crate::resources::{Operation, Resources};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Refusal filters a framework attaches to declined resources. The
/// allocator will not re-offer the filtered resources to this framework
/// until the refusal window elapses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    pub refuse: Duration,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            refuse: Duration::from_secs(5),
        }
    }
}

/// One resource offer: a promise of `resources` on `agent_id` for a
/// bounded time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: OfferId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: Resources,
    /// Pending unavailability of the agent's machine, when a maintenance
    /// window is scheduled.
    pub unavailability: Option<Unavailability>,
}

/// A request from the master that the framework release resources on an
/// agent ahead of a maintenance window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InverseOffer {
    pub offer_id: OfferId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub unavailability: Unavailability,
    pub resources: Resources,
}

/// A task a framework asks about during explicit reconciliation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub task_id: TaskId,
    pub agent_id: Option<AgentId>,
}

/// Calls a framework sends to the master.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Call {
    /// Tear the framework down: kill its tasks everywhere and forget it.
    Teardown,

    /// Accept offers, applying the listed operations in order against
    /// the combined offered resources.
    Accept {
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
        filters: Filters,
    },

    /// Decline offers. Equivalent to `Accept` with no operations.
    Decline {
        offer_ids: Vec<OfferId>,
        filters: Filters,
    },

    /// Accept inverse offers: the framework agrees to vacate.
    AcceptInverseOffers { offer_ids: Vec<OfferId> },

    /// Decline inverse offers: the framework will not vacate.
    DeclineInverseOffers {
        offer_ids: Vec<OfferId>,
        filters: Filters,
    },

    /// Clear all filters and resume offers for this framework.
    Revive,

    /// Stop receiving offers until `Revive`.
    Suppress,

    /// Kill one task.
    Kill {
        task_id: TaskId,
        agent_id: Option<AgentId>,
    },

    /// Shut down one executor.
    Shutdown {
        executor_id: ExecutorId,
        agent_id: AgentId,
    },

    /// Acknowledge a status update so the agent can stop retrying it.
    Acknowledge {
        agent_id: AgentId,
        task_id: TaskId,
        uuid: Uuid,
    },

    /// Reconcile task state. An empty list asks about every task.
    Reconcile { tasks: Vec<ReconcileTask> },

    /// Data payload for one of the framework's executors.
    Message {
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },

    /// Non-binding resource request, forwarded to the allocator.
    Request { resources: Vec<Resources> },
}

impl Call {
    pub fn kind(&self) -> &'static str {
        match self {
            Call::Teardown => "TEARDOWN",
            Call::Accept { .. } => "ACCEPT",
            Call::Decline { .. } => "DECLINE",
            Call::AcceptInverseOffers { .. } => "ACCEPT_INVERSE_OFFERS",
            Call::DeclineInverseOffers { .. } => "DECLINE_INVERSE_OFFERS",
            Call::Revive => "REVIVE",
            Call::Suppress => "SUPPRESS",
            Call::Kill { .. } => "KILL",
            Call::Shutdown { .. } => "SHUTDOWN",
            Call::Acknowledge { .. } => "ACKNOWLEDGE",
            Call::Reconcile { .. } => "RECONCILE",
            Call::Message { .. } => "MESSAGE",
            Call::Request { .. } => "REQUEST",
        }
    }
}

/// Events the master sends to a framework.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Subscription succeeded; carries the (possibly new) framework id.
    Subscribed {
        framework_id: FrameworkId,
        heartbeat_interval: Duration,
    },

    /// New resource offers.
    Offers { offers: Vec<Offer> },

    /// New inverse offers.
    InverseOffers { inverse_offers: Vec<InverseOffer> },

    /// A previously sent offer is no longer valid.
    Rescind { offer_id: OfferId },

    /// A previously sent inverse offer is no longer valid.
    RescindInverseOffer { offer_id: OfferId },

    /// A task status update. Updates carrying a uuid must be
    /// acknowledged; duplicates are possible until then.
    Update { status: TaskStatus },

    /// Data payload from one of the framework's executors.
    Message {
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },

    /// An agent or executor the framework was using is gone.
    Failure {
        agent_id: Option<AgentId>,
        executor_id: Option<ExecutorId>,
        status: Option<i32>,
    },

    /// The call could not be processed; state is unchanged.
    Error { message: String },

    /// Periodic liveness signal on streaming connections.
    Heartbeat,
}
