//! Master-level events streamed to subscribed operator clients.

use super::{AgentInfo, FrameworkInfo, TaskState, TaskStatus};
use crate::ids::{AgentId, FrameworkId, TaskId};
use serde::{Deserialize, Serialize};

/// An event on the operator event stream. Subscribers receive every
/// event in arrival order, interleaved with heartbeats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MasterEvent {
    /// Sent once on subscription so late subscribers know their stream.
    Subscribed { stream_id: String },

    AgentAdded {
        agent_id: AgentId,
        info: AgentInfo,
    },

    AgentRemoved {
        agent_id: AgentId,
    },

    FrameworkAdded {
        framework_id: FrameworkId,
        info: FrameworkInfo,
    },

    FrameworkUpdated {
        framework_id: FrameworkId,
        info: FrameworkInfo,
    },

    FrameworkRemoved {
        framework_id: FrameworkId,
    },

    TaskAdded {
        framework_id: FrameworkId,
        agent_id: AgentId,
        task_id: TaskId,
        state: TaskState,
    },

    TaskUpdated {
        framework_id: FrameworkId,
        status: TaskStatus,
    },

    Heartbeat,
}
