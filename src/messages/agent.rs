//! Messages exchanged between the master and agents.

use super::{AgentInfo, ExecutorInfo, FrameworkInfo, MasterInfo, TaskInfo, TaskStatus};
use crate::ids::{AgentId, ExecutorId, FrameworkId, TaskId};
use crate::resources::Resources;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task as an agent reports it during re-registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunningTask {
    pub task_id: TaskId,
    pub framework_id: FrameworkId,
    pub executor_id: Option<ExecutorId>,
    pub state: super::TaskState,
    pub resources: Resources,
}

/// Messages sent by the master to an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AgentMessage {
    /// First registration accepted; carries the assigned agent id.
    Registered {
        agent_id: AgentId,
        master: MasterInfo,
    },

    /// Re-registration accepted.
    Reregistered { agent_id: AgentId },

    /// The master refuses this agent; it must shut down. Sent to agents
    /// whose id was removed, or on admission conflicts.
    Shutdown { message: String },

    /// Launch a task. The agent owns the task from here on and reports
    /// progress through status updates.
    RunTask {
        framework_id: FrameworkId,
        framework: FrameworkInfo,
        task: TaskInfo,
    },

    /// Kill a task.
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },

    /// Shut down one executor and everything it runs.
    ShutdownExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },

    /// The durable subset of the agent's resources changed (reservation
    /// or volume operations); the agent must persist this bundle.
    CheckpointResources { checkpointed: Resources },

    /// A framework acknowledged a status update; the agent may drop its
    /// retry state for this uuid.
    StatusUpdateAcknowledgement {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: Uuid,
    },

    /// Data payload from a framework to one of its executors.
    FrameworkToExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
}

/// Calls sent by an agent to the master.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AgentCall {
    /// First registration of a brand-new agent.
    Register {
        info: AgentInfo,
        checkpointed: Resources,
        version: String,
    },

    /// Re-registration after an agent restart or a master failover. The
    /// agent reports everything it is running so the master can
    /// reconcile.
    Reregister {
        info: AgentInfo,
        checkpointed: Resources,
        executors: Vec<ExecutorInfo>,
        tasks: Vec<RunningTask>,
        frameworks: Vec<FrameworkInfo>,
        version: String,
    },

    /// A task changed state.
    StatusUpdate {
        framework_id: FrameworkId,
        update: TaskStatus,
    },

    /// An executor terminated; its resources are free again.
    ExecutorExited {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    },

    /// Graceful shutdown: the agent asks to be removed.
    Unregister { agent_id: AgentId },

    /// The agent's total resources changed (e.g. oversubscription).
    UpdateTotal {
        agent_id: AgentId,
        total: Resources,
    },
}
