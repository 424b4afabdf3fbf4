//! Message and descriptor types exchanged with agents, frameworks, and
//! operator clients.
//!
//! Everything here is plain serde data. The master core does no network
//! transport; connections are in-process channels carrying these types,
//! and an outer layer is free to map them onto a wire protocol.

pub mod agent;
pub mod scheduler;
pub mod subscriber;

use crate::ids::{AgentId, ExecutorId, FrameworkId, MachineId, TaskId};
use crate::resources::Resources;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Descriptor an agent presents when registering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Assigned by the master on first admission; agents echo it back on
    /// re-registration.
    pub id: Option<AgentId>,
    pub hostname: String,
    /// Statically declared resources, before any applied operations.
    pub resources: Resources,
    pub machine: MachineId,
}

impl AgentInfo {
    pub fn new(hostname: impl Into<String>, resources: Resources) -> Self {
        let hostname = hostname.into();
        let machine = MachineId::new(hostname.clone(), "0.0.0.0");
        Self {
            id: None,
            hostname,
            resources,
            machine,
        }
    }
}

/// Descriptor a framework presents when subscribing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    /// Set by the master at first registration; a framework failing over
    /// presents the same id to reclaim its state.
    pub id: Option<FrameworkId>,
    pub name: String,
    pub user: String,
    pub role: String,
    /// Principal the framework claims; must match the authenticated
    /// principal when authentication is required.
    pub principal: Option<String>,
    /// How long the master keeps the framework's tasks running after the
    /// framework disconnects. `None` falls back to the configured default.
    pub failover_timeout: Option<Duration>,
    pub hostname: Option<String>,
    pub webui_url: Option<String>,
    pub capabilities: Vec<String>,
    pub labels: Vec<(String, String)>,
}

impl FrameworkInfo {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            user: "nobody".to_string(),
            role: role.into(),
            principal: None,
            failover_timeout: None,
            hostname: None,
            webui_url: None,
            capabilities: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Merge the mutable subset of fields from a re-registration.
    /// Immutable fields (user, role, principal) are left untouched; the
    /// caller logs when they differ.
    pub fn merge(&mut self, source: &FrameworkInfo) {
        self.name = source.name.clone();
        self.failover_timeout = source.failover_timeout;
        self.hostname = source.hostname.clone();
        self.webui_url = source.webui_url.clone();
        self.capabilities = source.capabilities.clone();
        self.labels = source.labels.clone();
    }
}

/// Description of a task a framework wants launched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub resources: Resources,
    /// Executor the task runs under; tasks without one get an
    /// agent-provided command executor and consume no extra resources.
    pub executor: Option<ExecutorInfo>,
    pub data: Vec<u8>,
}

impl TaskInfo {
    pub fn new(task_id: impl Into<String>, resources: Resources) -> Self {
        let task_id = TaskId::new(task_id);
        Self {
            name: task_id.as_str().to_string(),
            task_id,
            resources,
            executor: None,
            data: Vec::new(),
        }
    }
}

/// Description of a long-lived executor hosting tasks on an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub framework_id: Option<FrameworkId>,
    pub resources: Resources,
}

/// Task lifecycle states, matching the scheduler-visible state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Killed,
    Lost,
    Unreachable,
    /// The master has no record of the task at all.
    Unknown,
}

impl TaskState {
    /// Terminal states release the task's resources.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }
}

/// A single status report for a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub agent_id: Option<AgentId>,
    pub executor_id: Option<ExecutorId>,
    pub message: Option<String>,
    /// Present on agent-originated updates; acknowledgements echo it.
    /// Master-generated updates (reconciliation) carry none and need no
    /// acknowledgement.
    pub uuid: Option<Uuid>,
    pub timestamp: SystemTime,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            agent_id: None,
            executor_id: None,
            message: None,
            uuid: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Identity of a master incarnation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub id: String,
    pub hostname: String,
    pub version: String,
}

/// A scheduled window during which a machine will be unavailable.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Unavailability {
    pub start: SystemTime,
    /// `None` means unavailable indefinitely.
    pub duration: Option<Duration>,
}
