//! The master actor.
//!
//! One task owns all master state and drains one mailbox. Handlers are
//! synchronous; anything that must wait (registry commits,
//! authorization, authentication, timers) runs on a spawned task and
//! posts a continuation message back into the mailbox. Continuations
//! re-look-up every entity by id and re-validate before acting, because
//! the world may have moved while they were pending.

use super::agent::{Agent, AgentConnection, Agents, Task};
use super::framework::{Framework, FrameworkConnection, Frameworks};
use super::offer::OfferLedger;
use super::subscribers::Subscribers;
use crate::allocator::{AllocationEvent, Allocator};
use crate::auth::{
    Action, AuthenticationTracker, Authenticator, AuthorizationError, AuthorizationRequest,
    Authorizer, Credential,
};
use crate::config::MasterConfig;
use crate::error::Error;
use crate::ids::{AgentId, Address, ExecutorId, FrameworkId, MachineId, OfferId, TaskId};
use crate::machine::{MaintenanceMode, Schedule};
use crate::messages::agent::{AgentCall, AgentMessage, RunningTask};
use crate::messages::scheduler::{Call, Event, Filters, InverseOffer, Offer, ReconcileTask};
use crate::messages::subscriber::MasterEvent;
use crate::messages::{
    AgentInfo, ExecutorInfo, FrameworkInfo, MasterInfo, TaskInfo, TaskState, TaskStatus,
};
use crate::ratelimit::Admission;
use crate::registry::{
    Registrar, RegistrarHandle, RegistryError, RegistryOperation, RegistryStorage,
};
use crate::resources::{Operation, Resources};
use crate::role::{Quota, Roles};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn, Logger};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Counters the master maintains while processing. Counts only; gauge
/// rendering belongs to an outer layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub messages_throttled: u64,
    pub messages_dropped_capacity: u64,
    pub valid_status_updates: u64,
    pub invalid_status_updates: u64,
    pub agents_removed: u64,
    pub agents_marked_unreachable: u64,
    pub frameworks_removed: u64,
    pub tasks_launched: u64,
    pub tasks_lost: u64,
}

/// Operator API calls. Every variant is authorization-gated.
#[derive(Clone, Debug)]
pub enum OperatorOp {
    GetState,
    GetAgents,
    GetFrameworks,
    GetTasks,
    GetRoles,
    GetFlags,
    GetHealth,
    GetVersion,
    GetMetrics,
    SubscribeEvents,
    GetMaintenanceSchedule,
    UpdateMaintenanceSchedule { schedule: Schedule },
    GetMaintenanceStatus,
    MachineDown { machine: MachineId },
    MachineUp { machine: MachineId },
    GetQuota,
    SetQuota { role: String, quota: Quota },
    RemoveQuota { role: String },
    GetWeights,
    UpdateWeights { weights: HashMap<String, f64> },
    ReserveResources { agent_id: AgentId, resources: Resources },
    UnreserveResources { agent_id: AgentId, resources: Resources },
    CreateVolumes { agent_id: AgentId, volumes: Resources },
    DestroyVolumes { agent_id: AgentId, volumes: Resources },
    RemoveAgent { agent_id: AgentId },
}

/// Replies to operator calls.
pub enum OperatorResponse {
    Ack,
    State(Box<StateSnapshot>),
    Agents(Vec<AgentSummary>),
    Frameworks(Vec<FrameworkSummary>),
    Tasks(Vec<TaskSummary>),
    Roles(Vec<RoleSummary>),
    Flags(Box<MasterConfig>),
    Health(bool),
    Version(String),
    Metrics(Metrics),
    EventStream {
        stream_id: Uuid,
        events: mpsc::UnboundedReceiver<MasterEvent>,
    },
    Schedule(Schedule),
    MaintenanceStatus(Vec<(MachineId, MaintenanceMode)>),
    Quotas(HashMap<String, Quota>),
    Weights(HashMap<String, f64>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub hostname: String,
    pub connected: bool,
    pub active: bool,
    pub total_resources: Resources,
    pub used_resources: HashMap<FrameworkId, Resources>,
    pub offered_resources: Resources,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameworkSummary {
    pub framework_id: FrameworkId,
    pub name: String,
    pub role: String,
    pub connected: bool,
    pub active: bool,
    pub task_count: usize,
    pub used_resources: HashMap<AgentId, Resources>,
    pub offered_resources: HashMap<AgentId, Resources>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub state: TaskState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoleSummary {
    pub role: String,
    pub weight: f64,
    pub quota: Option<Quota>,
    pub frameworks: Vec<FrameworkId>,
}

/// A full operator-visible snapshot of master state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub master: MasterInfo,
    pub agents: Vec<AgentSummary>,
    pub unreachable_agents: Vec<AgentId>,
    pub frameworks: Vec<FrameworkSummary>,
    pub completed_frameworks: Vec<FrameworkId>,
    pub tasks: Vec<TaskSummary>,
    pub metrics: Metrics,
}

/// Payload of a framework subscription, carried through authorization.
struct SubscribePayload {
    tx: mpsc::UnboundedSender<Event>,
    streaming: bool,
    address: Address,
    info: FrameworkInfo,
}

type OperatorReply = oneshot::Sender<Result<OperatorResponse, Error>>;

enum MasterMessage {
    // Agent-facing.
    RegisterAgent {
        connection: AgentConnection,
        info: AgentInfo,
        checkpointed: Resources,
        version: String,
    },
    ReregisterAgent {
        connection: AgentConnection,
        info: AgentInfo,
        checkpointed: Resources,
        executors: Vec<ExecutorInfo>,
        tasks: Vec<RunningTask>,
        frameworks: Vec<FrameworkInfo>,
        version: String,
    },
    FromAgent {
        call: AgentCall,
    },
    AgentExited {
        address: Address,
    },
    MarkAgentUnreachable {
        agent_id: AgentId,
    },

    // Framework-facing.
    Authenticate {
        address: Address,
        credential: Credential,
    },
    Subscribe {
        payload: SubscribePayload,
    },
    SchedulerCall {
        framework_id: FrameworkId,
        call: Call,
    },
    FrameworkExited {
        framework_id: FrameworkId,
    },

    // Operator-facing.
    Operator {
        principal: Option<String>,
        op: OperatorOp,
        reply: OperatorReply,
    },

    // Allocator output.
    Allocation(AllocationEvent),

    // Continuations of suspended handlers.
    AgentAdmitted {
        connection: AgentConnection,
        info: AgentInfo,
        checkpointed: Resources,
        version: String,
        result: Result<bool, RegistryError>,
    },
    AgentReadmitted {
        connection: AgentConnection,
        info: AgentInfo,
        checkpointed: Resources,
        executors: Vec<ExecutorInfo>,
        tasks: Vec<RunningTask>,
        frameworks: Vec<FrameworkInfo>,
        version: String,
        result: Result<bool, RegistryError>,
    },
    UnreachableCommitted {
        info: AgentInfo,
        since: SystemTime,
        result: Result<bool, RegistryError>,
    },
    RemovalCommitted {
        info: AgentInfo,
        reason: String,
        reply: Option<OperatorReply>,
        result: Result<bool, RegistryError>,
    },
    PruneCommitted {
        ids: HashSet<AgentId>,
        result: Result<bool, RegistryError>,
    },
    AuthenticateCompleted {
        address: Address,
        generation: u64,
        result: Result<Option<String>, String>,
    },
    FrameworkAuthorized {
        payload: SubscribePayload,
        result: Result<bool, AuthorizationError>,
    },
    OperatorAuthorized {
        op: OperatorOp,
        reply: OperatorReply,
        result: Result<bool, AuthorizationError>,
    },
    AcceptReady {
        framework_id: FrameworkId,
        agent_id: AgentId,
        offered: Resources,
        operations: Vec<Operation>,
        filters: Filters,
        decisions: Vec<Result<bool, AuthorizationError>>,
    },
    ThrottledRelease {
        principal: Option<String>,
        framework_id: FrameworkId,
        call: Call,
    },

    // Timers.
    RecoveredAgentsTimeout,
    BeginMarkUnreachable {
        agent_id: AgentId,
    },
    OfferExpired {
        offer_id: OfferId,
    },
    InverseOfferExpired {
        offer_id: OfferId,
    },
    FrameworkFailoverTimeout {
        framework_id: FrameworkId,
        generation: u64,
    },
    RegistryGcTick,

    Terminate,
}

/// Clonable handle for talking to a running master.
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::Sender<MasterMessage>,
}

impl MasterHandle {
    async fn send(&self, message: MasterMessage) -> Result<(), Error> {
        self.tx.send(message).await.map_err(|_| Error::Terminated)
    }

    /// First registration of an agent. The reply arrives on the agent's
    /// channel as `AgentMessage::Registered`.
    pub async fn register_agent(
        &self,
        connection: AgentConnection,
        info: AgentInfo,
        checkpointed: Resources,
        version: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(MasterMessage::RegisterAgent {
            connection,
            info,
            checkpointed,
            version: version.into(),
        })
        .await
    }

    /// Re-registration of a known (or recovered, or unreachable) agent.
    #[allow(clippy::too_many_arguments)]
    pub async fn reregister_agent(
        &self,
        connection: AgentConnection,
        info: AgentInfo,
        checkpointed: Resources,
        executors: Vec<ExecutorInfo>,
        tasks: Vec<RunningTask>,
        frameworks: Vec<FrameworkInfo>,
        version: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(MasterMessage::ReregisterAgent {
            connection,
            info,
            checkpointed,
            executors,
            tasks,
            frameworks,
            version: version.into(),
        })
        .await
    }

    /// Any other agent call: status updates, executor exits, graceful
    /// unregistration, total updates.
    pub async fn agent_call(&self, call: AgentCall) -> Result<(), Error> {
        self.send(MasterMessage::FromAgent { call }).await
    }

    /// The transport to an agent closed.
    pub async fn agent_exited(&self, address: Address) -> Result<(), Error> {
        self.send(MasterMessage::AgentExited { address }).await
    }

    /// An external health checker declared the agent unhealthy.
    pub async fn mark_agent_unreachable(&self, agent_id: AgentId) -> Result<(), Error> {
        self.send(MasterMessage::MarkAgentUnreachable { agent_id })
            .await
    }

    /// Authenticate a remote endpoint before it subscribes.
    pub async fn authenticate(
        &self,
        address: Address,
        credential: Credential,
    ) -> Result<(), Error> {
        self.send(MasterMessage::Authenticate { address, credential })
            .await
    }

    /// Subscribe a framework. Events (including the `Subscribed` reply
    /// carrying the framework id) arrive on the returned receiver.
    pub async fn subscribe(
        &self,
        address: Address,
        info: FrameworkInfo,
        streaming: bool,
    ) -> Result<mpsc::UnboundedReceiver<Event>, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(MasterMessage::Subscribe {
            payload: SubscribePayload {
                tx,
                streaming,
                address,
                info,
            },
        })
        .await?;
        Ok(rx)
    }

    /// A call from a subscribed framework.
    pub async fn scheduler_call(
        &self,
        framework_id: FrameworkId,
        call: Call,
    ) -> Result<(), Error> {
        self.send(MasterMessage::SchedulerCall { framework_id, call })
            .await
    }

    /// The transport to a framework closed.
    pub async fn framework_exited(&self, framework_id: FrameworkId) -> Result<(), Error> {
        self.send(MasterMessage::FrameworkExited { framework_id })
            .await
    }

    /// An operator API call.
    pub async fn operator(
        &self,
        principal: Option<String>,
        op: OperatorOp,
    ) -> Result<OperatorResponse, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(MasterMessage::Operator { principal, op, reply })
            .await?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Convenience wrapper for `OperatorOp::GetState`.
    pub async fn get_state(&self) -> Result<StateSnapshot, Error> {
        match self.operator(None, OperatorOp::GetState).await? {
            OperatorResponse::State(snapshot) => Ok(*snapshot),
            _ => Err(Error::Validation("unexpected operator response".to_string())),
        }
    }

    /// Convenience wrapper for `OperatorOp::SubscribeEvents`.
    pub async fn subscribe_events(
        &self,
        principal: Option<String>,
    ) -> Result<(Uuid, mpsc::UnboundedReceiver<MasterEvent>), Error> {
        match self.operator(principal, OperatorOp::SubscribeEvents).await? {
            OperatorResponse::EventStream { stream_id, events } => Ok((stream_id, events)),
            _ => Err(Error::Validation("unexpected operator response".to_string())),
        }
    }

    /// Stop the master. In-flight work is dropped; durable state is
    /// already committed.
    pub async fn terminate(&self) -> Result<(), Error> {
        self.send(MasterMessage::Terminate).await
    }
}

/// The master actor. Created when this process is elected leader and
/// dropped when leadership is lost; there is no state outside it.
pub struct Master {
    config: MasterConfig,
    info: MasterInfo,
    logger: Logger,

    rx: mpsc::Receiver<MasterMessage>,
    tx: mpsc::Sender<MasterMessage>,

    registrar: RegistrarHandle,
    allocator: Box<dyn Allocator>,
    authorizer: Arc<dyn Authorizer>,
    authenticator: Option<Arc<dyn Authenticator>>,
    auth_tracker: AuthenticationTracker,

    agents: Agents,
    frameworks: Frameworks,
    offers: OfferLedger,
    roles: Roles,
    maintenance: crate::machine::Maintenance,
    subscribers: Subscribers,

    /// Forwarded status-update uuids awaiting acknowledgement, keyed by
    /// (agent, framework, task).
    pending_acks: HashMap<(AgentId, FrameworkId, TaskId), Vec<Uuid>>,

    metrics: Metrics,

    next_agent_id: u64,
    next_framework_id: u64,
    next_offer_id: u64,
}

impl Master {
    /// Recover the registry and start the master actor.
    pub fn start(
        config: MasterConfig,
        storage: Box<dyn RegistryStorage>,
        mut allocator: Box<dyn Allocator>,
        authorizer: Arc<dyn Authorizer>,
        authenticator: Option<Arc<dyn Authenticator>>,
        logger: Logger,
    ) -> Result<MasterHandle, Error> {
        let (registry, registrar) = Registrar::recover(storage, logger.clone())?;

        let info = MasterInfo {
            id: Uuid::new_v4().to_string(),
            hostname: config.hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        info!(logger, "Master starting";
            "master_id" => %info.id,
            "recovered_agents" => registry.admitted.len(),
            "unreachable_agents" => registry.unreachable.len()
        );

        let (tx, rx) = mpsc::channel(1024);

        let mut agents = Agents::new(config.max_removed_agents, config.agent_removal_rate_limit);
        for admitted in &registry.admitted {
            if let Some(id) = &admitted.id {
                agents.recovered.insert(id.clone(), admitted.clone());
            }
        }
        for unreachable in &registry.unreachable {
            agents
                .unreachable
                .insert(unreachable.id.clone(), unreachable.since);
        }

        // Allocator proposals flow through their own channel into the
        // mailbox so the allocator never touches master state directly.
        let (allocation_tx, mut allocation_rx) = mpsc::unbounded_channel();
        allocator.initialize(&config, allocation_tx);
        {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = allocation_rx.recv().await {
                    if tx.send(MasterMessage::Allocation(event)).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Periodic registry garbage collection.
        {
            let tx = tx.clone();
            let interval = config.registry_gc_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tx.send(MasterMessage::RegistryGcTick).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Recovered agents must re-register within the window.
        if !agents.recovered.is_empty() {
            let tx = tx.clone();
            let timeout = config.agent_reregister_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(MasterMessage::RecoveredAgentsTimeout).await;
            });
        }

        let master = Master {
            frameworks: Frameworks::new(&config),
            subscribers: Subscribers::new(config.heartbeat_interval, logger.clone()),
            roles: Roles::new(config.weights.clone()),
            maintenance: crate::machine::Maintenance::new(),
            config,
            info,
            logger,
            rx,
            tx: tx.clone(),
            registrar,
            allocator,
            authorizer,
            authenticator,
            auth_tracker: AuthenticationTracker::new(),
            agents,
            offers: OfferLedger::new(),
            pending_acks: HashMap::new(),
            metrics: Metrics::default(),
            next_agent_id: 0,
            next_framework_id: 0,
            next_offer_id: 0,
        };

        tokio::spawn(master.run());

        Ok(MasterHandle { tx })
    }

    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            if matches!(message, MasterMessage::Terminate) {
                info!(self.logger, "Master terminating");
                break;
            }

            if let Err(fatal) = self.handle(message) {
                // The registry is the leadership invariant: without it,
                // stop acting as leader rather than diverging.
                error!(self.logger, "Abdicating leadership"; "error" => %fatal);
                break;
            }
        }
    }

    fn handle(&mut self, message: MasterMessage) -> Result<(), Error> {
        match message {
            MasterMessage::RegisterAgent {
                connection,
                info,
                checkpointed,
                version,
            } => {
                self.register_agent(connection, info, checkpointed, version);
                Ok(())
            }
            MasterMessage::ReregisterAgent {
                connection,
                info,
                checkpointed,
                executors,
                tasks,
                frameworks,
                version,
            } => {
                self.reregister_agent(
                    connection,
                    info,
                    checkpointed,
                    executors,
                    tasks,
                    frameworks,
                    version,
                );
                Ok(())
            }
            MasterMessage::FromAgent { call } => {
                self.from_agent(call);
                Ok(())
            }
            MasterMessage::AgentExited { address } => {
                self.agent_exited(address);
                Ok(())
            }
            MasterMessage::MarkAgentUnreachable { agent_id } => {
                self.mark_agent_unreachable(agent_id);
                Ok(())
            }
            MasterMessage::Authenticate {
                address,
                credential,
            } => {
                self.authenticate(address, credential);
                Ok(())
            }
            MasterMessage::Subscribe { payload } => {
                self.subscribe(payload);
                Ok(())
            }
            MasterMessage::SchedulerCall { framework_id, call } => {
                self.scheduler_call(framework_id, call);
                Ok(())
            }
            MasterMessage::FrameworkExited { framework_id } => {
                self.framework_exited(framework_id);
                Ok(())
            }
            MasterMessage::Operator {
                principal,
                op,
                reply,
            } => {
                self.operator_request(principal, op, reply);
                Ok(())
            }
            MasterMessage::Allocation(event) => {
                self.allocation(event);
                Ok(())
            }
            MasterMessage::AgentAdmitted {
                connection,
                info,
                checkpointed,
                version,
                result,
            } => self.agent_admitted(connection, info, checkpointed, version, result),
            MasterMessage::AgentReadmitted {
                connection,
                info,
                checkpointed,
                executors,
                tasks,
                frameworks,
                version,
                result,
            } => self.agent_readmitted(
                connection,
                info,
                checkpointed,
                executors,
                tasks,
                frameworks,
                version,
                result,
            ),
            MasterMessage::UnreachableCommitted {
                info,
                since,
                result,
            } => self.unreachable_committed(info, since, result),
            MasterMessage::RemovalCommitted {
                info,
                reason,
                reply,
                result,
            } => self.removal_committed(info, reason, reply, result),
            MasterMessage::PruneCommitted { ids, result } => self.prune_committed(ids, result),
            MasterMessage::AuthenticateCompleted {
                address,
                generation,
                result,
            } => {
                self.authenticate_completed(address, generation, result);
                Ok(())
            }
            MasterMessage::FrameworkAuthorized { payload, result } => {
                self.framework_authorized(payload, result);
                Ok(())
            }
            MasterMessage::OperatorAuthorized { op, reply, result } => {
                self.operator_authorized(op, reply, result);
                Ok(())
            }
            MasterMessage::AcceptReady {
                framework_id,
                agent_id,
                offered,
                operations,
                filters,
                decisions,
            } => {
                self.accept_ready(framework_id, agent_id, offered, operations, filters, decisions);
                Ok(())
            }
            MasterMessage::ThrottledRelease {
                principal,
                framework_id,
                call,
            } => {
                self.throttled_release(principal, framework_id, call);
                Ok(())
            }
            MasterMessage::RecoveredAgentsTimeout => {
                self.recovered_agents_timeout();
                Ok(())
            }
            MasterMessage::BeginMarkUnreachable { agent_id } => {
                self.begin_mark_unreachable(agent_id);
                Ok(())
            }
            MasterMessage::OfferExpired { offer_id } => {
                self.offer_expired(offer_id);
                Ok(())
            }
            MasterMessage::InverseOfferExpired { offer_id } => {
                self.inverse_offer_expired(offer_id);
                Ok(())
            }
            MasterMessage::FrameworkFailoverTimeout {
                framework_id,
                generation,
            } => {
                self.framework_failover_timeout(framework_id, generation);
                Ok(())
            }
            MasterMessage::RegistryGcTick => {
                self.registry_gc();
                Ok(())
            }
            MasterMessage::Terminate => Ok(()),
        }
    }

    // ---- id generation ----

    fn new_agent_id(&mut self) -> AgentId {
        let id = AgentId::new(format!("{}-S{}", self.info.id, self.next_agent_id));
        self.next_agent_id += 1;
        id
    }

    fn new_framework_id(&mut self) -> FrameworkId {
        let id = FrameworkId::new(format!("{}-{:04}", self.info.id, self.next_framework_id));
        self.next_framework_id += 1;
        id
    }

    fn new_offer_id(&mut self) -> OfferId {
        let id = OfferId::new(format!("{}-O{}", self.info.id, self.next_offer_id));
        self.next_offer_id += 1;
        id
    }

    // ---- continuation plumbing ----

    /// Submit a registry operation and post the result back into the
    /// mailbox. Submission happens synchronously in the actor, so
    /// commits land in handler order.
    fn submit_registry<F>(&self, operation: RegistryOperation, wrap: F)
    where
        F: FnOnce(Result<bool, RegistryError>) -> MasterMessage + Send + 'static,
    {
        let pending = self.registrar.submit(operation);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = pending
                .await
                .unwrap_or_else(|_| Err(RegistryError::Unavailable("registrar stopped".to_string())));
            let _ = tx.send(wrap(result)).await;
        });
    }

    fn post_after(&self, delay: Duration, message: MasterMessage) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(message).await;
        });
    }

    // ---- agent registration ----

    fn register_agent(
        &mut self,
        connection: AgentConnection,
        mut info: AgentInfo,
        checkpointed: Resources,
        version: String,
    ) {
        if self.agents.registering.contains(&connection.address) {
            debug!(self.logger, "Ignoring register from agent; admission in progress";
                "address" => %connection.address);
            return;
        }

        if let Some(agent) = self.agents.get_by_address(&connection.address) {
            // Duplicate register from a live agent: resend the ack on
            // the connection that asked (the agent may have dropped the
            // old one).
            let agent_id = agent.id.clone();
            connection.send(AgentMessage::Registered {
                agent_id: agent_id.clone(),
                master: self.info.clone(),
            });
            self.agents.rebind(&agent_id, connection);
            return;
        }

        let agent_id = self.new_agent_id();
        info.id = Some(agent_id.clone());

        info!(self.logger, "Admitting agent";
            "agent_id" => %agent_id, "hostname" => %info.hostname);

        self.agents.registering.insert(connection.address.clone());
        self.submit_registry(
            RegistryOperation::Admit { info: info.clone() },
            move |result| MasterMessage::AgentAdmitted {
                connection,
                info,
                checkpointed,
                version,
                result,
            },
        );
    }

    fn agent_admitted(
        &mut self,
        connection: AgentConnection,
        info: AgentInfo,
        checkpointed: Resources,
        version: String,
        result: Result<bool, RegistryError>,
    ) -> Result<(), Error> {
        self.agents.registering.remove(&connection.address);

        match result {
            Err(RegistryError::Unavailable(msg)) => Err(Error::RegistryUnavailable(msg)),
            Err(conflict) => {
                // Id collision: only possible if another master admitted
                // this id concurrently. Refuse the agent.
                warn!(self.logger, "Refusing agent admission"; "error" => %conflict);
                connection.send(AgentMessage::Shutdown {
                    message: "agent admission conflicted".to_string(),
                });
                Ok(())
            }
            Ok(_) => {
                let agent = Agent::new(
                    info,
                    connection,
                    checkpointed,
                    version,
                    SystemTime::now(),
                );
                agent.send(AgentMessage::Registered {
                    agent_id: agent.id.clone(),
                    master: self.info.clone(),
                });
                self.add_agent(agent);
                Ok(())
            }
        }
    }

    /// Install a registered agent and tell the world about it.
    fn add_agent(&mut self, agent: Agent) {
        let agent_id = agent.id.clone();
        let machine = agent.machine.clone();
        let unavailability = self.maintenance.unavailability(&machine);
        let machine_down = self.maintenance.mode(&machine) == MaintenanceMode::Down;

        info!(self.logger, "Added agent";
            "agent_id" => %agent_id,
            "hostname" => %agent.info.hostname,
            "resources" => %agent.total_resources
        );

        self.subscribers.send(MasterEvent::AgentAdded {
            agent_id: agent_id.clone(),
            info: agent.info.clone(),
        });

        let info = agent.info.clone();
        let total = agent.total_resources.clone();
        let used = agent.used_resources.clone();
        self.agents.put(agent);

        self.allocator
            .add_agent(&agent_id, &info, unavailability, &total, used);

        if machine_down {
            self.deactivate_agent(&agent_id);
        }
    }

    // ---- agent re-registration ----

    #[allow(clippy::too_many_arguments)]
    fn reregister_agent(
        &mut self,
        connection: AgentConnection,
        info: AgentInfo,
        checkpointed: Resources,
        executors: Vec<ExecutorInfo>,
        tasks: Vec<RunningTask>,
        frameworks: Vec<FrameworkInfo>,
        version: String,
    ) {
        let agent_id = match info.id.clone() {
            Some(id) => id,
            // An agent without an id has never been admitted anywhere:
            // first registration.
            None => return self.register_agent(connection, info, checkpointed, version),
        };

        if self.agents.removed.contains(&agent_id) {
            warn!(self.logger, "Refusing re-registration of removed agent";
                "agent_id" => %agent_id);
            connection.send(AgentMessage::Shutdown {
                message: "agent has been removed".to_string(),
            });
            return;
        }

        if self.agents.reregistering.contains(&agent_id)
            || self.agents.removing.contains(&agent_id)
            || self.agents.marking_unreachable.contains(&agent_id)
        {
            debug!(self.logger, "Ignoring re-register; transition in progress";
                "agent_id" => %agent_id);
            return;
        }

        if self.agents.contains(&agent_id) {
            // Known agent, possibly at a new address: the new
            // connection wins.
            self.agents.rebind(&agent_id, connection);
            let machine_down;
            {
                let agent = self
                    .agents
                    .get_mut(&agent_id)
                    .expect("checked registered above");
                agent.connected = true;
                agent.reregistered_time = Some(SystemTime::now());
                machine_down = self.maintenance.mode(&agent.machine) == MaintenanceMode::Down;
                agent.send(AgentMessage::Reregistered {
                    agent_id: agent_id.clone(),
                });
            }

            info!(self.logger, "Re-registered agent"; "agent_id" => %agent_id);

            if !machine_down {
                self.activate_agent(&agent_id);
            }
            self.reconcile_known_agent(&agent_id, &executors, &tasks);
            return;
        }

        let known = self.agents.recovered.contains_key(&agent_id)
            || self.agents.unreachable.contains_key(&agent_id);
        if self.config.registry_strict && !known {
            warn!(self.logger, "Refusing unknown agent (strict registry)";
                "agent_id" => %agent_id);
            connection.send(AgentMessage::Shutdown {
                message: "unknown agent refused re-registration".to_string(),
            });
            return;
        }

        info!(self.logger, "Readmitting agent"; "agent_id" => %agent_id);

        self.agents.reregistering.insert(agent_id);
        self.submit_registry(
            RegistryOperation::MarkReachable { info: info.clone() },
            move |result| MasterMessage::AgentReadmitted {
                connection,
                info,
                checkpointed,
                executors,
                tasks,
                frameworks,
                version,
                result,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn agent_readmitted(
        &mut self,
        connection: AgentConnection,
        info: AgentInfo,
        checkpointed: Resources,
        executors: Vec<ExecutorInfo>,
        tasks: Vec<RunningTask>,
        frameworks: Vec<FrameworkInfo>,
        version: String,
        result: Result<bool, RegistryError>,
    ) -> Result<(), Error> {
        let agent_id = info.id.clone().expect("readmission carries an id");
        self.agents.reregistering.remove(&agent_id);

        match result {
            Err(RegistryError::Unavailable(msg)) => {
                return Err(Error::RegistryUnavailable(msg))
            }
            Err(other) => {
                warn!(self.logger, "Refusing agent readmission"; "error" => %other);
                connection.send(AgentMessage::Shutdown {
                    message: "agent readmission failed".to_string(),
                });
                return Ok(());
            }
            Ok(_) => {}
        }

        self.agents.recovered.remove(&agent_id);
        self.agents.unreachable.remove(&agent_id);

        let mut agent = Agent::new(info, connection, checkpointed, version, SystemTime::now());
        agent.reregistered_time = Some(SystemTime::now());

        for executor in executors {
            if let Some(framework_id) = executor.framework_id.clone() {
                agent.add_executor(&framework_id, executor);
            }
        }
        for reported in &tasks {
            agent.add_task(Task {
                task_id: reported.task_id.clone(),
                framework_id: reported.framework_id.clone(),
                agent_id: agent_id.clone(),
                executor_id: reported.executor_id.clone(),
                name: reported.task_id.as_str().to_string(),
                state: reported.state,
                resources: reported.resources.clone(),
                latest_status: None,
            });
        }

        // Remember framework descriptors the master has not seen since
        // failover; they re-subscribe on their own schedule.
        for framework_info in frameworks {
            if let Some(framework_id) = framework_info.id.clone() {
                if !self.frameworks.contains(&framework_id) {
                    self.frameworks
                        .recovered
                        .entry(framework_id)
                        .or_insert(framework_info);
                }
            }
        }

        agent.send(AgentMessage::Reregistered {
            agent_id: agent_id.clone(),
        });
        self.add_agent(agent);

        // Index the reported tasks and executors into any frameworks
        // that are already subscribed, and reconcile their records of
        // this agent's unreachable tasks.
        self.link_agent_into_frameworks(&agent_id);
        self.reconcile_unreachable_tasks(&agent_id, &tasks);

        Ok(())
    }

    /// After an agent (re)appears with reported state, mirror its tasks
    /// and executors into registered frameworks' indices.
    fn link_agent_into_frameworks(&mut self, agent_id: &AgentId) {
        let agent = match self.agents.get(agent_id) {
            Some(agent) => agent,
            None => return,
        };

        let mut tasks: Vec<Task> = Vec::new();
        for framework_tasks in agent.tasks.values() {
            tasks.extend(framework_tasks.values().cloned());
        }
        let mut executors: Vec<(FrameworkId, ExecutorId, Resources)> = Vec::new();
        for (framework_id, agent_executors) in &agent.executors {
            for executor in agent_executors.values() {
                executors.push((
                    framework_id.clone(),
                    executor.executor_id.clone(),
                    executor.resources.clone(),
                ));
            }
        }

        for task in tasks {
            if let Some(framework) = self.frameworks.get_mut(&task.framework_id) {
                if !framework.tasks.contains_key(&task.task_id) {
                    framework.add_task(&task);
                }
            }
        }
        for (framework_id, executor_id, resources) in executors {
            if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                let known = framework
                    .executors
                    .get(agent_id)
                    .is_some_and(|e| e.contains(&executor_id));
                if !known {
                    framework.add_executor(agent_id, executor_id, &resources);
                }
            }
        }
    }

    /// A previously unreachable agent returned. Tasks the frameworks
    /// were told were lost but the agent still runs were re-adopted by
    /// the caller; tasks it no longer reports get a kill so nothing
    /// lingers, and either way the unreachable records are settled.
    fn reconcile_unreachable_tasks(&mut self, agent_id: &AgentId, reported: &[RunningTask]) {
        let reported_ids: HashSet<&TaskId> = reported.iter().map(|t| &t.task_id).collect();

        let mut kills: Vec<(FrameworkId, TaskId)> = Vec::new();
        for framework in self.frameworks.iter_mut() {
            let framework_id = framework.id();
            let on_agent: Vec<TaskId> = framework
                .unreachable_tasks
                .iter()
                .filter(|(_, a)| *a == agent_id)
                .map(|(t, _)| t.clone())
                .collect();

            for task_id in on_agent {
                framework.unreachable_tasks.remove(&task_id);
                if !reported_ids.contains(&task_id) {
                    kills.push((framework_id.clone(), task_id));
                }
            }
        }

        if let Some(agent) = self.agents.get(agent_id) {
            for (framework_id, task_id) in kills {
                debug!(self.logger, "Killing task not reported by returned agent";
                    "agent_id" => %agent_id, "task_id" => %task_id);
                agent.send(AgentMessage::KillTask {
                    framework_id,
                    task_id,
                });
            }
        }
    }

    /// Reconcile a re-registering agent the master already knows: the
    /// agent's report is authoritative.
    fn reconcile_known_agent(
        &mut self,
        agent_id: &AgentId,
        _executors: &[ExecutorInfo],
        tasks: &[RunningTask],
    ) {
        let reported: HashMap<(FrameworkId, TaskId), &RunningTask> = tasks
            .iter()
            .map(|task| ((task.framework_id.clone(), task.task_id.clone()), task))
            .collect();

        // Tasks the master knows but the agent no longer reports are
        // gone: surface TASK_LOST and drop them.
        let known: Vec<(FrameworkId, TaskId)> = self
            .agents
            .get(agent_id)
            .map(|agent| {
                agent
                    .all_tasks()
                    .map(|task| (task.framework_id.clone(), task.task_id.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (framework_id, task_id) in &known {
            if !reported.contains_key(&(framework_id.clone(), task_id.clone())) {
                let status = TaskStatus::new(task_id.clone(), TaskState::Lost)
                    .with_agent(agent_id.clone())
                    .with_message("task was not reported by re-registering agent");
                self.transition_and_drop_task(framework_id, agent_id, task_id, status);
            }
        }

        // Adopt reported tasks the master does not know, and take the
        // agent's word on state for the ones it does.
        let mut adopted: Vec<Task> = Vec::new();
        if let Some(agent) = self.agents.get_mut(agent_id) {
            for ((framework_id, task_id), reported_task) in &reported {
                match agent.get_task_mut(framework_id, task_id) {
                    Some(task) => {
                        let was_terminal = task.state.is_terminal();
                        task.state = reported_task.state;
                        if !was_terminal && reported_task.state.is_terminal() {
                            agent.task_terminated(framework_id, task_id);
                        }
                    }
                    None => {
                        let task = Task {
                            task_id: task_id.clone(),
                            framework_id: framework_id.clone(),
                            agent_id: agent_id.clone(),
                            executor_id: reported_task.executor_id.clone(),
                            name: task_id.as_str().to_string(),
                            state: reported_task.state,
                            resources: reported_task.resources.clone(),
                            latest_status: None,
                        };
                        agent.add_task(task.clone());
                        adopted.push(task);
                    }
                }
            }
        }
        for task in adopted {
            if let Some(framework) = self.frameworks.get_mut(&task.framework_id) {
                if !framework.tasks.contains_key(&task.task_id) {
                    framework.add_task(&task);
                }
            }
        }

        // Kills issued while the agent was away are re-sent.
        let pending_kills: Vec<(FrameworkId, TaskId)> = self
            .agents
            .get(agent_id)
            .map(|agent| {
                agent
                    .killed_tasks
                    .iter()
                    .flat_map(|(framework_id, task_ids)| {
                        task_ids
                            .iter()
                            .map(|task_id| (framework_id.clone(), task_id.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(agent) = self.agents.get(agent_id) {
            for (framework_id, task_id) in pending_kills {
                agent.send(AgentMessage::KillTask {
                    framework_id,
                    task_id,
                });
            }
        }
    }

    /// Transition a task to a terminal state, notify its framework, and
    /// drop it from both arenas.
    fn transition_and_drop_task(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        task_id: &TaskId,
        status: TaskStatus,
    ) {
        debug_assert!(status.state.is_terminal());

        let removed = self
            .agents
            .get_mut(agent_id)
            .and_then(|agent| agent.remove_task(framework_id, task_id));

        if let Some(mut task) = removed {
            let was_terminal = task.state.is_terminal();
            task.state = status.state;
            task.latest_status = Some(status.clone());

            if !was_terminal {
                self.allocator.recover_resources(
                    framework_id,
                    agent_id,
                    &task.resources,
                    None,
                );
                self.metrics.tasks_lost += 1;
            }

            if let Some(framework) = self.frameworks.get_mut(framework_id) {
                if !was_terminal {
                    framework.task_terminated(&task);
                }
                framework.tasks.remove(task_id);
                framework.add_completed_task(task.clone());
                framework.send(Event::Update {
                    status: status.clone(),
                });
            }

            self.subscribers.send(MasterEvent::TaskUpdated {
                framework_id: framework_id.clone(),
                status,
            });
        }
    }

    // ---- agent liveness ----

    fn from_agent(&mut self, call: AgentCall) {
        match call {
            AgentCall::Register { .. } | AgentCall::Reregister { .. } => {
                // Registration flows carry a connection and enter
                // through their own mailbox variants.
                warn!(self.logger, "Dropping registration sent through the call path");
            }
            AgentCall::StatusUpdate {
                framework_id,
                update,
            } => self.status_update(framework_id, update),
            AgentCall::ExecutorExited {
                agent_id,
                framework_id,
                executor_id,
                status,
            } => self.executor_exited(agent_id, framework_id, executor_id, status),
            AgentCall::Unregister { agent_id } => {
                if self.agents.contains(&agent_id) && !self.agents.removing.contains(&agent_id) {
                    self.begin_remove_agent(agent_id, "agent unregistered".to_string(), None);
                }
            }
            AgentCall::UpdateTotal { agent_id, total } => {
                let updated = match self.agents.get_mut(&agent_id) {
                    Some(agent) => {
                        agent.total_resources = total.clone();
                        agent.info.resources = total.clone();
                        true
                    }
                    None => false,
                };
                if updated {
                    self.allocator.update_agent(&agent_id, &total);
                }
            }
        }
    }

    fn agent_exited(&mut self, address: Address) {
        let agent_id = match self.agents.id_by_address(&address) {
            Some(id) => id.clone(),
            None => {
                self.auth_tracker.disconnected(&address);
                return;
            }
        };

        info!(self.logger, "Agent disconnected"; "agent_id" => %agent_id);

        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.connected = false;
        }
        self.deactivate_agent(&agent_id);
    }

    /// Deactivate: no new offers, outstanding offers rescinded.
    fn deactivate_agent(&mut self, agent_id: &AgentId) {
        let offers: Vec<OfferId> = match self.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.active = false;
                agent.offers.iter().cloned().collect()
            }
            None => return,
        };

        for offer_id in offers {
            self.rescind_offer(&offer_id, true);
        }

        let inverse: Vec<OfferId> = self
            .agents
            .get(agent_id)
            .map(|agent| agent.inverse_offers.iter().cloned().collect())
            .unwrap_or_default();
        for offer_id in inverse {
            self.rescind_inverse_offer(&offer_id, true);
        }

        self.allocator.deactivate_agent(agent_id);
    }

    fn activate_agent(&mut self, agent_id: &AgentId) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            if !agent.active {
                agent.active = true;
                self.allocator.activate_agent(agent_id);
            }
        }
    }

    // ---- unreachability ----

    fn mark_agent_unreachable(&mut self, agent_id: AgentId) {
        if !self.agents.contains(&agent_id) {
            debug!(self.logger, "Ignoring unreachable transition for unknown agent";
                "agent_id" => %agent_id);
            return;
        }
        if self.agents.marking_unreachable.contains(&agent_id)
            || self.agents.removing.contains(&agent_id)
        {
            return;
        }

        self.agents.marking_unreachable.insert(agent_id.clone());

        // Throttled so a network blip cannot flush the whole cluster
        // out of the registry at once.
        let delay = match self.agents.removal_limiter.as_mut() {
            Some(limiter) => limiter.acquire(Instant::now()),
            None => Duration::ZERO,
        };
        self.post_after(delay, MasterMessage::BeginMarkUnreachable { agent_id });
    }

    fn begin_mark_unreachable(&mut self, agent_id: AgentId) {
        let info = if let Some(agent) = self.agents.get(&agent_id) {
            if agent.connected {
                // The agent came back while we were waiting; stale.
                self.agents.marking_unreachable.remove(&agent_id);
                return;
            }
            agent.info.clone()
        } else if let Some(info) = self.agents.recovered.get(&agent_id) {
            info.clone()
        } else {
            self.agents.marking_unreachable.remove(&agent_id);
            return;
        };

        let since = SystemTime::now();
        info!(self.logger, "Marking agent unreachable"; "agent_id" => %agent_id);
        self.submit_registry(
            RegistryOperation::MarkUnreachable {
                info: info.clone(),
                since,
            },
            move |result| MasterMessage::UnreachableCommitted {
                info,
                since,
                result,
            },
        );
    }

    fn unreachable_committed(
        &mut self,
        info: AgentInfo,
        since: SystemTime,
        result: Result<bool, RegistryError>,
    ) -> Result<(), Error> {
        let agent_id = info.id.clone().expect("unreachable transition carries an id");
        self.agents.marking_unreachable.remove(&agent_id);

        match result {
            Err(RegistryError::Unavailable(msg)) => {
                return Err(Error::RegistryUnavailable(msg))
            }
            Err(conflict) => {
                // The agent was concurrently removed; nothing to do.
                warn!(self.logger, "Unreachable transition conflicted";
                    "agent_id" => %agent_id, "error" => %conflict);
                return Ok(());
            }
            Ok(_) => {}
        }

        self.metrics.agents_marked_unreachable += 1;

        if self.agents.contains(&agent_id) {
            self.remove_agent_from_memory(&agent_id, Some(since));
        } else {
            // Recovered agent that never re-registered.
            self.agents.recovered.remove(&agent_id);
        }

        self.agents.unreachable.insert(agent_id.clone(), since);
        info!(self.logger, "Agent is unreachable"; "agent_id" => %agent_id);
        Ok(())
    }

    /// Tear an agent out of in-memory state. With `unreachable_since`
    /// set, tasks become TASK_LOST and are remembered per framework for
    /// later reconciliation; otherwise the agent is being removed for
    /// good.
    fn remove_agent_from_memory(
        &mut self,
        agent_id: &AgentId,
        unreachable_since: Option<SystemTime>,
    ) {
        let agent = match self.agents.remove(agent_id) {
            Some(agent) => agent,
            None => return,
        };

        // Offers go first so the ledger never points at a missing
        // agent.
        for offer_id in agent.offers.iter() {
            if let Some(offer) = self.offers.take(offer_id) {
                if let Some(framework) = self.frameworks.get_mut(&offer.framework_id) {
                    framework.remove_offer(offer_id, agent_id, &offer.resources);
                    framework.send(Event::Rescind {
                        offer_id: offer_id.clone(),
                    });
                }
            }
        }
        for offer_id in agent.inverse_offers.iter() {
            if let Some(inverse) = self.offers.take_inverse(offer_id) {
                if let Some(framework) = self.frameworks.get_mut(&inverse.framework_id) {
                    framework.inverse_offers.remove(offer_id);
                    framework.send(Event::RescindInverseOffer {
                        offer_id: offer_id.clone(),
                    });
                }
            }
        }

        // Tasks transition to LOST and their frameworks are told.
        for (framework_id, tasks) in &agent.tasks {
            for task in tasks.values() {
                let status = TaskStatus::new(task.task_id.clone(), TaskState::Lost)
                    .with_agent(agent_id.clone())
                    .with_message(if unreachable_since.is_some() {
                        "agent became unreachable"
                    } else {
                        "agent was removed"
                    });

                if let Some(framework) = self.frameworks.get_mut(framework_id) {
                    if task.state.is_terminal() {
                        framework.tasks.remove(&task.task_id);
                        framework.add_completed_task(task.clone());
                    } else {
                        framework.remove_task(task);
                        self.metrics.tasks_lost += 1;
                    }

                    if unreachable_since.is_some() {
                        framework
                            .unreachable_tasks
                            .insert(task.task_id.clone(), agent_id.clone());
                    }

                    framework.send(Event::Update {
                        status: status.clone(),
                    });
                }

                self.subscribers.send(MasterEvent::TaskUpdated {
                    framework_id: framework_id.clone(),
                    status,
                });

                self.pending_acks.remove(&(
                    agent_id.clone(),
                    framework_id.clone(),
                    task.task_id.clone(),
                ));
            }
        }

        // Executors disappear with the agent.
        for (framework_id, executors) in &agent.executors {
            if let Some(framework) = self.frameworks.get_mut(framework_id) {
                for executor in executors.values() {
                    framework.remove_executor(
                        agent_id,
                        &executor.executor_id,
                        &executor.resources,
                    );
                    framework.send(Event::Failure {
                        agent_id: Some(agent_id.clone()),
                        executor_id: Some(executor.executor_id.clone()),
                        status: None,
                    });
                }
            }
        }

        self.allocator.remove_agent(agent_id);
        self.subscribers.send(MasterEvent::AgentRemoved {
            agent_id: agent_id.clone(),
        });
    }

    fn recovered_agents_timeout(&mut self) {
        let stragglers: Vec<AgentId> = self.agents.recovered.keys().cloned().collect();
        if stragglers.is_empty() {
            return;
        }

        warn!(self.logger, "Recovered agents failed to re-register in time";
            "count" => stragglers.len());

        let now = Instant::now();
        for agent_id in stragglers {
            if self.agents.marking_unreachable.contains(&agent_id) {
                continue;
            }
            self.agents.marking_unreachable.insert(agent_id.clone());
            let delay = match self.agents.removal_limiter.as_mut() {
                Some(limiter) => limiter.acquire(now),
                None => Duration::ZERO,
            };
            self.post_after(delay, MasterMessage::BeginMarkUnreachable { agent_id });
        }
    }

    // ---- agent removal ----

    fn begin_remove_agent(
        &mut self,
        agent_id: AgentId,
        reason: String,
        reply: Option<OperatorReply>,
    ) {
        let info = match self.agents.get(&agent_id) {
            Some(agent) => agent.info.clone(),
            None => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(Error::Validation(format!(
                        "agent {} is not registered",
                        agent_id
                    ))));
                }
                return;
            }
        };

        self.agents.removing.insert(agent_id);
        self.submit_registry(
            RegistryOperation::Remove { info: info.clone() },
            move |result| MasterMessage::RemovalCommitted {
                info,
                reason,
                reply,
                result,
            },
        );
    }

    fn removal_committed(
        &mut self,
        info: AgentInfo,
        reason: String,
        reply: Option<OperatorReply>,
        result: Result<bool, RegistryError>,
    ) -> Result<(), Error> {
        let agent_id = info.id.clone().expect("removal carries an id");
        self.agents.removing.remove(&agent_id);

        match result {
            Err(RegistryError::Unavailable(msg)) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(Error::RegistryUnavailable(msg.clone())));
                }
                return Err(Error::RegistryUnavailable(msg));
            }
            Err(conflict) => {
                // A concurrent commit beat us; the agent is gone either
                // way, proceed with the in-memory removal.
                warn!(self.logger, "Agent removal conflicted; proceeding";
                    "agent_id" => %agent_id, "error" => %conflict);
            }
            Ok(_) => {}
        }

        info!(self.logger, "Removed agent"; "agent_id" => %agent_id, "reason" => %reason);

        if let Some(agent) = self.agents.get(&agent_id) {
            agent.send(AgentMessage::Shutdown {
                message: reason.clone(),
            });
        }
        self.remove_agent_from_memory(&agent_id, None);
        self.agents.removed.insert(agent_id);
        self.metrics.agents_removed += 1;

        if let Some(reply) = reply {
            let _ = reply.send(Ok(OperatorResponse::Ack));
        }
        Ok(())
    }

    // ---- registry garbage collection ----

    fn registry_gc(&mut self) {
        if self.agents.unreachable.is_empty() {
            return;
        }

        let now = SystemTime::now();
        let mut entries: Vec<(AgentId, SystemTime)> = self
            .agents
            .unreachable
            .iter()
            .map(|(id, since)| (id.clone(), *since))
            .collect();
        entries.sort_by_key(|(_, since)| *since);

        let mut prune: HashSet<AgentId> = HashSet::new();

        // Count cap: oldest beyond the bound go first.
        if entries.len() > self.config.registry_max_agent_count {
            let excess = entries.len() - self.config.registry_max_agent_count;
            for (id, _) in entries.iter().take(excess) {
                prune.insert(id.clone());
            }
        }

        // Age cap.
        for (id, since) in &entries {
            let age = now.duration_since(*since).unwrap_or_default();
            if age > self.config.registry_max_agent_age {
                prune.insert(id.clone());
            }
        }

        if prune.is_empty() {
            return;
        }

        info!(self.logger, "Pruning unreachable agents"; "count" => prune.len());
        self.submit_registry(
            RegistryOperation::PruneUnreachable { ids: prune.clone() },
            move |result| MasterMessage::PruneCommitted { ids: prune, result },
        );
    }

    fn prune_committed(
        &mut self,
        ids: HashSet<AgentId>,
        result: Result<bool, RegistryError>,
    ) -> Result<(), Error> {
        match result {
            Err(RegistryError::Unavailable(msg)) => Err(Error::RegistryUnavailable(msg)),
            Err(other) => {
                warn!(self.logger, "Unreachable prune failed"; "error" => %other);
                Ok(())
            }
            Ok(_) => {
                for id in &ids {
                    self.agents.unreachable.remove(id);
                }
                Ok(())
            }
        }
    }

    // ---- authentication ----

    fn authenticate(&mut self, address: Address, credential: Credential) {
        let authenticator = match &self.authenticator {
            Some(authenticator) => authenticator.clone(),
            None => {
                debug!(self.logger, "No authenticator configured; ignoring");
                return;
            }
        };

        // A fresh attempt supersedes any in-flight one for the address.
        let generation = self.auth_tracker.begin(address.clone());
        let tx = self.tx.clone();
        let timeout = self.config.authentication_timeout;

        tokio::spawn(async move {
            let result = tokio::time::timeout(
                timeout,
                authenticator.authenticate(&address, &credential),
            )
            .await
            .unwrap_or_else(|_| Err("authentication timed out".to_string()));

            let _ = tx
                .send(MasterMessage::AuthenticateCompleted {
                    address,
                    generation,
                    result,
                })
                .await;
        });
    }

    fn authenticate_completed(
        &mut self,
        address: Address,
        generation: u64,
        result: Result<Option<String>, String>,
    ) {
        match result {
            Ok(principal) => {
                let relevant =
                    self.auth_tracker
                        .complete(&address, generation, principal.clone());
                if relevant {
                    match principal {
                        Some(principal) => {
                            info!(self.logger, "Authenticated endpoint";
                                "address" => %address, "principal" => %principal);
                        }
                        None => {
                            warn!(self.logger, "Authentication rejected"; "address" => %address);
                        }
                    }
                }
            }
            Err(message) => {
                // Transient: clear pending state without recording a
                // principal; the endpoint may retry.
                warn!(self.logger, "Authentication failed";
                    "address" => %address, "error" => %message);
                self.auth_tracker.complete(&address, generation, None);
            }
        }
    }

    // ---- framework subscription ----

    fn subscribe(&mut self, payload: SubscribePayload) {
        let role = payload.info.role.clone();

        if !self.config.role_allowed(&role) {
            let _ = payload.tx.send(Event::Error {
                message: format!("role '{}' is not whitelisted", role),
            });
            return;
        }

        let authenticated = self
            .auth_tracker
            .principal(&payload.address)
            .map(str::to_string);

        if self.config.authentication_required && authenticated.is_none() {
            let _ = payload.tx.send(Event::Error {
                message: "framework is not authenticated".to_string(),
            });
            return;
        }

        if let (Some(claimed), Some(actual)) = (&payload.info.principal, &authenticated) {
            if claimed != actual {
                let _ = payload.tx.send(Event::Error {
                    message: format!(
                        "principal '{}' does not match authenticated principal",
                        claimed
                    ),
                });
                return;
            }
        }

        if let Some(framework_id) = &payload.info.id {
            let torn_down = self
                .frameworks
                .completed
                .iter()
                .any(|completed| completed.info.id.as_ref() == Some(framework_id));
            if torn_down {
                let _ = payload.tx.send(Event::Error {
                    message: format!("framework {} has been torn down", framework_id),
                });
                return;
            }
        }

        let principal = authenticated.or_else(|| payload.info.principal.clone());
        let request = AuthorizationRequest {
            principal,
            action: Action::RegisterFramework { role },
        };

        let authorizer = self.authorizer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = authorizer.authorize(request).await;
            let _ = tx
                .send(MasterMessage::FrameworkAuthorized { payload, result })
                .await;
        });
    }

    fn framework_authorized(
        &mut self,
        payload: SubscribePayload,
        result: Result<bool, AuthorizationError>,
    ) {
        match result {
            Err(failure) => {
                // Transient failure: drop the call without deactivating
                // anything; the framework retries.
                warn!(self.logger, "Dropping subscribe; authorization unavailable";
                    "error" => %failure);
            }
            Ok(false) => {
                let _ = payload.tx.send(Event::Error {
                    message: format!(
                        "framework '{}' is not authorized to register",
                        payload.info.name
                    ),
                });
            }
            Ok(true) => self.install_or_failover_framework(payload),
        }
    }

    fn make_framework_connection(
        &self,
        tx: mpsc::UnboundedSender<Event>,
        streaming: bool,
    ) -> FrameworkConnection {
        if !streaming {
            return FrameworkConnection::Channel { tx };
        }

        let stream_id = Uuid::new_v4();
        let heartbeat_tx = tx.clone();
        let interval = self.config.heartbeat_interval;
        let heartbeater = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Event::Heartbeat).is_err() {
                    break;
                }
            }
        });

        FrameworkConnection::Stream {
            tx,
            stream_id,
            heartbeater,
        }
    }

    fn install_or_failover_framework(&mut self, payload: SubscribePayload) {
        let now = SystemTime::now();
        let authenticated = self
            .auth_tracker
            .principal(&payload.address)
            .map(str::to_string);
        let principal = authenticated.or_else(|| payload.info.principal.clone());

        match payload.info.id.clone() {
            None => {
                let framework_id = self.new_framework_id();
                let mut info = payload.info;
                info.id = Some(framework_id);
                self.install_framework(info, payload.tx, payload.streaming, principal, now);
            }
            Some(framework_id) => {
                if self.frameworks.contains(&framework_id) {
                    self.failover_framework(framework_id, payload, now);
                } else if let Some(recovered) =
                    self.frameworks.recovered.remove(&framework_id)
                {
                    // Re-subscription after a master failover: merge the
                    // mutable fields onto the recovered descriptor.
                    let mut info = recovered;
                    info.merge(&payload.info);
                    self.install_framework(info, payload.tx, payload.streaming, principal, now);
                } else {
                    let _ = payload.tx.send(Event::Error {
                        message: format!("framework {} is not known to the master", framework_id),
                    });
                }
            }
        }
    }

    fn install_framework(
        &mut self,
        info: FrameworkInfo,
        tx: mpsc::UnboundedSender<Event>,
        streaming: bool,
        principal: Option<String>,
        now: SystemTime,
    ) {
        let framework_id = info.id.clone().expect("id assigned before install");
        let connection = self.make_framework_connection(tx, streaming);
        let framework = Framework::new(
            info,
            connection,
            principal,
            self.config.max_completed_tasks_per_framework,
            now,
        );

        info!(self.logger, "Subscribed framework";
            "framework_id" => %framework_id,
            "name" => %framework.info.name,
            "role" => framework.role()
        );

        if self.roles.add_framework(framework.role(), framework_id.clone()) {
            self.allocator.add_role(framework.role());
        }

        self.frameworks.put(framework);
        // Pick up any tasks and executors agents already reported for
        // this framework (re-subscription after master failover).
        let agent_ids: Vec<AgentId> =
            self.agents.iter().map(|agent| agent.id.clone()).collect();
        for agent_id in agent_ids {
            self.link_agent_into_frameworks(&agent_id);
        }

        let framework = self
            .frameworks
            .get(&framework_id)
            .expect("installed just above");
        let used = framework.used_resources.clone();
        let info = framework.info.clone();

        framework.send(Event::Subscribed {
            framework_id: framework_id.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
        });

        self.allocator
            .add_framework(&framework_id, &info, used, true);

        self.subscribers.send(MasterEvent::FrameworkAdded {
            framework_id,
            info,
        });
    }

    fn failover_framework(
        &mut self,
        framework_id: FrameworkId,
        payload: SubscribePayload,
        now: SystemTime,
    ) {
        let connection = self.make_framework_connection(payload.tx, payload.streaming);
        let was_active;
        let info;
        {
            let framework = self
                .frameworks
                .get_mut(&framework_id)
                .expect("caller checked registration");
            framework.info.merge(&payload.info);
            framework.update_connection(connection, now);
            was_active = framework.active;
            framework.active = true;
            info = framework.info.clone();

            framework.send(Event::Subscribed {
                framework_id: framework_id.clone(),
                heartbeat_interval: self.config.heartbeat_interval,
            });
        }

        info!(self.logger, "Framework failed over"; "framework_id" => %framework_id);

        if !was_active {
            self.allocator.activate_framework(&framework_id);
        }

        self.subscribers.send(MasterEvent::FrameworkUpdated {
            framework_id,
            info,
        });
    }

    fn framework_exited(&mut self, framework_id: FrameworkId) {
        let (failover, generation) = match self.frameworks.get_mut(&framework_id) {
            Some(framework) => {
                if !framework.connected {
                    return;
                }
                framework.disconnected();
                framework.active = false;
                (
                    framework.failover_timeout(&self.config),
                    framework.generation,
                )
            }
            None => return,
        };

        info!(self.logger, "Framework disconnected";
            "framework_id" => %framework_id,
            "failover_timeout_secs" => failover.as_secs()
        );

        // Outstanding offers are rescinded; tasks keep running through
        // the failover window.
        let offers: Vec<OfferId> = self
            .frameworks
            .get(&framework_id)
            .map(|framework| framework.offers.iter().cloned().collect())
            .unwrap_or_default();
        for offer_id in offers {
            self.rescind_offer(&offer_id, false);
        }

        self.allocator.deactivate_framework(&framework_id);

        self.post_after(
            failover,
            MasterMessage::FrameworkFailoverTimeout {
                framework_id,
                generation,
            },
        );
    }

    fn framework_failover_timeout(&mut self, framework_id: FrameworkId, generation: u64) {
        let expired = self
            .frameworks
            .get(&framework_id)
            .map(|framework| !framework.connected && framework.generation == generation)
            .unwrap_or(false);

        if expired {
            info!(self.logger, "Framework failover timed out"; "framework_id" => %framework_id);
            self.remove_framework(&framework_id);
        }
    }

    /// Tear a framework down entirely.
    fn remove_framework(&mut self, framework_id: &FrameworkId) {
        let framework = match self.frameworks.remove(framework_id) {
            Some(framework) => framework,
            None => return,
        };

        info!(self.logger, "Removing framework"; "framework_id" => %framework_id);

        // Kill every task on every agent.
        for (task_id, agent_id) in &framework.tasks {
            let removed = match self.agents.get_mut(agent_id) {
                Some(agent) => {
                    agent.send(AgentMessage::KillTask {
                        framework_id: framework_id.clone(),
                        task_id: task_id.clone(),
                    });
                    agent.remove_task(framework_id, task_id)
                }
                None => None,
            };

            if let Some(task) = removed {
                if !task.state.is_terminal() {
                    self.allocator.recover_resources(
                        framework_id,
                        agent_id,
                        &task.resources,
                        None,
                    );
                }
                self.pending_acks.remove(&(
                    agent_id.clone(),
                    framework_id.clone(),
                    task_id.clone(),
                ));
            }
        }

        // Executors too.
        for (agent_id, executor_ids) in &framework.executors {
            for executor_id in executor_ids {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.send(AgentMessage::ShutdownExecutor {
                        framework_id: framework_id.clone(),
                        executor_id: executor_id.clone(),
                    });
                    if let Some(executor) = agent.remove_executor(framework_id, executor_id) {
                        self.allocator.recover_resources(
                            framework_id,
                            agent_id,
                            &executor.resources,
                            None,
                        );
                    }
                }
            }
        }

        // Outstanding offers come back.
        for offer_id in framework.offers.iter() {
            if let Some(offer) = self.offers.take(offer_id) {
                if let Some(agent) = self.agents.get_mut(&offer.agent_id) {
                    agent.remove_offer(offer_id, &offer.resources);
                }
                self.allocator.recover_resources(
                    framework_id,
                    &offer.agent_id,
                    &offer.resources,
                    None,
                );
            }
        }
        for offer_id in framework.inverse_offers.iter() {
            if let Some(inverse) = self.offers.take_inverse(offer_id) {
                if let Some(agent) = self.agents.get_mut(&inverse.agent_id) {
                    agent.inverse_offers.remove(offer_id);
                }
            }
        }

        if self.roles.remove_framework(framework.role(), framework_id) {
            self.allocator.remove_role(framework.role());
        }
        self.allocator.remove_framework(framework_id);

        self.frameworks.complete(framework, SystemTime::now());
        self.metrics.frameworks_removed += 1;

        self.subscribers.send(MasterEvent::FrameworkRemoved {
            framework_id: framework_id.clone(),
        });
    }

    // ---- scheduler call dispatch ----

    fn scheduler_call(&mut self, framework_id: FrameworkId, call: Call) {
        if !self.frameworks.contains(&framework_id) {
            debug!(self.logger, "Dropping call from unknown framework";
                "framework_id" => %framework_id, "call" => call.kind());
            return;
        }

        let principal = self
            .frameworks
            .get(&framework_id)
            .and_then(|framework| framework.principal.clone());

        let admission = match self
            .frameworks
            .limiter_for(principal.as_deref(), &self.config)
        {
            Some(limiter) => limiter.admit(Instant::now()),
            None => Admission::Admit,
        };

        match admission {
            Admission::Admit => self.process_call(framework_id, call),
            Admission::Defer(delay) => {
                self.metrics.messages_throttled += 1;
                self.post_after(
                    delay,
                    MasterMessage::ThrottledRelease {
                        principal,
                        framework_id,
                        call,
                    },
                );
            }
            Admission::Drop => {
                self.metrics.messages_dropped_capacity += 1;
                warn!(self.logger, "Dropping call; principal exceeded capacity";
                    "framework_id" => %framework_id,
                    "principal" => principal.as_deref().unwrap_or("<none>"),
                    "call" => call.kind()
                );
                if let Some(framework) = self.frameworks.get(&framework_id) {
                    framework.send(Event::Error {
                        message: format!(
                            "call {} dropped: rate limit capacity exceeded",
                            call.kind()
                        ),
                    });
                }
            }
        }
    }

    fn throttled_release(
        &mut self,
        principal: Option<String>,
        framework_id: FrameworkId,
        call: Call,
    ) {
        if let Some(limiter) = self
            .frameworks
            .limiter_for(principal.as_deref(), &self.config)
        {
            limiter.released();
        }

        // The framework may be gone by now; process_call re-validates.
        if self.frameworks.contains(&framework_id) {
            self.process_call(framework_id, call);
        }
    }

    fn process_call(&mut self, framework_id: FrameworkId, call: Call) {
        match call {
            Call::Teardown => self.remove_framework(&framework_id),
            Call::Accept {
                offer_ids,
                operations,
                filters,
            } => self.accept(framework_id, offer_ids, operations, filters),
            Call::Decline { offer_ids, filters } => {
                // Decline is accept with no operations.
                self.accept(framework_id, offer_ids, Vec::new(), filters)
            }
            Call::AcceptInverseOffers { offer_ids } => {
                self.settle_inverse_offers(framework_id, offer_ids)
            }
            Call::DeclineInverseOffers { offer_ids, .. } => {
                self.settle_inverse_offers(framework_id, offer_ids)
            }
            Call::Revive => self.allocator.revive_offers(&framework_id),
            Call::Suppress => self.allocator.suppress_offers(&framework_id),
            Call::Kill { task_id, agent_id } => self.kill_task(framework_id, task_id, agent_id),
            Call::Shutdown {
                executor_id,
                agent_id,
            } => {
                if let Some(agent) = self.agents.get(&agent_id) {
                    if agent.has_executor(&framework_id, &executor_id) {
                        agent.send(AgentMessage::ShutdownExecutor {
                            framework_id,
                            executor_id,
                        });
                    }
                }
            }
            Call::Acknowledge {
                agent_id,
                task_id,
                uuid,
            } => self.acknowledge(framework_id, agent_id, task_id, uuid),
            Call::Reconcile { tasks } => self.reconcile(framework_id, tasks),
            Call::Message {
                agent_id,
                executor_id,
                data,
            } => {
                if let Some(agent) = self.agents.get(&agent_id) {
                    agent.send(AgentMessage::FrameworkToExecutor {
                        framework_id,
                        executor_id,
                        data,
                    });
                }
            }
            Call::Request { resources } => {
                self.allocator.request_resources(&framework_id, &resources)
            }
        }
    }

    // ---- the offer/accept pipeline ----

    /// Validate and consume the referenced offers, then suspend on
    /// authorization of the operations.
    fn accept(
        &mut self,
        framework_id: FrameworkId,
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
        filters: Filters,
    ) {
        // Validation first: all offers must exist, belong to this
        // framework, and sit on one agent. Any failure refuses the
        // whole call with no state change.
        let mut agent_id: Option<AgentId> = None;
        let mut failure: Option<String> = None;

        if offer_ids.is_empty() {
            failure = Some("accept references no offers".to_string());
        }

        for offer_id in &offer_ids {
            match self.offers.get(offer_id) {
                None => {
                    failure = Some(format!("offer {} is no longer valid", offer_id));
                    break;
                }
                Some(offer) => {
                    if offer.framework_id != framework_id {
                        failure = Some(format!("offer {} belongs to another framework", offer_id));
                        break;
                    }
                    match &agent_id {
                        None => agent_id = Some(offer.agent_id.clone()),
                        Some(agent_id) if *agent_id != offer.agent_id => {
                            failure =
                                Some("offers in one accept must share an agent".to_string());
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        if let Some(message) = failure {
            warn!(self.logger, "Refusing accept"; "framework_id" => %framework_id,
                "reason" => %message);
            if let Some(framework) = self.frameworks.get(&framework_id) {
                framework.send(Event::Error { message });
            }
            return;
        }

        let agent_id = agent_id.expect("validated above");

        // Consume the offers up front; whoever removed them first would
        // have failed validation above.
        let mut offered = Resources::new();
        for offer_id in &offer_ids {
            if let Some(offer) = self.remove_offer(offer_id) {
                offered.add_all(&offer.resources);
            }
        }

        if operations.is_empty() {
            // Plain decline: everything goes straight back.
            self.allocator
                .recover_resources(&framework_id, &agent_id, &offered, Some(&filters));
            return;
        }

        // Authorization runs off-actor; results are applied in the
        // operation order regardless of completion order.
        let requests: Vec<AuthorizationRequest> = {
            let framework = self
                .frameworks
                .get(&framework_id)
                .expect("caller checked registration");
            operations
                .iter()
                .map(|operation| authorization_request_for(framework, operation))
                .collect()
        };

        let authorizer = self.authorizer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let pending = requests
                .into_iter()
                .map(|request| authorizer.authorize(request));
            let decisions = futures::future::join_all(pending).await;
            let _ = tx
                .send(MasterMessage::AcceptReady {
                    framework_id,
                    agent_id,
                    offered,
                    operations,
                    filters,
                    decisions,
                })
                .await;
        });
    }

    /// Continuation of `accept` after authorization: apply operations
    /// in their original order against the offered bundle.
    fn accept_ready(
        &mut self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        mut offered: Resources,
        operations: Vec<Operation>,
        filters: Filters,
        decisions: Vec<Result<bool, AuthorizationError>>,
    ) {
        // The world may have changed while authorization ran.
        if !self.agents.contains(&agent_id) {
            // Agent is gone: launches become lost tasks, and there is
            // no agent to return resources to.
            for operation in &operations {
                self.fail_launches(
                    &framework_id,
                    &agent_id,
                    operation,
                    TaskState::Lost,
                    "agent was removed before the operation applied",
                );
            }
            return;
        }
        if !self.frameworks.contains(&framework_id) {
            self.allocator
                .recover_resources(&framework_id, &agent_id, &offered, None);
            return;
        }

        for (operation, decision) in operations.into_iter().zip(decisions) {
            let granted = match decision {
                Ok(true) => true,
                Ok(false) => {
                    // Denials surface per task for launches and are
                    // quietly discarded for resource operations.
                    self.fail_launches(
                        &framework_id,
                        &agent_id,
                        &operation,
                        TaskState::Failed,
                        "operation was not authorized",
                    );
                    false
                }
                Err(failure) => {
                    warn!(self.logger, "Authorization unavailable for operation";
                        "kind" => operation.kind(), "error" => %failure);
                    self.fail_launches(
                        &framework_id,
                        &agent_id,
                        &operation,
                        TaskState::Failed,
                        "authorization was unavailable",
                    );
                    false
                }
            };

            if !granted {
                continue;
            }

            match &operation {
                Operation::Reserve { .. }
                | Operation::Unreserve { .. }
                | Operation::Create { .. }
                | Operation::Destroy { .. } => {
                    match offered.apply(&operation) {
                        Ok(remaining) => {
                            offered = remaining;
                            self.apply_resource_operation(&agent_id, &framework_id, &operation);
                        }
                        Err(error) => {
                            warn!(self.logger, "Dropping invalid operation";
                                "kind" => operation.kind(), "error" => %error);
                            if let Some(framework) = self.frameworks.get(&framework_id) {
                                framework.send(Event::Error {
                                    message: format!(
                                        "{} failed: {}",
                                        operation.kind(),
                                        error
                                    ),
                                });
                            }
                        }
                    }
                }
                Operation::Launch { tasks } => {
                    for task in tasks {
                        self.launch_task(&framework_id, &agent_id, task, &mut offered);
                    }
                }
                Operation::LaunchGroup { executor, tasks } => {
                    self.launch_group(&framework_id, &agent_id, executor, tasks, &mut offered);
                }
            }
        }

        // Leftovers go back with the framework's filters attached.
        if !offered.is_empty() {
            self.allocator
                .recover_resources(&framework_id, &agent_id, &offered, Some(&filters));
        }
    }

    /// Surface a task-level terminal status for every task a launch
    /// operation would have started.
    fn fail_launches(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        operation: &Operation,
        state: TaskState,
        message: &str,
    ) {
        let tasks: Vec<&TaskInfo> = match operation {
            Operation::Launch { tasks } => tasks.iter().collect(),
            Operation::LaunchGroup { tasks, .. } => tasks.iter().collect(),
            _ => return,
        };

        for task in tasks {
            let status = TaskStatus::new(task.task_id.clone(), state)
                .with_agent(agent_id.clone())
                .with_message(message);
            if let Some(framework) = self.frameworks.get(framework_id) {
                framework.send(Event::Update { status });
            }
        }
    }

    /// Apply a granted resource operation to the agent's view and
    /// notify everyone who needs to know. The agent checkpoint is
    /// believed effective immediately; there is no confirmation path.
    fn apply_resource_operation(
        &mut self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        operation: &Operation,
    ) {
        let checkpointed = match self.agents.get_mut(agent_id) {
            Some(agent) => match agent.apply_operation(operation) {
                Ok(()) => {
                    agent.send(AgentMessage::CheckpointResources {
                        checkpointed: agent.checkpointed_resources.clone(),
                    });
                    Some(agent.checkpointed_resources.clone())
                }
                Err(error) => {
                    // The offered bundle covered the operation but the
                    // agent view does not: accounting drift. Loudly.
                    error!(self.logger, "Operation applied to offer but not to agent";
                        "agent_id" => %agent_id, "kind" => operation.kind(),
                        "error" => %error);
                    None
                }
            },
            None => None,
        };

        if checkpointed.is_some() {
            self.allocator.update_allocation(
                framework_id,
                agent_id,
                std::slice::from_ref(operation),
            );
        }
    }

    /// Launch one task against the remaining offered bundle.
    fn launch_task(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        task_info: &TaskInfo,
        offered: &mut Resources,
    ) {
        // Total footprint includes the executor when it is not yet
        // running on the agent.
        let new_executor: Option<ExecutorInfo> = {
            let agent = self.agents.get(agent_id).expect("agent checked by caller");
            task_info
                .executor
                .clone()
                .filter(|executor| !agent.has_executor(framework_id, &executor.executor_id))
        };

        let mut needed = task_info.resources.clone();
        if let Some(executor) = &new_executor {
            needed.add_all(&executor.resources);
        }

        if !offered.contains(&needed) {
            let status = TaskStatus::new(task_info.task_id.clone(), TaskState::Failed)
                .with_agent(agent_id.clone())
                .with_message("task resources exceed the offered resources");
            if let Some(framework) = self.frameworks.get(framework_id) {
                framework.send(Event::Update { status });
            }
            return;
        }

        *offered = offered
            .minus(&needed)
            .expect("containment checked just above");

        let task = Task::from_info(task_info, framework_id.clone(), agent_id.clone());

        {
            let agent = self
                .agents
                .get_mut(agent_id)
                .expect("agent checked by caller");
            if let Some(executor) = &new_executor {
                let mut executor = executor.clone();
                executor.framework_id = Some(framework_id.clone());
                agent.add_executor(framework_id, executor);
            }
            agent.add_task(task.clone());
        }

        let framework_info = {
            let framework = self
                .frameworks
                .get_mut(framework_id)
                .expect("framework checked by caller");
            if let Some(executor) = &new_executor {
                framework.add_executor(agent_id, executor.executor_id.clone(), &executor.resources);
            }
            framework.add_task(&task);
            framework.info.clone()
        };

        let agent = self.agents.get(agent_id).expect("agent checked by caller");
        agent.send(AgentMessage::RunTask {
            framework_id: framework_id.clone(),
            framework: framework_info,
            task: task_info.clone(),
        });

        self.metrics.tasks_launched += 1;
        self.subscribers.send(MasterEvent::TaskAdded {
            framework_id: framework_id.clone(),
            agent_id: agent_id.clone(),
            task_id: task.task_id.clone(),
            state: task.state,
        });

        debug!(self.logger, "Launched task";
            "task_id" => %task.task_id,
            "framework_id" => %framework_id,
            "agent_id" => %agent_id
        );
    }

    /// Launch a task group atomically: either every task fits alongside
    /// its executor, or none launch.
    fn launch_group(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        executor: &ExecutorInfo,
        tasks: &[TaskInfo],
        offered: &mut Resources,
    ) {
        let executor_is_new = {
            let agent = self.agents.get(agent_id).expect("agent checked by caller");
            !agent.has_executor(framework_id, &executor.executor_id)
        };

        let mut needed = Resources::new();
        if executor_is_new {
            needed.add_all(&executor.resources);
        }
        for task in tasks {
            needed.add_all(&task.resources);
        }

        if !offered.contains(&needed) {
            for task in tasks {
                let status = TaskStatus::new(task.task_id.clone(), TaskState::Failed)
                    .with_agent(agent_id.clone())
                    .with_message("task group resources exceed the offered resources");
                if let Some(framework) = self.frameworks.get(framework_id) {
                    framework.send(Event::Update { status });
                }
            }
            return;
        }

        for task in tasks {
            let mut task = task.clone();
            task.executor = Some(executor.clone());
            self.launch_task(framework_id, agent_id, &task, offered);
        }
    }

    // ---- offers ----

    fn allocation(&mut self, event: AllocationEvent) {
        match event {
            AllocationEvent::Offer(allocation) => {
                self.offer(allocation.framework_id, allocation.resources)
            }
            AllocationEvent::InverseOffer(inverse) => self.inverse_offer(
                inverse.framework_id,
                inverse.agent_id,
                inverse.unavailability,
                inverse.resources,
            ),
        }
    }

    /// The allocator proposed offers for one framework.
    fn offer(&mut self, framework_id: FrameworkId, resources: HashMap<AgentId, Resources>) {
        let framework_active = self
            .frameworks
            .get(&framework_id)
            .map(|framework| framework.active)
            .unwrap_or(false);

        let mut offers: Vec<Offer> = Vec::new();

        for (agent_id, bundle) in resources {
            let agent_ok = self
                .agents
                .get(&agent_id)
                .map(|agent| agent.active)
                .unwrap_or(false);

            if !framework_active || !agent_ok {
                // Whoever is missing or inactive, the resources go
                // straight back.
                self.allocator
                    .recover_resources(&framework_id, &agent_id, &bundle, None);
                continue;
            }

            let offer_id = self.new_offer_id();
            let agent = self.agents.get_mut(&agent_id).expect("checked just above");
            let offer = Offer {
                offer_id: offer_id.clone(),
                framework_id: framework_id.clone(),
                agent_id: agent_id.clone(),
                hostname: agent.info.hostname.clone(),
                resources: bundle.clone(),
                unavailability: self.maintenance.unavailability(&agent.machine),
            };

            agent.add_offer(offer_id.clone(), &bundle);
            let framework = self
                .frameworks
                .get_mut(&framework_id)
                .expect("framework checked above");
            framework.add_offer(offer_id.clone(), &agent_id, &bundle);

            let timer = self.config.offer_timeout.map(|timeout| {
                let tx = self.tx.clone();
                let offer_id = offer_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx.send(MasterMessage::OfferExpired { offer_id }).await;
                })
            });

            self.offers.insert(offer.clone(), timer);
            offers.push(offer);
        }

        if offers.is_empty() {
            return;
        }

        debug!(self.logger, "Sending offers";
            "framework_id" => %framework_id, "count" => offers.len());

        if let Some(framework) = self.frameworks.get(&framework_id) {
            framework.send(Event::Offers { offers });
        }
    }

    fn inverse_offer(
        &mut self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        unavailability: crate::messages::Unavailability,
        resources: Resources,
    ) {
        if !self.frameworks.contains(&framework_id) || !self.agents.contains(&agent_id) {
            return;
        }

        let offer_id = self.new_offer_id();
        let inverse = InverseOffer {
            offer_id: offer_id.clone(),
            framework_id: framework_id.clone(),
            agent_id: agent_id.clone(),
            unavailability,
            resources,
        };

        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.inverse_offers.insert(offer_id.clone());
        }
        let timer = self.config.offer_timeout.map(|timeout| {
            let tx = self.tx.clone();
            let offer_id = offer_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx
                    .send(MasterMessage::InverseOfferExpired { offer_id })
                    .await;
            })
        });

        let framework = self
            .frameworks
            .get_mut(&framework_id)
            .expect("checked above");
        framework.inverse_offers.insert(offer_id.clone());

        self.offers.insert_inverse(inverse.clone(), timer);

        framework.send(Event::InverseOffers {
            inverse_offers: vec![inverse],
        });
    }

    /// The single path an offer leaves the ledger and both offer sets.
    /// Returns the offer for the caller to decide what happens to its
    /// resources.
    fn remove_offer(&mut self, offer_id: &OfferId) -> Option<Offer> {
        let offer = self.offers.take(offer_id)?;

        if let Some(agent) = self.agents.get_mut(&offer.agent_id) {
            agent.remove_offer(offer_id, &offer.resources);
        }
        if let Some(framework) = self.frameworks.get_mut(&offer.framework_id) {
            framework.remove_offer(offer_id, &offer.agent_id, &offer.resources);
        }

        Some(offer)
    }

    /// Remove an offer, optionally telling the framework, and return
    /// its resources to the allocator.
    fn rescind_offer(&mut self, offer_id: &OfferId, rescind: bool) {
        if let Some(offer) = self.remove_offer(offer_id) {
            if rescind {
                if let Some(framework) = self.frameworks.get(&offer.framework_id) {
                    framework.send(Event::Rescind {
                        offer_id: offer_id.clone(),
                    });
                }
            }
            self.allocator.recover_resources(
                &offer.framework_id,
                &offer.agent_id,
                &offer.resources,
                None,
            );
        }
    }

    fn rescind_inverse_offer(&mut self, offer_id: &OfferId, rescind: bool) {
        if let Some(inverse) = self.offers.take_inverse(offer_id) {
            if let Some(agent) = self.agents.get_mut(&inverse.agent_id) {
                agent.inverse_offers.remove(offer_id);
            }
            if let Some(framework) = self.frameworks.get_mut(&inverse.framework_id) {
                framework.inverse_offers.remove(offer_id);
                if rescind {
                    framework.send(Event::RescindInverseOffer {
                        offer_id: offer_id.clone(),
                    });
                }
            }
        }
    }

    fn settle_inverse_offers(&mut self, framework_id: FrameworkId, offer_ids: Vec<OfferId>) {
        for offer_id in offer_ids {
            let valid = self
                .offers
                .get_inverse(&offer_id)
                .map(|inverse| inverse.framework_id == framework_id)
                .unwrap_or(false);
            if valid {
                self.rescind_inverse_offer(&offer_id, false);
            }
        }
    }

    fn offer_expired(&mut self, offer_id: OfferId) {
        // Accept may have raced the timer; remove_offer decides the
        // winner.
        self.rescind_offer(&offer_id, true);
    }

    fn inverse_offer_expired(&mut self, offer_id: OfferId) {
        self.rescind_inverse_offer(&offer_id, true);
    }

    // ---- kill, status updates, acknowledgements, reconciliation ----

    fn kill_task(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        agent_id: Option<AgentId>,
    ) {
        // Pending (still authorizing) tasks are killed by forgetting
        // them before launch.
        let was_pending = self
            .frameworks
            .get_mut(&framework_id)
            .map(|framework| framework.pending_tasks.remove(&task_id).is_some())
            .unwrap_or(false);
        if was_pending {
            let status = TaskStatus::new(task_id, TaskState::Killed)
                .with_message("task killed before it was launched");
            if let Some(framework) = self.frameworks.get(&framework_id) {
                framework.send(Event::Update { status });
            }
            return;
        }

        let located = self
            .frameworks
            .get(&framework_id)
            .and_then(|framework| framework.tasks.get(&task_id).cloned());

        match located {
            Some(agent_id) => {
                let connected = self
                    .agents
                    .get(&agent_id)
                    .map(|agent| agent.connected)
                    .unwrap_or(false);

                if let Some(agent) = self.agents.get_mut(&agent_id) {
                    agent
                        .killed_tasks
                        .entry(framework_id.clone())
                        .or_default()
                        .insert(task_id.clone());
                    if connected {
                        agent.send(AgentMessage::KillTask {
                            framework_id: framework_id.clone(),
                            task_id: task_id.clone(),
                        });
                    } else {
                        // The kill is retried when the agent returns.
                        info!(self.logger, "Agent disconnected; kill deferred";
                            "agent_id" => %agent_id, "task_id" => %task_id);
                    }
                }
            }
            None => {
                let unreachable = self
                    .frameworks
                    .get(&framework_id)
                    .map(|framework| framework.unreachable_tasks.contains_key(&task_id))
                    .unwrap_or(false);

                let state = if unreachable {
                    TaskState::Unreachable
                } else {
                    TaskState::Lost
                };
                let mut status = TaskStatus::new(task_id, state)
                    .with_message("the master does not run this task");
                status.agent_id = agent_id;
                if let Some(framework) = self.frameworks.get(&framework_id) {
                    framework.send(Event::Update { status });
                }
            }
        }
    }

    fn status_update(&mut self, framework_id: FrameworkId, update: TaskStatus) {
        let agent_id = match update.agent_id.clone() {
            Some(agent_id) => agent_id,
            None => {
                warn!(self.logger, "Dropping status update without an agent id";
                    "task_id" => %update.task_id);
                self.metrics.invalid_status_updates += 1;
                return;
            }
        };

        if !self.agents.contains(&agent_id) {
            warn!(self.logger, "Status update from unknown agent";
                "agent_id" => %agent_id, "task_id" => %update.task_id);
            self.metrics.invalid_status_updates += 1;
            return;
        }

        let known_task = {
            let agent = self.agents.get_mut(&agent_id).expect("checked above");
            match agent.get_task_mut(&framework_id, &update.task_id) {
                Some(task) => {
                    let was_terminal = task.state.is_terminal();
                    task.state = update.state;
                    task.latest_status = Some(update.clone());
                    let resources = task.resources.clone();

                    if !was_terminal && update.state.is_terminal() {
                        agent.task_terminated(&framework_id, &update.task_id);
                        Some((true, resources))
                    } else {
                        Some((false, resources))
                    }
                }
                None => None,
            }
        };

        match known_task {
            Some((became_terminal, resources)) => {
                self.metrics.valid_status_updates += 1;
                if became_terminal {
                    if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                        let terminal_task = Task {
                            task_id: update.task_id.clone(),
                            framework_id: framework_id.clone(),
                            agent_id: agent_id.clone(),
                            executor_id: update.executor_id.clone(),
                            name: update.task_id.as_str().to_string(),
                            state: update.state,
                            resources: resources.clone(),
                            latest_status: Some(update.clone()),
                        };
                        framework.task_terminated(&terminal_task);
                    }
                    self.allocator.recover_resources(
                        &framework_id,
                        &agent_id,
                        &resources,
                        None,
                    );
                }
            }
            None => {
                // Unknown task: forwarded anyway so stragglers can
                // observe terminal states.
                warn!(self.logger, "Status update for unknown task";
                    "task_id" => %update.task_id, "agent_id" => %agent_id);
                self.metrics.invalid_status_updates += 1;
            }
        }

        if let Some(framework) = self.frameworks.get(&framework_id) {
            framework.send(Event::Update {
                status: update.clone(),
            });
        }

        if let Some(uuid) = update.uuid {
            self.pending_acks
                .entry((agent_id, framework_id.clone(), update.task_id.clone()))
                .or_default()
                .push(uuid);
        }

        self.subscribers.send(MasterEvent::TaskUpdated {
            framework_id,
            status: update,
        });
    }

    fn acknowledge(
        &mut self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        task_id: TaskId,
        uuid: Uuid,
    ) {
        let key = (agent_id.clone(), framework_id.clone(), task_id.clone());

        let known = match self.pending_acks.get_mut(&key) {
            Some(uuids) => {
                if let Some(index) = uuids.iter().position(|pending| *pending == uuid) {
                    uuids.remove(index);
                    if uuids.is_empty() {
                        self.pending_acks.remove(&key);
                    }
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if !known {
            warn!(self.logger, "Acknowledgement for unknown status update";
                "task_id" => %task_id, "uuid" => %uuid);
            return;
        }

        if let Some(agent) = self.agents.get(&agent_id) {
            agent.send(AgentMessage::StatusUpdateAcknowledgement {
                framework_id: framework_id.clone(),
                task_id: task_id.clone(),
                uuid,
            });
        }

        // Terminal tasks are retained only until acknowledged.
        let fully_acked = !self.pending_acks.contains_key(&key);
        let terminal = self
            .agents
            .get(&agent_id)
            .and_then(|agent| agent.get_task(&framework_id, &task_id))
            .map(|task| task.state.is_terminal())
            .unwrap_or(false);

        if terminal && fully_acked {
            let removed = self
                .agents
                .get_mut(&agent_id)
                .and_then(|agent| agent.remove_task(&framework_id, &task_id));
            if let Some(task) = removed {
                if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                    framework.tasks.remove(&task_id);
                    framework.add_completed_task(task);
                }
            }
        }
    }

    fn executor_exited(
        &mut self,
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    ) {
        let removed = self
            .agents
            .get_mut(&agent_id)
            .and_then(|agent| agent.remove_executor(&framework_id, &executor_id));

        if let Some(executor) = removed {
            if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                framework.remove_executor(&agent_id, &executor_id, &executor.resources);
                framework.send(Event::Failure {
                    agent_id: Some(agent_id.clone()),
                    executor_id: Some(executor_id.clone()),
                    status: Some(status),
                });
            }
            self.allocator.recover_resources(
                &framework_id,
                &agent_id,
                &executor.resources,
                None,
            );
        }
    }

    fn reconcile(&mut self, framework_id: FrameworkId, tasks: Vec<ReconcileTask>) {
        let framework = match self.frameworks.get(&framework_id) {
            Some(framework) => framework,
            None => return,
        };

        let mut statuses: Vec<TaskStatus> = Vec::new();

        if tasks.is_empty() {
            // Implicit: the latest state of every known task.
            for (task_id, agent_id) in &framework.tasks {
                if let Some(task) = self
                    .agents
                    .get(agent_id)
                    .and_then(|agent| agent.get_task(&framework_id, task_id))
                {
                    statuses.push(
                        TaskStatus::new(task_id.clone(), task.state)
                            .with_agent(agent_id.clone())
                            .with_message("reconciliation: latest known state"),
                    );
                }
            }
            for task_id in framework.pending_tasks.keys() {
                statuses.push(
                    TaskStatus::new(task_id.clone(), TaskState::Staging)
                        .with_message("reconciliation: task is being authorized"),
                );
            }
            for (task_id, agent_id) in &framework.unreachable_tasks {
                statuses.push(
                    TaskStatus::new(task_id.clone(), TaskState::Unreachable)
                        .with_agent(agent_id.clone())
                        .with_message("reconciliation: agent is unreachable"),
                );
            }
        } else {
            // Explicit: answer exactly what was asked.
            for asked in tasks {
                if framework.pending_tasks.contains_key(&asked.task_id) {
                    statuses.push(
                        TaskStatus::new(asked.task_id, TaskState::Staging)
                            .with_message("reconciliation: task is being authorized"),
                    );
                } else if let Some(agent_id) = framework.tasks.get(&asked.task_id) {
                    if let Some(task) = self
                        .agents
                        .get(agent_id)
                        .and_then(|agent| agent.get_task(&framework_id, &asked.task_id))
                    {
                        statuses.push(
                            TaskStatus::new(asked.task_id, task.state)
                                .with_agent(agent_id.clone())
                                .with_message("reconciliation: latest known state"),
                        );
                    }
                } else if let Some(agent_id) = framework.unreachable_tasks.get(&asked.task_id)
                {
                    statuses.push(
                        TaskStatus::new(asked.task_id, TaskState::Unreachable)
                            .with_agent(agent_id.clone())
                            .with_message("reconciliation: agent is unreachable"),
                    );
                } else if asked
                    .agent_id
                    .as_ref()
                    .map(|agent_id| self.agents.transitioning(Some(agent_id)))
                    .unwrap_or_else(|| self.agents.transitioning(None))
                {
                    // The agent's fate is undecided; stay silent rather
                    // than guessing.
                    continue;
                } else {
                    statuses.push(
                        TaskStatus::new(asked.task_id, TaskState::Unknown)
                            .with_message("reconciliation: task is unknown to the master"),
                    );
                }
            }
        }

        for status in statuses {
            framework.send(Event::Update { status });
        }
    }

    // ---- operator API ----

    fn operator_request(
        &mut self,
        principal: Option<String>,
        op: OperatorOp,
        reply: OperatorReply,
    ) {
        let action = operator_action_for(&op);
        let request = AuthorizationRequest { principal, action };

        let authorizer = self.authorizer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = authorizer.authorize(request).await;
            let _ = tx
                .send(MasterMessage::OperatorAuthorized { op, reply, result })
                .await;
        });
    }

    fn operator_authorized(
        &mut self,
        op: OperatorOp,
        reply: OperatorReply,
        result: Result<bool, AuthorizationError>,
    ) {
        match result {
            Err(failure) => {
                let _ = reply.send(Err(Error::AuthorizationUnavailable(failure.to_string())));
                return;
            }
            Ok(false) => {
                let _ = reply.send(Err(Error::AuthorizationDenied(
                    "operator call not authorized".to_string(),
                )));
                return;
            }
            Ok(true) => {}
        }

        // Agent removal completes at the registry; its reply is sent by
        // the removal continuation instead of here.
        if let OperatorOp::RemoveAgent { agent_id } = op {
            if self.agents.removing.contains(&agent_id) {
                let _ = reply.send(Err(Error::Validation(format!(
                    "agent {} is already being removed",
                    agent_id
                ))));
                return;
            }
            self.begin_remove_agent(
                agent_id,
                "agent removed by operator".to_string(),
                Some(reply),
            );
            return;
        }

        let response = self.execute_operator_op(op);
        let _ = reply.send(response);
    }

    fn execute_operator_op(&mut self, op: OperatorOp) -> Result<OperatorResponse, Error> {
        match op {
            OperatorOp::GetState => Ok(OperatorResponse::State(Box::new(self.snapshot()))),
            OperatorOp::GetAgents => Ok(OperatorResponse::Agents(self.agent_summaries())),
            OperatorOp::GetFrameworks => {
                Ok(OperatorResponse::Frameworks(self.framework_summaries()))
            }
            OperatorOp::GetTasks => Ok(OperatorResponse::Tasks(self.task_summaries())),
            OperatorOp::GetRoles => Ok(OperatorResponse::Roles(self.role_summaries())),
            OperatorOp::GetFlags => Ok(OperatorResponse::Flags(Box::new(self.config.clone()))),
            OperatorOp::GetHealth => Ok(OperatorResponse::Health(true)),
            OperatorOp::GetVersion => {
                Ok(OperatorResponse::Version(self.info.version.clone()))
            }
            OperatorOp::GetMetrics => Ok(OperatorResponse::Metrics(self.metrics.clone())),
            OperatorOp::SubscribeEvents => {
                let (stream_id, events) = self.subscribers.add();
                Ok(OperatorResponse::EventStream { stream_id, events })
            }
            OperatorOp::GetMaintenanceSchedule => {
                Ok(OperatorResponse::Schedule(self.maintenance.schedule.clone()))
            }
            OperatorOp::GetMaintenanceStatus => {
                let status = self
                    .maintenance
                    .machines
                    .iter()
                    .map(|(machine_id, machine)| (machine_id.clone(), machine.mode))
                    .collect();
                Ok(OperatorResponse::MaintenanceStatus(status))
            }
            OperatorOp::UpdateMaintenanceSchedule { schedule } => {
                let changed = self
                    .maintenance
                    .apply_schedule(schedule)
                    .map_err(Error::Validation)?;
                for machine_id in changed {
                    self.machine_unavailability_changed(&machine_id);
                }
                Ok(OperatorResponse::Ack)
            }
            OperatorOp::MachineDown { machine } => {
                self.maintenance
                    .machine_down(&machine)
                    .map_err(Error::Validation)?;
                let agent_ids = self.agents_on_machine(&machine);
                for agent_id in agent_ids {
                    self.deactivate_agent(&agent_id);
                }
                Ok(OperatorResponse::Ack)
            }
            OperatorOp::MachineUp { machine } => {
                self.maintenance
                    .machine_up(&machine)
                    .map_err(Error::Validation)?;
                let agent_ids = self.agents_on_machine(&machine);
                for agent_id in agent_ids {
                    let connected = self
                        .agents
                        .get(&agent_id)
                        .map(|agent| agent.connected)
                        .unwrap_or(false);
                    if connected {
                        self.activate_agent(&agent_id);
                    }
                    self.allocator.update_unavailability(&agent_id, None);
                }
                Ok(OperatorResponse::Ack)
            }
            OperatorOp::GetQuota => Ok(OperatorResponse::Quotas(self.roles.quotas().clone())),
            OperatorOp::SetQuota { role, quota } => {
                if role.is_empty() {
                    return Err(Error::Validation("quota requires a role".to_string()));
                }
                if !self.config.role_allowed(&role) {
                    return Err(Error::Validation(format!(
                        "role '{}' is not whitelisted",
                        role
                    )));
                }
                self.roles.set_quota(&role, quota.clone());
                self.allocator.set_quota(&role, &quota.guarantee);
                Ok(OperatorResponse::Ack)
            }
            OperatorOp::RemoveQuota { role } => {
                if !self.roles.remove_quota(&role) {
                    return Err(Error::Validation(format!(
                        "role '{}' has no quota",
                        role
                    )));
                }
                self.allocator.remove_quota(&role);
                Ok(OperatorResponse::Ack)
            }
            OperatorOp::GetWeights => {
                Ok(OperatorResponse::Weights(self.roles.weights().clone()))
            }
            OperatorOp::UpdateWeights { weights } => {
                if weights.values().any(|weight| *weight <= 0.0) {
                    return Err(Error::Validation(
                        "weights must be positive".to_string(),
                    ));
                }
                self.roles.update_weights(weights.clone());
                self.allocator.update_weights(&weights);
                Ok(OperatorResponse::Ack)
            }
            OperatorOp::ReserveResources {
                agent_id,
                resources,
            } => self.operator_operation(agent_id, Operation::Reserve { resources }),
            OperatorOp::UnreserveResources {
                agent_id,
                resources,
            } => self.operator_operation(agent_id, Operation::Unreserve { resources }),
            OperatorOp::CreateVolumes { agent_id, volumes } => {
                self.operator_operation(agent_id, Operation::Create { volumes })
            }
            OperatorOp::DestroyVolumes { agent_id, volumes } => {
                self.operator_operation(agent_id, Operation::Destroy { volumes })
            }
            OperatorOp::RemoveAgent { .. } => {
                // Handled by operator_authorized; the reply waits for
                // the registry commit.
                Err(Error::Validation(
                    "agent removal is handled before execution".to_string(),
                ))
            }
        }
    }

    /// Apply an operator-initiated resource operation against an
    /// agent's unused resources.
    fn operator_operation(
        &mut self,
        agent_id: AgentId,
        operation: Operation,
    ) -> Result<OperatorResponse, Error> {
        if self.agents.transitioning(Some(&agent_id)) {
            return Err(Error::Validation(format!(
                "agent {} is still recovering",
                agent_id
            )));
        }

        let available = self
            .agents
            .get(&agent_id)
            .map(|agent| agent.available_resources())
            .ok_or_else(|| {
                Error::Validation(format!("agent {} is not registered", agent_id))
            })?;

        // The operation must be satisfiable from resources that are
        // neither in use nor offered out.
        available.apply(&operation)?;

        let agent = self
            .agents
            .get_mut(&agent_id)
            .expect("agent presence checked above");
        agent.apply_operation(&operation)?;
        agent.send(AgentMessage::CheckpointResources {
            checkpointed: agent.checkpointed_resources.clone(),
        });
        let total = agent.total_resources.clone();

        self.allocator.update_agent(&agent_id, &total);
        Ok(OperatorResponse::Ack)
    }

    fn machine_unavailability_changed(&mut self, machine_id: &MachineId) {
        let unavailability = self.maintenance.unavailability(machine_id);
        for agent_id in self.agents_on_machine(machine_id) {
            self.allocator
                .update_unavailability(&agent_id, unavailability);
        }
    }

    fn agents_on_machine(&self, machine_id: &MachineId) -> Vec<AgentId> {
        self.agents
            .iter()
            .filter(|agent| &agent.machine == machine_id)
            .map(|agent| agent.id.clone())
            .collect()
    }

    // ---- snapshots ----

    fn agent_summaries(&self) -> Vec<AgentSummary> {
        self.agents
            .iter()
            .map(|agent| AgentSummary {
                agent_id: agent.id.clone(),
                hostname: agent.info.hostname.clone(),
                connected: agent.connected,
                active: agent.active,
                total_resources: agent.total_resources.clone(),
                used_resources: agent.used_resources.clone(),
                offered_resources: agent.offered_resources.clone(),
            })
            .collect()
    }

    fn framework_summaries(&self) -> Vec<FrameworkSummary> {
        self.frameworks
            .iter()
            .map(|framework| FrameworkSummary {
                framework_id: framework.id(),
                name: framework.info.name.clone(),
                role: framework.info.role.clone(),
                connected: framework.connected,
                active: framework.active,
                task_count: framework.tasks.len(),
                used_resources: framework.used_resources.clone(),
                offered_resources: framework.offered_resources.clone(),
            })
            .collect()
    }

    fn task_summaries(&self) -> Vec<TaskSummary> {
        let mut tasks: Vec<TaskSummary> = Vec::new();
        for agent in self.agents.iter() {
            for task in agent.all_tasks() {
                tasks.push(TaskSummary {
                    task_id: task.task_id.clone(),
                    framework_id: task.framework_id.clone(),
                    agent_id: task.agent_id.clone(),
                    state: task.state,
                });
            }
        }
        tasks
    }

    fn role_summaries(&self) -> Vec<RoleSummary> {
        self.roles
            .active_roles()
            .into_iter()
            .map(|role| RoleSummary {
                weight: self.roles.weight(&role),
                quota: self.roles.quota(&role).cloned(),
                frameworks: self
                    .roles
                    .frameworks(&role)
                    .map(|frameworks| frameworks.iter().cloned().collect())
                    .unwrap_or_default(),
                role,
            })
            .collect()
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            master: self.info.clone(),
            agents: self.agent_summaries(),
            unreachable_agents: self.agents.unreachable.keys().cloned().collect(),
            frameworks: self.framework_summaries(),
            completed_frameworks: self
                .frameworks
                .completed
                .iter()
                .filter_map(|completed| completed.info.id.clone())
                .collect(),
            tasks: self.task_summaries(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Map an accept operation to the authorization question it poses.
fn authorization_request_for(
    framework: &Framework,
    operation: &Operation,
) -> AuthorizationRequest {
    let principal = framework.principal.clone();
    let action = match operation {
        Operation::Reserve { .. } => Action::ReserveResources {
            role: framework.info.role.clone(),
        },
        Operation::Unreserve { resources } => Action::UnreserveResources {
            reserver_principal: resources
                .iter()
                .find_map(|resource| resource.reservation.as_ref())
                .and_then(|reservation| reservation.principal.clone()),
        },
        Operation::Create { .. } => Action::CreateVolume {
            role: framework.info.role.clone(),
        },
        Operation::Destroy { volumes } => Action::DestroyVolume {
            creator_principal: volumes
                .iter()
                .find_map(|resource| resource.reservation.as_ref())
                .and_then(|reservation| reservation.principal.clone()),
        },
        Operation::Launch { .. } | Operation::LaunchGroup { .. } => Action::RunTask {
            user: framework.info.user.clone(),
        },
    };

    AuthorizationRequest { principal, action }
}

/// Map an operator call to the authorization question it poses.
fn operator_action_for(op: &OperatorOp) -> Action {
    match op {
        OperatorOp::GetState
        | OperatorOp::GetAgents
        | OperatorOp::GetFrameworks
        | OperatorOp::GetTasks
        | OperatorOp::GetRoles
        | OperatorOp::GetFlags
        | OperatorOp::GetHealth
        | OperatorOp::GetVersion
        | OperatorOp::GetMetrics
        | OperatorOp::GetWeights
        | OperatorOp::SubscribeEvents => Action::ViewState,
        OperatorOp::GetMaintenanceSchedule
        | OperatorOp::GetMaintenanceStatus => Action::ViewState,
        OperatorOp::UpdateMaintenanceSchedule { .. }
        | OperatorOp::MachineDown { .. }
        | OperatorOp::MachineUp { .. } => Action::UpdateMaintenance,
        OperatorOp::GetQuota => Action::GetQuota {
            role: "*".to_string(),
        },
        OperatorOp::SetQuota { role, .. } | OperatorOp::RemoveQuota { role } => {
            Action::UpdateQuota { role: role.clone() }
        }
        OperatorOp::UpdateWeights { weights } => Action::UpdateWeights {
            roles: weights.keys().cloned().collect(),
        },
        OperatorOp::ReserveResources { resources, .. } => Action::ReserveResources {
            role: resources
                .iter()
                .find_map(|resource| resource.reservation.as_ref())
                .map(|reservation| reservation.role.clone())
                .unwrap_or_default(),
        },
        OperatorOp::UnreserveResources { resources, .. } => Action::UnreserveResources {
            reserver_principal: resources
                .iter()
                .find_map(|resource| resource.reservation.as_ref())
                .and_then(|reservation| reservation.principal.clone()),
        },
        OperatorOp::CreateVolumes { volumes, .. } => Action::CreateVolume {
            role: volumes
                .iter()
                .find_map(|resource| resource.reservation.as_ref())
                .map(|reservation| reservation.role.clone())
                .unwrap_or_default(),
        },
        OperatorOp::DestroyVolumes { volumes, .. } => Action::DestroyVolume {
            creator_principal: volumes
                .iter()
                .find_map(|resource| resource.reservation.as_ref())
                .and_then(|reservation| reservation.principal.clone()),
        },
        OperatorOp::RemoveAgent { .. } => Action::RemoveAgent,
    }
}
