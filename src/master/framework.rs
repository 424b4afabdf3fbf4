//! The framework entity and the in-memory framework index.

use super::agent::Task;
use crate::config::{MasterConfig, RateLimit};
use crate::ids::{AgentId, ExecutorId, FrameworkId, OfferId, TaskId};
use crate::messages::scheduler::Event;
use crate::messages::{FrameworkInfo, TaskInfo};
use crate::ratelimit::BoundedRateLimiter;
use crate::resources::Resources;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How a framework is connected. Exactly one variant at a time; a
/// re-subscription replaces the whole variant, and the stream variant
/// owns its heartbeater.
#[derive(Debug)]
pub enum FrameworkConnection {
    /// Message-passing connection (driver-style).
    Channel { tx: mpsc::UnboundedSender<Event> },

    /// Streaming connection with a server-assigned stream id and a
    /// periodic heartbeat.
    Stream {
        tx: mpsc::UnboundedSender<Event>,
        stream_id: Uuid,
        heartbeater: JoinHandle<()>,
    },
}

impl FrameworkConnection {
    pub fn send(&self, event: Event) -> bool {
        match self {
            FrameworkConnection::Channel { tx } => tx.send(event).is_ok(),
            FrameworkConnection::Stream { tx, .. } => tx.send(event).is_ok(),
        }
    }

    /// Tear the connection down, stopping any owned heartbeater.
    pub fn close(self) {
        if let FrameworkConnection::Stream { heartbeater, .. } = self {
            heartbeater.abort();
        }
    }
}

/// A registered framework.
#[derive(Debug)]
pub struct Framework {
    pub info: FrameworkInfo,
    pub connection: Option<FrameworkConnection>,

    /// Transport-level liveness.
    pub connected: bool,
    /// Policy-level eligibility for offers.
    pub active: bool,

    pub registered_time: SystemTime,
    pub reregistered_time: SystemTime,

    /// Bumped on every (re)connection. Failover timers capture the
    /// generation they were armed under and fire only if it still
    /// matches, so a timely re-subscription disarms them.
    pub generation: u64,

    /// Principal this framework authenticated as.
    pub principal: Option<String>,

    /// Index into the agent arena: which agent owns each task.
    pub tasks: HashMap<TaskId, AgentId>,

    /// Tasks last seen on an agent that became unreachable. Used to
    /// re-issue kills when the agent returns and to answer
    /// reconciliation with TASK_UNREACHABLE.
    pub unreachable_tasks: HashMap<TaskId, AgentId>,

    /// Tasks being authorized; not yet launched.
    pub pending_tasks: HashMap<TaskId, TaskInfo>,

    /// Terminal, acknowledged tasks, bounded FIFO.
    pub completed_tasks: VecDeque<Task>,

    pub offers: HashSet<OfferId>,
    pub inverse_offers: HashSet<OfferId>,

    /// Executors per agent; the executor infos live on the agent.
    pub executors: HashMap<AgentId, HashSet<ExecutorId>>,

    /// Task/executor resources per agent. Kept partitioned: non-scalar
    /// resources cannot be summed across agents without losing
    /// identity.
    pub used_resources: HashMap<AgentId, Resources>,

    /// Scalar-only running total across agents, for cheap reporting.
    pub total_used_scalars: Resources,

    pub offered_resources: HashMap<AgentId, Resources>,
    pub total_offered_scalars: Resources,

    max_completed_tasks: usize,
}

impl Framework {
    pub fn new(
        info: FrameworkInfo,
        connection: FrameworkConnection,
        principal: Option<String>,
        max_completed_tasks: usize,
        now: SystemTime,
    ) -> Self {
        debug_assert!(info.id.is_some(), "framework info must carry an id");
        Self {
            info,
            connection: Some(connection),
            connected: true,
            active: true,
            registered_time: now,
            reregistered_time: now,
            generation: 0,
            principal,
            tasks: HashMap::new(),
            unreachable_tasks: HashMap::new(),
            pending_tasks: HashMap::new(),
            completed_tasks: VecDeque::new(),
            offers: HashSet::new(),
            inverse_offers: HashSet::new(),
            executors: HashMap::new(),
            used_resources: HashMap::new(),
            total_used_scalars: Resources::new(),
            offered_resources: HashMap::new(),
            total_offered_scalars: Resources::new(),
            max_completed_tasks,
        }
    }

    pub fn id(&self) -> FrameworkId {
        self.info.id.clone().expect("framework id is set at construction")
    }

    pub fn role(&self) -> &str {
        &self.info.role
    }

    /// Send an event to the framework. Sending to a disconnected
    /// framework is dropped with a false return.
    pub fn send(&self, event: Event) -> bool {
        match &self.connection {
            Some(connection) if self.connected => connection.send(event),
            _ => false,
        }
    }

    /// Replace the connection (failover or HTTP/driver up/downgrade).
    pub fn update_connection(&mut self, connection: FrameworkConnection, now: SystemTime) {
        if let Some(old) = self.connection.take() {
            old.close();
        }
        self.connection = Some(connection);
        self.connected = true;
        self.reregistered_time = now;
        self.generation += 1;
    }

    /// The transport closed.
    pub fn disconnected(&mut self) {
        if let Some(old) = self.connection.take() {
            old.close();
        }
        self.connected = false;
        self.generation += 1;
    }

    pub fn add_task(&mut self, task: &Task) {
        debug_assert!(
            !self.tasks.contains_key(&task.task_id),
            "duplicate task {} of framework {}",
            task.task_id,
            task.framework_id
        );

        self.tasks.insert(task.task_id.clone(), task.agent_id.clone());

        if !task.state.is_terminal() {
            self.used_resources
                .entry(task.agent_id.clone())
                .or_default()
                .add_all(&task.resources);
            self.total_used_scalars.add_all(&task.resources.scalars());
        }
    }

    /// Mirror of the agent-side terminal accounting.
    pub fn task_terminated(&mut self, task: &Task) {
        debug_assert!(task.state.is_terminal());

        if let Some(used) = self.used_resources.get_mut(&task.agent_id) {
            used.subtract_all(&task.resources);
            if used.is_empty() {
                self.used_resources.remove(&task.agent_id);
            }
        }
        self.total_used_scalars.subtract_all(&task.resources.scalars());
    }

    /// Drop the task index entry and archive the task.
    pub fn remove_task(&mut self, task: &Task) {
        if !task.state.is_terminal() {
            if let Some(used) = self.used_resources.get_mut(&task.agent_id) {
                used.subtract_all(&task.resources);
                if used.is_empty() {
                    self.used_resources.remove(&task.agent_id);
                }
            }
            self.total_used_scalars.subtract_all(&task.resources.scalars());
        }

        self.tasks.remove(&task.task_id);
        self.add_completed_task(task.clone());
    }

    pub fn add_completed_task(&mut self, task: Task) {
        if self.completed_tasks.len() == self.max_completed_tasks {
            self.completed_tasks.pop_front();
        }
        self.completed_tasks.push_back(task);
    }

    pub fn add_offer(&mut self, offer_id: OfferId, agent_id: &AgentId, resources: &Resources) {
        debug_assert!(!self.offers.contains(&offer_id), "duplicate offer {}", offer_id);
        self.offers.insert(offer_id);
        self.offered_resources
            .entry(agent_id.clone())
            .or_default()
            .add_all(resources);
        self.total_offered_scalars.add_all(&resources.scalars());
    }

    pub fn remove_offer(&mut self, offer_id: &OfferId, agent_id: &AgentId, resources: &Resources) {
        debug_assert!(self.offers.contains(offer_id), "unknown offer {}", offer_id);
        self.offers.remove(offer_id);
        if let Some(offered) = self.offered_resources.get_mut(agent_id) {
            offered.subtract_all(resources);
            if offered.is_empty() {
                self.offered_resources.remove(agent_id);
            }
        }
        self.total_offered_scalars.subtract_all(&resources.scalars());
    }

    pub fn add_executor(&mut self, agent_id: &AgentId, executor_id: ExecutorId, resources: &Resources) {
        self.executors
            .entry(agent_id.clone())
            .or_default()
            .insert(executor_id);
        self.used_resources
            .entry(agent_id.clone())
            .or_default()
            .add_all(resources);
        self.total_used_scalars.add_all(&resources.scalars());
    }

    pub fn remove_executor(&mut self, agent_id: &AgentId, executor_id: &ExecutorId, resources: &Resources) {
        if let Some(executors) = self.executors.get_mut(agent_id) {
            executors.remove(executor_id);
            if executors.is_empty() {
                self.executors.remove(agent_id);
            }
        }
        if let Some(used) = self.used_resources.get_mut(agent_id) {
            used.subtract_all(resources);
            if used.is_empty() {
                self.used_resources.remove(agent_id);
            }
        }
        self.total_used_scalars.subtract_all(&resources.scalars());
    }

    /// The failover window for this framework.
    pub fn failover_timeout(&self, config: &MasterConfig) -> std::time::Duration {
        self.info
            .failover_timeout
            .unwrap_or(config.framework_failover_timeout)
    }
}

/// A torn-down framework, kept for operator inspection.
#[derive(Debug)]
pub struct CompletedFramework {
    pub info: FrameworkInfo,
    pub completed_tasks: VecDeque<Task>,
    pub unregistered_time: SystemTime,
}

/// The in-memory framework index.
#[derive(Debug)]
pub struct Frameworks {
    registered: HashMap<FrameworkId, Framework>,

    /// Frameworks learned from re-registering agents after a master
    /// failover; they have not re-subscribed yet.
    pub recovered: HashMap<FrameworkId, FrameworkInfo>,

    /// Bounded FIFO of torn-down frameworks.
    pub completed: VecDeque<CompletedFramework>,

    /// Per-principal limiters, created lazily from configuration. All
    /// frameworks sharing a principal share a limiter.
    pub limiters: HashMap<String, BoundedRateLimiter>,

    /// Limiter for principals without an explicit configuration and for
    /// unauthenticated connections.
    pub default_limiter: Option<BoundedRateLimiter>,

    max_completed: usize,
}

impl Frameworks {
    pub fn new(config: &MasterConfig) -> Self {
        let default_limiter = config
            .default_rate_limit
            .as_ref()
            .map(|limit| BoundedRateLimiter::new(limit.qps, limit.capacity));

        Self {
            registered: HashMap::new(),
            recovered: HashMap::new(),
            completed: VecDeque::new(),
            limiters: HashMap::new(),
            default_limiter,
            max_completed: config.max_completed_frameworks,
        }
    }

    pub fn put(&mut self, framework: Framework) {
        self.recovered.remove(&framework.id());
        self.registered.insert(framework.id(), framework);
    }

    pub fn get(&self, id: &FrameworkId) -> Option<&Framework> {
        self.registered.get(id)
    }

    pub fn get_mut(&mut self, id: &FrameworkId) -> Option<&mut Framework> {
        self.registered.get_mut(id)
    }

    pub fn contains(&self, id: &FrameworkId) -> bool {
        self.registered.contains_key(id)
    }

    pub fn remove(&mut self, id: &FrameworkId) -> Option<Framework> {
        self.registered.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Framework> {
        self.registered.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Framework> {
        self.registered.values_mut()
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Archive a torn-down framework into the completed ring.
    pub fn complete(&mut self, framework: Framework, now: SystemTime) {
        if let Some(connection) = framework.connection {
            connection.close();
        }
        if self.completed.len() == self.max_completed {
            self.completed.pop_front();
        }
        self.completed.push_back(CompletedFramework {
            info: framework.info,
            completed_tasks: framework.completed_tasks,
            unregistered_time: now,
        });
    }

    /// The limiter for a principal, creating it from configuration on
    /// first use. `None` means unthrottled.
    pub fn limiter_for(
        &mut self,
        principal: Option<&str>,
        config: &MasterConfig,
    ) -> Option<&mut BoundedRateLimiter> {
        let explicit = principal
            .map(|p| config.rate_limits.iter().any(|limit| limit.principal == p))
            .unwrap_or(false);

        if let Some(principal) = principal {
            if explicit {
                let limit: &RateLimit = config
                    .rate_limits
                    .iter()
                    .find(|limit| limit.principal == principal)
                    .expect("checked above");
                return Some(
                    self.limiters
                        .entry(principal.to_string())
                        .or_insert_with(|| BoundedRateLimiter::new(limit.qps, limit.capacity)),
                );
            }
        }

        self.default_limiter.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::TaskState;

    fn framework(id: &str) -> (Framework, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut info = FrameworkInfo::new(id, "web");
        info.id = Some(FrameworkId::new(id));
        (
            Framework::new(
                info,
                FrameworkConnection::Channel { tx },
                None,
                4,
                SystemTime::now(),
            ),
            rx,
        )
    }

    fn task(framework: &Framework, agent: &str, id: &str, cpus: f64) -> Task {
        Task::from_info(
            &TaskInfo::new(id, Resources::cpus_mem(cpus, 256.0)),
            framework.id(),
            AgentId::new(agent),
        )
    }

    #[test]
    fn test_task_accounting_partitioned_by_agent() {
        let (mut framework, _rx) = framework("f1");
        let t1 = task(&framework, "a1", "t1", 1.0);
        let t2 = task(&framework, "a2", "t2", 2.0);

        framework.add_task(&t1);
        framework.add_task(&t2);

        assert_eq!(framework.used_resources[&AgentId::new("a1")].scalar("cpus"), 1.0);
        assert_eq!(framework.used_resources[&AgentId::new("a2")].scalar("cpus"), 2.0);
        assert_eq!(framework.total_used_scalars.scalar("cpus"), 3.0);

        let mut terminal = t1.clone();
        terminal.state = TaskState::Finished;
        framework.task_terminated(&terminal);
        assert!(!framework.used_resources.contains_key(&AgentId::new("a1")));
        assert_eq!(framework.total_used_scalars.scalar("cpus"), 2.0);

        framework.remove_task(&terminal);
        assert!(!framework.tasks.contains_key(&TaskId::new("t1")));
        assert_eq!(framework.completed_tasks.len(), 1);
    }

    #[test]
    fn test_completed_tasks_ring_bounded() {
        let (mut framework, _rx) = framework("f1");
        for i in 0..6 {
            framework.add_completed_task(task(&framework, "a1", &format!("t{}", i), 0.1));
        }

        assert_eq!(framework.completed_tasks.len(), 4);
        assert_eq!(framework.completed_tasks[0].task_id, TaskId::new("t2"));
    }

    #[test]
    fn test_send_after_disconnect_is_dropped() {
        let (mut framework, mut rx) = framework("f1");
        assert!(framework.send(Event::Heartbeat));
        assert!(rx.try_recv().is_ok());

        framework.disconnected();
        assert!(!framework.send(Event::Heartbeat));
    }

    #[test]
    fn test_update_connection_bumps_generation() {
        let (mut framework, _rx) = framework("f1");
        let before = framework.generation;

        let (tx, _rx2) = mpsc::unbounded_channel();
        framework.update_connection(
            FrameworkConnection::Channel { tx },
            SystemTime::now(),
        );

        assert!(framework.generation > before);
        assert!(framework.connected);
    }

    #[test]
    fn test_completed_frameworks_ring_bounded() {
        let config = MasterConfig {
            max_completed_frameworks: 2,
            ..MasterConfig::default()
        };
        let mut frameworks = Frameworks::new(&config);

        for i in 0..3 {
            let (f, _rx) = framework(&format!("f{}", i));
            frameworks.complete(f, SystemTime::now());
        }

        assert_eq!(frameworks.completed.len(), 2);
        assert_eq!(
            frameworks.completed[0].info.id,
            Some(FrameworkId::new("f1"))
        );
    }

    #[test]
    fn test_limiter_lookup() {
        let config = MasterConfig {
            rate_limits: vec![RateLimit {
                principal: "alice".to_string(),
                qps: Some(1.0),
                capacity: Some(2),
            }],
            default_rate_limit: Some(RateLimit {
                principal: String::new(),
                qps: Some(5.0),
                capacity: None,
            }),
            ..MasterConfig::default()
        };
        let mut frameworks = Frameworks::new(&config);

        assert!(frameworks.limiter_for(Some("alice"), &config).is_some());
        assert_eq!(frameworks.limiters.len(), 1);

        // Unconfigured principals and anonymous callers share the
        // default limiter.
        assert!(frameworks.limiter_for(Some("bob"), &config).is_some());
        assert!(frameworks.limiter_for(None, &config).is_some());
        assert_eq!(frameworks.limiters.len(), 1);
    }
}
