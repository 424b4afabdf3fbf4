//! The agent entity and the in-memory agent index.

use crate::ids::{AgentId, Address, ExecutorId, FrameworkId, MachineId, OfferId, TaskId};
use crate::messages::agent::AgentMessage;
use crate::messages::{AgentInfo, ExecutorInfo, TaskInfo, TaskState, TaskStatus};
use crate::ratelimit::RateLimiter;
use crate::resources::{Operation, ResourceError, Resources};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::SystemTime;
use tokio::sync::mpsc;

/// A running (or terminal-but-unacknowledged) task. Tasks are owned by
/// the agent arena; frameworks index them by id.
#[derive(Clone, Debug)]
pub struct Task {
    pub task_id: TaskId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub executor_id: Option<ExecutorId>,
    pub name: String,
    pub state: TaskState,
    pub resources: Resources,
    pub latest_status: Option<TaskStatus>,
}

impl Task {
    pub fn from_info(info: &TaskInfo, framework_id: FrameworkId, agent_id: AgentId) -> Self {
        Self {
            task_id: info.task_id.clone(),
            framework_id,
            agent_id,
            executor_id: info.executor.as_ref().map(|e| e.executor_id.clone()),
            name: info.name.clone(),
            state: TaskState::Staging,
            resources: info.resources.clone(),
            latest_status: None,
        }
    }
}

/// The master's sending side of an agent connection.
#[derive(Clone, Debug)]
pub struct AgentConnection {
    pub address: Address,
    tx: mpsc::UnboundedSender<AgentMessage>,
}

impl AgentConnection {
    pub fn new(address: Address, tx: mpsc::UnboundedSender<AgentMessage>) -> Self {
        Self { address, tx }
    }

    /// Send a message; false when the transport is gone. The master
    /// learns about closure through the exited path, not from here.
    pub fn send(&self, message: AgentMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// A registered agent.
#[derive(Debug)]
pub struct Agent {
    pub id: AgentId,
    pub info: AgentInfo,
    pub machine: MachineId,
    pub connection: AgentConnection,
    pub version: String,

    pub registered_time: SystemTime,
    pub reregistered_time: Option<SystemTime>,

    /// Transport-level liveness.
    pub connected: bool,
    /// Policy-level eligibility for offers.
    pub active: bool,

    /// Executors running on this agent.
    pub executors: HashMap<FrameworkId, HashMap<ExecutorId, ExecutorInfo>>,

    /// Tasks being authorized; not yet launched.
    pub pending_tasks: HashMap<FrameworkId, HashMap<TaskId, TaskInfo>>,

    /// Tasks present on this agent. Single source of truth for the
    /// used-resource counters below.
    pub tasks: HashMap<FrameworkId, HashMap<TaskId, Task>>,

    /// Tasks frameworks asked to kill while the agent was away; used to
    /// re-issue kills when the agent re-registers.
    pub killed_tasks: HashMap<FrameworkId, HashSet<TaskId>>,

    pub offers: HashSet<OfferId>,
    pub inverse_offers: HashSet<OfferId>,

    /// Resources of non-terminal tasks and executors, per framework.
    /// Mutated only through the add/remove helpers on this type.
    pub used_resources: HashMap<FrameworkId, Resources>,

    /// Resources sitting in outstanding offers.
    pub offered_resources: Resources,

    /// Resources the agent must persist: reservations and volumes.
    pub checkpointed_resources: Resources,

    /// Static resources with all applied operations re-applied.
    pub total_resources: Resources,
}

impl Agent {
    /// Build an agent from its registration. `info.id` must be set.
    pub fn new(
        info: AgentInfo,
        connection: AgentConnection,
        checkpointed: Resources,
        version: String,
        registered_time: SystemTime,
    ) -> Self {
        let id = info.id.clone().expect("agent info must carry an id");

        // The static resources describe the unreserved view; applied
        // reservations and volumes replace their unreserved equivalents.
        let mut total = info.resources.clone();
        let mut stripped = Resources::new();
        for resource in checkpointed.iter() {
            let mut plain = resource.clone();
            plain.reservation = None;
            plain.volume = None;
            stripped.add(&plain);
        }
        total.subtract_all(&stripped);
        total.add_all(&checkpointed);

        Self {
            id,
            machine: info.machine.clone(),
            info,
            connection,
            version,
            registered_time,
            reregistered_time: None,
            connected: true,
            active: true,
            executors: HashMap::new(),
            pending_tasks: HashMap::new(),
            tasks: HashMap::new(),
            killed_tasks: HashMap::new(),
            offers: HashSet::new(),
            inverse_offers: HashSet::new(),
            used_resources: HashMap::new(),
            offered_resources: Resources::new(),
            checkpointed_resources: checkpointed,
            total_resources: total,
        }
    }

    pub fn send(&self, message: AgentMessage) -> bool {
        self.connection.send(message)
    }

    pub fn get_task(&self, framework_id: &FrameworkId, task_id: &TaskId) -> Option<&Task> {
        self.tasks.get(framework_id).and_then(|tasks| tasks.get(task_id))
    }

    pub fn get_task_mut(
        &mut self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
    ) -> Option<&mut Task> {
        self.tasks
            .get_mut(framework_id)
            .and_then(|tasks| tasks.get_mut(task_id))
    }

    /// Install a task. Non-terminal tasks consume used resources.
    pub fn add_task(&mut self, task: Task) {
        let framework_id = task.framework_id.clone();
        let task_id = task.task_id.clone();
        debug_assert!(
            self.get_task(&framework_id, &task_id).is_none(),
            "duplicate task {} of framework {}",
            task_id,
            framework_id
        );

        if !task.state.is_terminal() {
            self.used_resources
                .entry(framework_id.clone())
                .or_default()
                .add_all(&task.resources);
        }

        self.tasks
            .entry(framework_id)
            .or_default()
            .insert(task_id, task);
    }

    /// A task reached a terminal state: release its resources but keep
    /// the task object until the update is acknowledged.
    pub fn task_terminated(&mut self, framework_id: &FrameworkId, task_id: &TaskId) {
        let resources = match self.get_task(framework_id, task_id) {
            Some(task) => {
                debug_assert!(task.state.is_terminal());
                task.resources.clone()
            }
            None => return,
        };

        if let Some(used) = self.used_resources.get_mut(framework_id) {
            used.subtract_all(&resources);
            if used.is_empty() {
                self.used_resources.remove(framework_id);
            }
        }
    }

    /// Drop a task entirely, returning it. Releases resources when the
    /// task was still non-terminal.
    pub fn remove_task(&mut self, framework_id: &FrameworkId, task_id: &TaskId) -> Option<Task> {
        let task = self.tasks.get_mut(framework_id)?.remove(task_id)?;
        if self.tasks.get(framework_id).is_some_and(|tasks| tasks.is_empty()) {
            self.tasks.remove(framework_id);
        }

        if !task.state.is_terminal() {
            if let Some(used) = self.used_resources.get_mut(framework_id) {
                used.subtract_all(&task.resources);
                if used.is_empty() {
                    self.used_resources.remove(framework_id);
                }
            }
        }

        if let Some(killed) = self.killed_tasks.get_mut(framework_id) {
            killed.remove(task_id);
            if killed.is_empty() {
                self.killed_tasks.remove(framework_id);
            }
        }

        Some(task)
    }

    pub fn add_offer(&mut self, offer_id: OfferId, resources: &Resources) {
        debug_assert!(!self.offers.contains(&offer_id), "duplicate offer {}", offer_id);
        self.offers.insert(offer_id);
        self.offered_resources.add_all(resources);
    }

    pub fn remove_offer(&mut self, offer_id: &OfferId, resources: &Resources) {
        debug_assert!(self.offers.contains(offer_id), "unknown offer {}", offer_id);
        self.offers.remove(offer_id);
        self.offered_resources.subtract_all(resources);
    }

    pub fn has_executor(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> bool {
        self.executors
            .get(framework_id)
            .is_some_and(|executors| executors.contains_key(executor_id))
    }

    pub fn add_executor(&mut self, framework_id: &FrameworkId, executor: ExecutorInfo) {
        debug_assert!(
            !self.has_executor(framework_id, &executor.executor_id),
            "duplicate executor {} of framework {}",
            executor.executor_id,
            framework_id
        );

        self.used_resources
            .entry(framework_id.clone())
            .or_default()
            .add_all(&executor.resources);
        self.executors
            .entry(framework_id.clone())
            .or_default()
            .insert(executor.executor_id.clone(), executor);
    }

    pub fn remove_executor(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> Option<ExecutorInfo> {
        let executor = self.executors.get_mut(framework_id)?.remove(executor_id)?;
        if self.executors.get(framework_id).is_some_and(|e| e.is_empty()) {
            self.executors.remove(framework_id);
        }

        if let Some(used) = self.used_resources.get_mut(framework_id) {
            used.subtract_all(&executor.resources);
            if used.is_empty() {
                self.used_resources.remove(framework_id);
            }
        }

        Some(executor)
    }

    /// Apply a reservation or volume operation to the agent's view and
    /// refresh the checkpointed subset.
    ///
    /// The master believes the new checkpoint is in effect before the
    /// agent confirms it; there is no agent-side acknowledgement path.
    pub fn apply_operation(&mut self, operation: &Operation) -> Result<(), ResourceError> {
        let total = self.total_resources.apply(operation)?;
        self.total_resources = total;
        self.checkpointed_resources = self.total_resources.checkpointed();
        Ok(())
    }

    /// Resources neither used nor offered.
    pub fn available_resources(&self) -> Resources {
        let mut available = self.total_resources.clone();
        for used in self.used_resources.values() {
            available.subtract_all(used);
        }
        available.subtract_all(&self.offered_resources);
        available
    }

    /// All tasks across frameworks.
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().flat_map(|tasks| tasks.values())
    }

    /// Recompute the used-resource counters from the task and executor
    /// maps. Test-only cross-check for the counter helpers.
    #[cfg(test)]
    pub fn check_accounting(&self) {
        let mut recomputed: HashMap<FrameworkId, Resources> = HashMap::new();
        for (framework_id, tasks) in &self.tasks {
            for task in tasks.values() {
                if !task.state.is_terminal() {
                    recomputed
                        .entry(framework_id.clone())
                        .or_default()
                        .add_all(&task.resources);
                }
            }
        }
        for (framework_id, executors) in &self.executors {
            for executor in executors.values() {
                recomputed
                    .entry(framework_id.clone())
                    .or_default()
                    .add_all(&executor.resources);
            }
        }

        assert_eq!(recomputed, self.used_resources, "used-resource counter drift");
    }
}

/// Bounded FIFO cache of removed agent ids. A re-registration from a
/// tombstoned id is refused outright; eviction means the id is treated
/// as unknown again.
#[derive(Debug)]
pub struct TombstoneCache {
    order: VecDeque<AgentId>,
    ids: HashSet<AgentId>,
    capacity: usize,
}

impl TombstoneCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            ids: HashSet::new(),
            capacity,
        }
    }

    pub fn insert(&mut self, id: AgentId) {
        if self.capacity == 0 || self.ids.contains(&id) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.order.push_back(id.clone());
        self.ids.insert(id);
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The in-memory agent index: registered agents plus every transitional
/// set the lifecycle needs.
#[derive(Debug)]
pub struct Agents {
    registered: HashMap<AgentId, Agent>,
    by_address: HashMap<Address, AgentId>,

    /// Learned from the registry after failover; not yet heard from.
    pub recovered: HashMap<AgentId, AgentInfo>,

    /// Addresses with a first registration in flight.
    pub registering: HashSet<Address>,

    /// Ids with a re-registration in flight. Questions about these
    /// agents cannot be answered until the registrar decides.
    pub reregistering: HashSet<AgentId>,

    /// Ids with a removal in flight.
    pub removing: HashSet<AgentId>,

    /// Ids with a mark-unreachable in flight.
    pub marking_unreachable: HashSet<AgentId>,

    /// Unreachable agents and when they became so. Mirrors the
    /// registry's unreachable list.
    pub unreachable: HashMap<AgentId, SystemTime>,

    /// Removed agents, so stale re-registrations are refused.
    pub removed: TombstoneCache,

    /// Paces unreachable transitions driven by health checks.
    pub removal_limiter: Option<RateLimiter>,
}

impl Agents {
    pub fn new(max_removed: usize, removal_rate: Option<f64>) -> Self {
        Self {
            registered: HashMap::new(),
            by_address: HashMap::new(),
            recovered: HashMap::new(),
            registering: HashSet::new(),
            reregistering: HashSet::new(),
            removing: HashSet::new(),
            marking_unreachable: HashSet::new(),
            unreachable: HashMap::new(),
            removed: TombstoneCache::new(max_removed),
            removal_limiter: removal_rate.map(RateLimiter::new),
        }
    }

    pub fn put(&mut self, agent: Agent) {
        self.by_address
            .insert(agent.connection.address.clone(), agent.id.clone());
        self.registered.insert(agent.id.clone(), agent);
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.registered.get(id)
    }

    pub fn get_mut(&mut self, id: &AgentId) -> Option<&mut Agent> {
        self.registered.get_mut(id)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<&Agent> {
        self.by_address
            .get(address)
            .and_then(|id| self.registered.get(id))
    }

    pub fn id_by_address(&self, address: &Address) -> Option<&AgentId> {
        self.by_address.get(address)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.registered.contains_key(id)
    }

    pub fn remove(&mut self, id: &AgentId) -> Option<Agent> {
        let agent = self.registered.remove(id)?;
        // Only unmap the address if it still points at this agent; a
        // replacement connection may have claimed it.
        if self.by_address.get(&agent.connection.address) == Some(id) {
            self.by_address.remove(&agent.connection.address);
        }
        Some(agent)
    }

    /// Rebind a registered agent to a new connection (new address wins).
    pub fn rebind(&mut self, id: &AgentId, connection: AgentConnection) {
        if let Some(agent) = self.registered.get_mut(id) {
            if self.by_address.get(&agent.connection.address) == Some(id) {
                self.by_address.remove(&agent.connection.address);
            }
            self.by_address.insert(connection.address.clone(), id.clone());
            agent.connection = connection;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.registered.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Agent> {
        self.registered.values_mut()
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Whether questions about this agent (or any agent, with `None`)
    /// must wait for recovery to settle.
    pub fn transitioning(&self, id: Option<&AgentId>) -> bool {
        match id {
            Some(id) => self.recovered.contains_key(id),
            None => !self.recovered.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Resource;

    fn connection(address: &str) -> (AgentConnection, mpsc::UnboundedReceiver<AgentMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AgentConnection::new(Address::from(address), tx), rx)
    }

    fn agent(id: &str, address: &str) -> (Agent, mpsc::UnboundedReceiver<AgentMessage>) {
        let mut info = AgentInfo::new(format!("host-{}", id), Resources::cpus_mem(4.0, 8192.0));
        info.id = Some(AgentId::new(id));
        let (conn, rx) = connection(address);
        (
            Agent::new(info, conn, Resources::new(), "1.0.0".to_string(), SystemTime::now()),
            rx,
        )
    }

    fn task(agent: &AgentId, framework: &str, id: &str, cpus: f64) -> Task {
        Task::from_info(
            &TaskInfo::new(id, Resources::cpus_mem(cpus, 256.0)),
            FrameworkId::new(framework),
            agent.clone(),
        )
    }

    #[test]
    fn test_task_accounting() {
        let (mut agent, _rx) = agent("a1", "addr1");
        let framework_id = FrameworkId::new("f1");

        agent.add_task(task(&agent.id.clone(), "f1", "t1", 1.0));
        agent.add_task(task(&agent.id.clone(), "f1", "t2", 2.0));
        agent.check_accounting();
        assert_eq!(agent.used_resources[&framework_id].scalar("cpus"), 3.0);

        // Terminal transition releases resources but keeps the task.
        agent
            .get_task_mut(&framework_id, &TaskId::new("t1"))
            .unwrap()
            .state = TaskState::Finished;
        agent.task_terminated(&framework_id, &TaskId::new("t1"));
        assert_eq!(agent.used_resources[&framework_id].scalar("cpus"), 2.0);
        assert!(agent.get_task(&framework_id, &TaskId::new("t1")).is_some());
        agent.check_accounting();

        agent.remove_task(&framework_id, &TaskId::new("t1"));
        agent.remove_task(&framework_id, &TaskId::new("t2"));
        assert!(agent.used_resources.is_empty());
        agent.check_accounting();
    }

    #[test]
    fn test_executor_accounting() {
        let (mut agent, _rx) = agent("a1", "addr1");
        let framework_id = FrameworkId::new("f1");

        agent.add_executor(
            &framework_id,
            ExecutorInfo {
                executor_id: ExecutorId::new("e1"),
                framework_id: Some(framework_id.clone()),
                resources: Resources::cpus_mem(0.5, 128.0),
            },
        );
        assert!(agent.has_executor(&framework_id, &ExecutorId::new("e1")));
        assert_eq!(agent.used_resources[&framework_id].scalar("cpus"), 0.5);
        agent.check_accounting();

        agent.remove_executor(&framework_id, &ExecutorId::new("e1"));
        assert!(agent.used_resources.is_empty());
        agent.check_accounting();
    }

    #[test]
    fn test_available_resources() {
        let (mut agent, _rx) = agent("a1", "addr1");
        agent.add_task(task(&agent.id.clone(), "f1", "t1", 1.0));
        agent.add_offer(OfferId::new("o1"), &Resources::cpus_mem(2.0, 1024.0));

        let available = agent.available_resources();
        assert_eq!(available.scalar("cpus"), 1.0);

        agent.remove_offer(&OfferId::new("o1"), &Resources::cpus_mem(2.0, 1024.0));
        assert_eq!(agent.available_resources().scalar("cpus"), 3.0);
    }

    #[test]
    fn test_apply_operation_updates_checkpointed() {
        use crate::resources::{Operation, Reservation};

        let (mut agent, _rx) = agent("a1", "addr1");
        let reserved: Resources = std::iter::once(
            Resource::scalar("cpus", 2.0).reserved(Reservation::new("web", None)),
        )
        .collect();

        agent
            .apply_operation(&Operation::Reserve {
                resources: reserved.clone(),
            })
            .unwrap();

        assert_eq!(agent.checkpointed_resources, reserved);
        assert_eq!(agent.total_resources.scalar("cpus"), 4.0);
    }

    #[test]
    fn test_tombstone_cache_bounds() {
        let mut cache = TombstoneCache::new(2);
        cache.insert(AgentId::new("a1"));
        cache.insert(AgentId::new("a2"));
        cache.insert(AgentId::new("a3"));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&AgentId::new("a1")));
        assert!(cache.contains(&AgentId::new("a2")));
        assert!(cache.contains(&AgentId::new("a3")));
    }

    #[test]
    fn test_index_rebind_new_address_wins() {
        let mut agents = Agents::new(16, None);
        let (agent, _rx) = agent("a1", "addr1");
        let id = agent.id.clone();
        agents.put(agent);

        let (new_conn, _rx2) = connection("addr2");
        agents.rebind(&id, new_conn);

        assert!(agents.get_by_address(&Address::from("addr1")).is_none());
        assert_eq!(
            agents.get_by_address(&Address::from("addr2")).unwrap().id,
            id
        );
    }

    #[test]
    fn test_transitioning() {
        let mut agents = Agents::new(16, None);
        assert!(!agents.transitioning(None));

        let mut info = AgentInfo::new("host", Resources::cpus_mem(1.0, 512.0));
        info.id = Some(AgentId::new("a1"));
        agents.recovered.insert(AgentId::new("a1"), info);

        assert!(agents.transitioning(None));
        assert!(agents.transitioning(Some(&AgentId::new("a1"))));
        assert!(!agents.transitioning(Some(&AgentId::new("a2"))));
    }
}
