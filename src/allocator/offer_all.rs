//! A baseline allocator that offers every agent's free resources to
//! active frameworks in round-robin order.
//!
//! Not fair, not quota-aware: it exists so the master runs end-to-end
//! without a production allocator, and it honors the parts of the
//! contract the master depends on (activity, suppression, filters,
//! accurate free-resource tracking).

use super::{Allocation, AllocationEvent, AllocationSender, Allocator, InverseAllocation};
use crate::config::MasterConfig;
use crate::ids::{AgentId, FrameworkId};
use crate::messages::scheduler::Filters;
use crate::messages::{AgentInfo, FrameworkInfo, Unavailability};
use crate::resources::{Operation, Resources};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug)]
struct AgentState {
    total: Resources,
    /// Resources currently used by tasks/executors or sitting in
    /// outstanding offers.
    allocated: Resources,
    unavailability: Option<Unavailability>,
    active: bool,
}

impl AgentState {
    fn free(&self) -> Resources {
        let mut free = self.total.clone();
        free.subtract_all(&self.allocated);
        free
    }
}

#[derive(Debug)]
struct FrameworkState {
    active: bool,
    suppressed: bool,
}

/// See the module docs.
#[derive(Default)]
pub struct OfferAllAllocator {
    sink: Option<AllocationSender>,
    agents: HashMap<AgentId, AgentState>,
    frameworks: HashMap<FrameworkId, FrameworkState>,
    /// Round-robin order of frameworks; rotated on every allocation.
    rotation: Vec<FrameworkId>,
    /// Declined (framework, agent) pairs and when the refusal expires.
    filters: HashMap<(FrameworkId, AgentId), Instant>,
}

impl OfferAllAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer each agent's free resources to the first eligible
    /// framework in rotation.
    fn allocate(&mut self) {
        let sink = match &self.sink {
            Some(sink) => sink.clone(),
            None => return,
        };

        let now = Instant::now();
        self.filters.retain(|_, expires| *expires > now);

        let mut proposals: HashMap<FrameworkId, HashMap<AgentId, Resources>> = HashMap::new();

        let agent_ids: Vec<AgentId> = self.agents.keys().cloned().collect();
        for agent_id in agent_ids {
            let free = {
                let agent = &self.agents[&agent_id];
                if !agent.active {
                    continue;
                }
                let free = agent.free();
                if free.is_empty() {
                    continue;
                }
                free
            };

            let chosen = self.rotation.iter().position(|framework_id| {
                let state = &self.frameworks[framework_id];
                state.active
                    && !state.suppressed
                    && !self
                        .filters
                        .contains_key(&(framework_id.clone(), agent_id.clone()))
            });

            if let Some(index) = chosen {
                let framework_id = self.rotation.remove(index);
                self.rotation.push(framework_id.clone());

                if let Some(agent) = self.agents.get_mut(&agent_id) {
                    agent.allocated.add_all(&free);
                }
                proposals
                    .entry(framework_id)
                    .or_default()
                    .insert(agent_id, free);
            }
        }

        for (framework_id, resources) in proposals {
            let _ = sink.send(AllocationEvent::Offer(Allocation {
                framework_id,
                resources,
            }));
        }
    }

    fn emit_inverse_offers(&mut self, agent_id: &AgentId) {
        let sink = match &self.sink {
            Some(sink) => sink.clone(),
            None => return,
        };

        let (unavailability, allocated) = match self.agents.get(agent_id) {
            Some(agent) => match agent.unavailability {
                Some(unavailability) => (unavailability, agent.allocated.clone()),
                None => return,
            },
            None => return,
        };

        // Every active framework is asked to vacate; the resources named
        // are whatever is currently allocated on the agent.
        for (framework_id, state) in &self.frameworks {
            if state.active {
                let _ = sink.send(AllocationEvent::InverseOffer(InverseAllocation {
                    framework_id: framework_id.clone(),
                    agent_id: agent_id.clone(),
                    unavailability,
                    resources: allocated.clone(),
                }));
            }
        }
    }
}

impl Allocator for OfferAllAllocator {
    fn initialize(&mut self, _config: &MasterConfig, sink: AllocationSender) {
        self.sink = Some(sink);
    }

    fn add_framework(
        &mut self,
        framework_id: &FrameworkId,
        _info: &FrameworkInfo,
        used: HashMap<AgentId, Resources>,
        active: bool,
    ) {
        self.frameworks.insert(
            framework_id.clone(),
            FrameworkState {
                active,
                suppressed: false,
            },
        );
        self.rotation.push(framework_id.clone());

        for (agent_id, resources) in used {
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                agent.allocated.add_all(&resources);
            }
        }

        self.allocate();
    }

    fn remove_framework(&mut self, framework_id: &FrameworkId) {
        self.frameworks.remove(framework_id);
        self.rotation.retain(|id| id != framework_id);
        self.filters.retain(|(id, _), _| id != framework_id);
    }

    fn activate_framework(&mut self, framework_id: &FrameworkId) {
        if let Some(state) = self.frameworks.get_mut(framework_id) {
            state.active = true;
        }
        self.allocate();
    }

    fn deactivate_framework(&mut self, framework_id: &FrameworkId) {
        if let Some(state) = self.frameworks.get_mut(framework_id) {
            state.active = false;
        }
    }

    fn add_agent(
        &mut self,
        agent_id: &AgentId,
        _info: &AgentInfo,
        unavailability: Option<Unavailability>,
        total: &Resources,
        used: HashMap<FrameworkId, Resources>,
    ) {
        let mut allocated = Resources::new();
        for resources in used.values() {
            allocated.add_all(resources);
        }

        self.agents.insert(
            agent_id.clone(),
            AgentState {
                total: total.clone(),
                allocated,
                unavailability,
                active: true,
            },
        );

        self.allocate();
    }

    fn remove_agent(&mut self, agent_id: &AgentId) {
        self.agents.remove(agent_id);
        self.filters.retain(|(_, id), _| id != agent_id);
    }

    fn activate_agent(&mut self, agent_id: &AgentId) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.active = true;
        }
        self.allocate();
    }

    fn deactivate_agent(&mut self, agent_id: &AgentId) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.active = false;
        }
    }

    fn update_agent(&mut self, agent_id: &AgentId, total: &Resources) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.total = total.clone();
        }
        self.allocate();
    }

    fn update_unavailability(
        &mut self,
        agent_id: &AgentId,
        unavailability: Option<Unavailability>,
    ) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.unavailability = unavailability;
        }
        self.emit_inverse_offers(agent_id);
    }

    fn add_role(&mut self, _role: &str) {}
    fn remove_role(&mut self, _role: &str) {}
    fn update_weights(&mut self, _weights: &HashMap<String, f64>) {}
    fn set_quota(&mut self, _role: &str, _quota: &Resources) {}
    fn remove_quota(&mut self, _role: &str) {}

    fn update_allocation(
        &mut self,
        _framework_id: &FrameworkId,
        agent_id: &AgentId,
        operations: &[Operation],
    ) {
        // Reservations and volumes change the agent's total view.
        if let Some(agent) = self.agents.get_mut(agent_id) {
            for operation in operations {
                if let Ok(total) = agent.total.apply(operation) {
                    agent.total = total;
                }
            }
        }
    }

    fn recover_resources(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        resources: &Resources,
        filters: Option<&Filters>,
    ) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.allocated.subtract_all(resources);
        }

        if let Some(filters) = filters {
            if !filters.refuse.is_zero() {
                self.filters.insert(
                    (framework_id.clone(), agent_id.clone()),
                    Instant::now() + filters.refuse,
                );
            }
        }

        self.allocate();
    }

    fn suppress_offers(&mut self, framework_id: &FrameworkId) {
        if let Some(state) = self.frameworks.get_mut(framework_id) {
            state.suppressed = true;
        }
    }

    fn revive_offers(&mut self, framework_id: &FrameworkId) {
        self.filters.retain(|(id, _), _| id != framework_id);
        if let Some(state) = self.frameworks.get_mut(framework_id) {
            state.suppressed = false;
        }
        self.allocate();
    }
}
