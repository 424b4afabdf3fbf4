//! The allocator contract and a baseline implementation.
//!
//! The allocation algorithm itself is pluggable; the master only tells
//! the allocator what exists and what changed, and the allocator hands
//! back offer proposals through a channel into the master's mailbox.

mod offer_all;

pub use offer_all::OfferAllAllocator;

use crate::config::MasterConfig;
use crate::ids::{AgentId, FrameworkId};
use crate::messages::scheduler::Filters;
use crate::messages::{AgentInfo, FrameworkInfo, Unavailability};
use crate::resources::{Operation, Resources};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A proposed set of offers for one framework.
#[derive(Clone, Debug, PartialEq)]
pub struct Allocation {
    pub framework_id: FrameworkId,
    pub resources: HashMap<AgentId, Resources>,
}

/// A proposed inverse offer: ask the framework to vacate an agent ahead
/// of its machine's unavailability window.
#[derive(Clone, Debug, PartialEq)]
pub struct InverseAllocation {
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub unavailability: Unavailability,
    pub resources: Resources,
}

/// Events the allocator emits toward the master.
#[derive(Clone, Debug, PartialEq)]
pub enum AllocationEvent {
    Offer(Allocation),
    InverseOffer(InverseAllocation),
}

/// Channel the allocator publishes allocations on.
pub type AllocationSender = mpsc::UnboundedSender<AllocationEvent>;

/// The allocator contract.
///
/// All methods are invoked from the master actor, serially. The
/// allocator must not call back synchronously; proposals go through the
/// sink handed to `initialize`, which feeds the master's mailbox.
pub trait Allocator: Send {
    fn initialize(&mut self, config: &MasterConfig, sink: AllocationSender);

    fn add_framework(
        &mut self,
        framework_id: &FrameworkId,
        info: &FrameworkInfo,
        used: HashMap<AgentId, Resources>,
        active: bool,
    );
    fn remove_framework(&mut self, framework_id: &FrameworkId);
    fn activate_framework(&mut self, framework_id: &FrameworkId);
    fn deactivate_framework(&mut self, framework_id: &FrameworkId);

    #[allow(clippy::too_many_arguments)]
    fn add_agent(
        &mut self,
        agent_id: &AgentId,
        info: &AgentInfo,
        unavailability: Option<Unavailability>,
        total: &Resources,
        used: HashMap<FrameworkId, Resources>,
    );
    fn remove_agent(&mut self, agent_id: &AgentId);
    fn activate_agent(&mut self, agent_id: &AgentId);
    fn deactivate_agent(&mut self, agent_id: &AgentId);
    fn update_agent(&mut self, agent_id: &AgentId, total: &Resources);
    fn update_unavailability(
        &mut self,
        agent_id: &AgentId,
        unavailability: Option<Unavailability>,
    );

    fn add_role(&mut self, role: &str);
    fn remove_role(&mut self, role: &str);
    fn update_weights(&mut self, weights: &HashMap<String, f64>);
    fn set_quota(&mut self, role: &str, quota: &Resources);
    fn remove_quota(&mut self, role: &str);

    /// Operations a framework's accept applied on an agent.
    fn update_allocation(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        operations: &[Operation],
    );

    /// Offered resources came back unused (decline, rescind, leftovers).
    fn recover_resources(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        resources: &Resources,
        filters: Option<&Filters>,
    );

    /// A framework's non-binding resource request.
    fn request_resources(&mut self, _framework_id: &FrameworkId, _requests: &[Resources]) {}

    fn suppress_offers(&mut self, framework_id: &FrameworkId);
    fn revive_offers(&mut self, framework_id: &FrameworkId);
}
