//! The master actor and its in-memory state.
//!
//! One task owns everything here; all mutation happens serially inside
//! the mailbox loop in [`master`]. External work (registry commits,
//! authorization, authentication) is awaited on spawned tasks that post
//! continuation messages back into the mailbox, and every continuation
//! re-validates the entities it touches by id.

mod agent;
mod framework;
#[allow(clippy::module_inception)]
mod master;
mod offer;
mod subscribers;

pub use agent::{Agent, AgentConnection, Agents, Task, TombstoneCache};
pub use framework::{CompletedFramework, Framework, FrameworkConnection, Frameworks};
pub use master::{
    AgentSummary, FrameworkSummary, Master, MasterHandle, Metrics, OperatorOp,
    OperatorResponse, RoleSummary, StateSnapshot, TaskSummary,
};
pub use offer::OfferLedger;
pub use subscribers::Subscribers;
