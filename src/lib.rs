//! Helmsman: a cluster-manager master.
//!
//! The master is the central authority mediating between
//! resource-offering agents (worker nodes) and resource-consuming
//! frameworks (schedulers). It owns the authoritative view of which
//! agents and frameworks exist, launches tasks and tracks their
//! lifecycle, records agent liveness durably in a registry, and
//! coordinates with a pluggable allocator that decides how free
//! resources are offered out.
//!
//! Everything runs behind a single actor; see [`master::Master`] for
//! the concurrency model and [`master::MasterHandle`] for the public
//! surface.

pub mod allocator;
pub mod auth;
pub mod config;
pub mod error;
pub mod ids;
pub mod machine;
pub mod master;
pub mod messages;
pub mod ratelimit;
pub mod registry;
pub mod resources;
pub mod role;

pub use config::MasterConfig;
pub use error::{Error, Result};
pub use master::{Master, MasterHandle};
