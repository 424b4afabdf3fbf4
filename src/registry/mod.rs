//! The durable agent registry.
//!
//! Everything that must survive a master failover lives here: the list
//! of admitted agents and the list of unreachable agents. Mutations are
//! expressed as [`RegistryOperation`] values applied serially by the
//! [`Registrar`], which persists the result before reporting commit.

mod registrar;
mod state;
mod storage;

pub use registrar::{Registrar, RegistrarHandle};
pub use state::{Registry, RegistryError, RegistryOperation, UnreachableAgent};
pub use storage::{MemoryStorage, RegistryStorage, StorageError};
