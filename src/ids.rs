//! Identifier newtypes used across the master.
//!
//! All ids are opaque strings. Agent ids are prefixed with the master's
//! own uuid so that ids minted by different master incarnations cannot
//! collide.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id! {
    /// Stable agent identity, assigned by the master on first admission.
    AgentId
}

string_id! {
    /// Stable framework identity, issued by the master at first registration.
    FrameworkId
}

string_id! {
    /// Identity of a single resource offer (or inverse offer).
    OfferId
}

string_id! {
    /// Framework-chosen task identity, unique within the framework.
    TaskId
}

string_id! {
    /// Framework-chosen executor identity, unique per agent.
    ExecutorId
}

/// Identity of a physical or logical host. Two agents on the same host
/// share a machine id, which is what maintenance schedules refer to.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineId {
    pub hostname: String,
    pub ip: String,
}

impl MachineId {
    pub fn new(hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ip: ip.into(),
        }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.ip)
    }
}

/// Opaque transport address of a remote endpoint (agent or framework).
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_roundtrip() {
        let id = AgentId::new("abc-S0");
        assert_eq!(id.to_string(), "abc-S0");
        assert_eq!(AgentId::from("abc-S0"), id);
    }

    #[test]
    fn test_machine_id_display() {
        let machine = MachineId::new("host1", "10.0.0.1");
        assert_eq!(machine.to_string(), "host1 (10.0.0.1)");
    }
}
