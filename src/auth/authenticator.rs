//! Authentication of remote endpoints.

use crate::ids::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A credential presented by a connecting endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub principal: String,
    pub secret: String,
}

/// The authenticator contract. `Ok(Some(principal))` authenticates,
/// `Ok(None)` rejects, `Err` is a transient failure the endpoint may
/// retry.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        address: &Address,
        credential: &Credential,
    ) -> Result<Option<String>, String>;
}

/// Authenticates against a static credential table.
#[derive(Clone, Debug, Default)]
pub struct StaticAuthenticator {
    secrets: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(mut self, principal: &str, secret: &str) -> Self {
        self.secrets.insert(principal.to_string(), secret.to_string());
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        _address: &Address,
        credential: &Credential,
    ) -> Result<Option<String>, String> {
        match self.secrets.get(&credential.principal) {
            Some(secret) if *secret == credential.secret => {
                Ok(Some(credential.principal.clone()))
            }
            _ => Ok(None),
        }
    }
}

/// Tracks in-flight authentication attempts per remote endpoint.
///
/// A new attempt from the same address supersedes the old one: the
/// stale attempt's completion is recognized by its generation and
/// ignored. Completed principals stay recorded until the endpoint
/// disconnects.
#[derive(Debug, Default)]
pub struct AuthenticationTracker {
    pending: HashMap<Address, u64>,
    authenticated: HashMap<Address, String>,
    next_generation: u64,
}

impl AuthenticationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin an attempt for `address`, superseding any pending one.
    /// Returns the generation the completion must present.
    pub fn begin(&mut self, address: Address) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.pending.insert(address, generation);
        generation
    }

    /// Record a completed attempt. Returns false when the attempt was
    /// superseded or the endpoint is gone; the caller discards the
    /// result.
    pub fn complete(
        &mut self,
        address: &Address,
        generation: u64,
        principal: Option<String>,
    ) -> bool {
        match self.pending.get(address) {
            Some(current) if *current == generation => {
                self.pending.remove(address);
                match principal {
                    Some(principal) => {
                        self.authenticated.insert(address.clone(), principal);
                    }
                    None => {
                        self.authenticated.remove(address);
                    }
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, address: &Address) -> bool {
        self.pending.contains_key(address)
    }

    pub fn principal(&self, address: &Address) -> Option<&str> {
        self.authenticated.get(address).map(String::as_str)
    }

    /// Forget everything about a disconnected endpoint.
    pub fn disconnected(&mut self, address: &Address) {
        self.pending.remove(address);
        self.authenticated.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_authenticator() {
        let authenticator = StaticAuthenticator::new().with_credential("alice", "s3cret");
        let address = Address::from("framework-1");

        let good = Credential {
            principal: "alice".to_string(),
            secret: "s3cret".to_string(),
        };
        assert_eq!(
            authenticator.authenticate(&address, &good).await.unwrap(),
            Some("alice".to_string())
        );

        let bad = Credential {
            principal: "alice".to_string(),
            secret: "wrong".to_string(),
        };
        assert_eq!(authenticator.authenticate(&address, &bad).await.unwrap(), None);
    }

    #[test]
    fn test_tracker_supersedes_pending_attempts() {
        let mut tracker = AuthenticationTracker::new();
        let address = Address::from("framework-1");

        let first = tracker.begin(address.clone());
        let second = tracker.begin(address.clone());

        // The first attempt completed after being superseded: ignored.
        assert!(!tracker.complete(&address, first, Some("alice".to_string())));
        assert_eq!(tracker.principal(&address), None);

        assert!(tracker.complete(&address, second, Some("bob".to_string())));
        assert_eq!(tracker.principal(&address), Some("bob"));
        assert!(!tracker.is_pending(&address));
    }

    #[test]
    fn test_tracker_rejection_clears_principal() {
        let mut tracker = AuthenticationTracker::new();
        let address = Address::from("framework-1");

        let generation = tracker.begin(address.clone());
        assert!(tracker.complete(&address, generation, Some("alice".to_string())));

        let generation = tracker.begin(address.clone());
        assert!(tracker.complete(&address, generation, None));
        assert_eq!(tracker.principal(&address), None);
    }

    #[test]
    fn test_tracker_disconnect() {
        let mut tracker = AuthenticationTracker::new();
        let address = Address::from("framework-1");

        let generation = tracker.begin(address.clone());
        tracker.disconnected(&address);
        assert!(!tracker.complete(&address, generation, Some("alice".to_string())));
    }
}
