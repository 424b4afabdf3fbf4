//! Roles, weights, and quota.
//!
//! A role is the named bucket the allocator shares resources through.
//! Quota and weights attach at the role level but are stored here, in
//! the master, so an operator can configure a role before any framework
//! subscribes under it.

use crate::ids::FrameworkId;
use crate::resources::Resources;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A guaranteed minimum of resources for a role.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub guarantee: Resources,
}

/// A role with at least one subscribed framework.
#[derive(Clone, Debug, Default)]
pub struct Role {
    pub frameworks: HashSet<FrameworkId>,
}

/// Role bookkeeping for the master.
#[derive(Debug, Default)]
pub struct Roles {
    /// Roles with > 0 frameworks currently subscribed.
    active: HashMap<String, Role>,

    /// Quota per role; survives the role having no frameworks.
    quotas: HashMap<String, Quota>,

    /// Weight per role; absent roles weigh 1.0.
    weights: HashMap<String, f64>,
}

impl Roles {
    pub fn new(weights: HashMap<String, f64>) -> Self {
        Self {
            active: HashMap::new(),
            quotas: HashMap::new(),
            weights,
        }
    }

    /// Track a framework under a role. Returns true when the role
    /// became active (first framework).
    pub fn add_framework(&mut self, role: &str, framework_id: FrameworkId) -> bool {
        let entry = self.active.entry(role.to_string()).or_default();
        let first = entry.frameworks.is_empty();
        entry.frameworks.insert(framework_id);
        first
    }

    /// Untrack a framework. Returns true when the role became inactive
    /// (last framework left).
    pub fn remove_framework(&mut self, role: &str, framework_id: &FrameworkId) -> bool {
        if let Some(entry) = self.active.get_mut(role) {
            entry.frameworks.remove(framework_id);
            if entry.frameworks.is_empty() {
                self.active.remove(role);
                return true;
            }
        }
        false
    }

    pub fn is_active(&self, role: &str) -> bool {
        self.active.contains_key(role)
    }

    pub fn frameworks(&self, role: &str) -> Option<&HashSet<FrameworkId>> {
        self.active.get(role).map(|entry| &entry.frameworks)
    }

    pub fn active_roles(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn quota(&self, role: &str) -> Option<&Quota> {
        self.quotas.get(role)
    }

    pub fn set_quota(&mut self, role: &str, quota: Quota) {
        self.quotas.insert(role.to_string(), quota);
    }

    pub fn remove_quota(&mut self, role: &str) -> bool {
        self.quotas.remove(role).is_some()
    }

    pub fn quotas(&self) -> &HashMap<String, Quota> {
        &self.quotas
    }

    pub fn weight(&self, role: &str) -> f64 {
        self.weights.get(role).copied().unwrap_or(1.0)
    }

    pub fn update_weights(&mut self, updates: HashMap<String, f64>) {
        self.weights.extend(updates);
    }

    pub fn weights(&self) -> &HashMap<String, f64> {
        &self.weights
    }
}
