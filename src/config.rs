//! Configuration for a master instance.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Rate limit for one framework principal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub principal: String,
    /// Calls per second admitted for this principal. `None` means
    /// unlimited.
    pub qps: Option<f64>,
    /// Maximum number of calls waiting for a token before further calls
    /// are dropped. `None` means unbounded queueing.
    pub capacity: Option<usize>,
}

/// Configuration for starting a master.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Hostname advertised to agents and frameworks.
    pub hostname: String,

    /// How long agents recovered from the registry have to re-register
    /// after a master failover before being marked unreachable.
    pub agent_reregister_timeout: Duration,

    /// Failover timeout applied to frameworks that do not declare one.
    pub framework_failover_timeout: Duration,

    /// How long an offer stays outstanding before it is rescinded.
    /// `None` disables offer expiry.
    pub offer_timeout: Option<Duration>,

    /// Bound on the completed-frameworks ring.
    pub max_completed_frameworks: usize,

    /// Bound on each framework's completed-tasks ring.
    pub max_completed_tasks_per_framework: usize,

    /// Bound on the removed-agents tombstone cache.
    pub max_removed_agents: usize,

    /// How often the registry garbage collector runs.
    pub registry_gc_interval: Duration,

    /// Unreachable agents beyond this count are pruned, oldest first.
    pub registry_max_agent_count: usize,

    /// Unreachable agents older than this are pruned.
    pub registry_max_agent_age: Duration,

    /// When true, agents the registry does not know are refused
    /// re-registration instead of being readmitted.
    pub registry_strict: bool,

    /// When set, frameworks may only subscribe under these roles.
    pub role_whitelist: Option<HashSet<String>>,

    /// Relative share per role when dividing surplus; absent roles
    /// weigh 1.0.
    pub weights: HashMap<String, f64>,

    /// Per-principal rate limits.
    pub rate_limits: Vec<RateLimit>,

    /// Limit applied to principals without an explicit entry, and to
    /// unauthenticated connections.
    pub default_rate_limit: Option<RateLimit>,

    /// Refuse framework registration without an authenticated principal.
    pub authentication_required: bool,

    /// How long an authentication attempt may stay pending.
    pub authentication_timeout: Duration,

    /// Interval between heartbeats on streaming connections.
    pub heartbeat_interval: Duration,

    /// Permits per second for marking unhealthy agents unreachable.
    /// Throttles removal storms during network blips. `None` disables
    /// throttling.
    pub agent_removal_rate_limit: Option<f64>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            agent_reregister_timeout: Duration::from_secs(10 * 60),
            framework_failover_timeout: Duration::from_secs(0),
            offer_timeout: None,
            max_completed_frameworks: 50,
            max_completed_tasks_per_framework: 1000,
            max_removed_agents: 100_000,
            registry_gc_interval: Duration::from_secs(15 * 60),
            registry_max_agent_count: 100_000,
            registry_max_agent_age: Duration::from_secs(14 * 24 * 60 * 60),
            registry_strict: false,
            role_whitelist: None,
            weights: HashMap::new(),
            rate_limits: Vec::new(),
            default_rate_limit: None,
            authentication_required: false,
            authentication_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            agent_removal_rate_limit: None,
        }
    }
}

impl MasterConfig {
    /// A configuration suited to tests: short timeouts, small rings.
    pub fn for_tests() -> Self {
        Self {
            agent_reregister_timeout: Duration::from_millis(200),
            registry_gc_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(50),
            max_completed_frameworks: 4,
            max_completed_tasks_per_framework: 8,
            max_removed_agents: 8,
            ..Self::default()
        }
    }

    /// The rate limit applying to `principal`, falling back to the
    /// default limiter.
    pub fn rate_limit_for(&self, principal: Option<&str>) -> Option<&RateLimit> {
        principal
            .and_then(|p| self.rate_limits.iter().find(|limit| limit.principal == p))
            .or(self.default_rate_limit.as_ref())
    }

    /// Whether `role` may be used for subscription.
    pub fn role_allowed(&self, role: &str) -> bool {
        match &self.role_whitelist {
            Some(whitelist) => whitelist.contains(role),
            None => true,
        }
    }

    /// The weight configured for `role`.
    pub fn weight(&self, role: &str) -> f64 {
        self.weights.get(role).copied().unwrap_or(1.0)
    }
}
