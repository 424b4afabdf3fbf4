//! Authorization of framework and operator actions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// The action being authorized.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Register a framework under a role.
    RegisterFramework { role: String },
    /// Tear down a framework.
    Teardown { framework_user: String },
    /// Launch a task as a user.
    RunTask { user: String },
    /// Reserve resources for a role.
    ReserveResources { role: String },
    /// Release a dynamic reservation made by a principal.
    UnreserveResources { reserver_principal: Option<String> },
    /// Create a persistent volume for a role.
    CreateVolume { role: String },
    /// Destroy a volume created by a principal.
    DestroyVolume { creator_principal: Option<String> },
    /// Read quota for a role.
    GetQuota { role: String },
    /// Set or remove quota for a role.
    UpdateQuota { role: String },
    /// Change role weights.
    UpdateWeights { roles: Vec<String> },
    /// Read master state (operator endpoints, event stream).
    ViewState,
    /// Change the maintenance schedule or machine state.
    UpdateMaintenance,
    /// Remove an agent from the cluster.
    RemoveAgent,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::RegisterFramework { .. } => "REGISTER_FRAMEWORK",
            Action::Teardown { .. } => "TEARDOWN",
            Action::RunTask { .. } => "RUN_TASK",
            Action::ReserveResources { .. } => "RESERVE_RESOURCES",
            Action::UnreserveResources { .. } => "UNRESERVE_RESOURCES",
            Action::CreateVolume { .. } => "CREATE_VOLUME",
            Action::DestroyVolume { .. } => "DESTROY_VOLUME",
            Action::GetQuota { .. } => "GET_QUOTA",
            Action::UpdateQuota { .. } => "UPDATE_QUOTA",
            Action::UpdateWeights { .. } => "UPDATE_WEIGHTS",
            Action::ViewState => "VIEW_STATE",
            Action::UpdateMaintenance => "UPDATE_MAINTENANCE",
            Action::RemoveAgent => "REMOVE_AGENT",
        }
    }
}

/// One authorization question: may `principal` perform `action`?
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub principal: Option<String>,
    pub action: Action,
}

/// A transient authorizer failure. Distinct from denial: the caller
/// dropped the request and may retry, nothing was decided.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthorizationError(pub String);

impl fmt::Display for AuthorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Authorization failed: {}", self.0)
    }
}

impl std::error::Error for AuthorizationError {}

/// The authorizer contract.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(true)` grants, `Ok(false)` denies, `Err` is transient.
    async fn authorize(&self, request: AuthorizationRequest)
        -> Result<bool, AuthorizationError>;
}

/// Grants everything. The default when no authorizer is configured.
#[derive(Clone, Debug, Default)]
pub struct PermissiveAuthorizer;

#[async_trait]
impl Authorizer for PermissiveAuthorizer {
    async fn authorize(
        &self,
        _request: AuthorizationRequest,
    ) -> Result<bool, AuthorizationError> {
        Ok(true)
    }
}

/// A small deny-list authorizer: every (principal, action kind) pair on
/// the list is denied, everything else granted. Unknown principals are
/// matched by `None`.
#[derive(Clone, Debug, Default)]
pub struct AclAuthorizer {
    denied: HashSet<(Option<String>, String)>,
}

impl AclAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, principal: Option<&str>, action_kind: &str) -> Self {
        self.denied
            .insert((principal.map(str::to_string), action_kind.to_string()));
        self
    }
}

#[async_trait]
impl Authorizer for AclAuthorizer {
    async fn authorize(
        &self,
        request: AuthorizationRequest,
    ) -> Result<bool, AuthorizationError> {
        let key = (request.principal.clone(), request.action.kind().to_string());
        Ok(!self.denied.contains(&key))
    }
}
