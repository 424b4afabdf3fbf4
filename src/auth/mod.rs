//! Authentication and authorization contracts.
//!
//! Both are pluggable: the master only depends on the traits here and
//! suspends its handlers on their futures. The in-crate implementations
//! cover tests and single-node deployments.

mod authenticator;
mod authorizer;

pub use authenticator::{
    AuthenticationTracker, Authenticator, Credential, StaticAuthenticator,
};
pub use authorizer::{
    AclAuthorizer, Action, AuthorizationError, AuthorizationRequest, Authorizer,
    PermissiveAuthorizer,
};
