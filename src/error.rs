//! Error types for the master core.

use crate::registry::RegistryError;
use crate::resources::ResourceError;
use thiserror::Error;

/// Result type for master operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the master.
///
/// Handlers never unwind past the actor boundary: every variant here is
/// either replied to the caller as an error event or logged and
/// absorbed. `RegistryUnavailable` is the one fatal case; it stops the
/// master loop so a standby can take over with intact state.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request, unknown or duplicate id, impossible resource
    /// arithmetic. State is unchanged.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The authorizer said no. State is unchanged.
    #[error("Not authorized: {0}")]
    AuthorizationDenied(String),

    /// The authorizer could not answer; the caller may retry.
    #[error("Authorization unavailable: {0}")]
    AuthorizationUnavailable(String),

    /// A registry precondition was violated by a concurrent commit.
    #[error(transparent)]
    RegistryConflict(RegistryError),

    /// The registry cannot commit; leadership must be abdicated.
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The caller exceeded its rate-limit queue capacity.
    #[error("Capacity exceeded for principal '{principal}'")]
    RateLimitExceeded { principal: String },

    /// Resource arithmetic failed.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The master has shut down.
    #[error("Master terminated")]
    Terminated,
}

impl From<RegistryError> for Error {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::Unavailable(msg) => Error::RegistryUnavailable(msg),
            other => Error::RegistryConflict(other),
        }
    }
}
