//! Offer operations and their application to resource bundles.

use super::bundle::{Resource, ResourceError, Resources};
use crate::messages::{ExecutorInfo, TaskInfo};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An operation a framework performs against offered resources.
///
/// `Reserve`/`Unreserve`/`Create`/`Destroy` are pure bundle
/// transformations; `Launch`/`LaunchGroup` consume resources and are
/// applied by the master's accept pipeline, not by [`Resources::apply`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Dynamically reserve unreserved resources for a role.
    Reserve { resources: Resources },

    /// Release a dynamic reservation back to the unreserved pool.
    Unreserve { resources: Resources },

    /// Create persistent volumes on reserved disk.
    Create { volumes: Resources },

    /// Destroy persistent volumes, returning the underlying disk.
    Destroy { volumes: Resources },

    /// Launch tasks against the offered resources.
    Launch { tasks: Vec<TaskInfo> },

    /// Launch a group of tasks sharing one executor, atomically.
    LaunchGroup {
        executor: ExecutorInfo,
        tasks: Vec<TaskInfo>,
    },
}

impl Operation {
    /// Short name used in logs and error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Reserve { .. } => "RESERVE",
            Operation::Unreserve { .. } => "UNRESERVE",
            Operation::Create { .. } => "CREATE",
            Operation::Destroy { .. } => "DESTROY",
            Operation::Launch { .. } => "LAUNCH",
            Operation::LaunchGroup { .. } => "LAUNCH_GROUP",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

impl Resources {
    /// Apply a resource operation, returning the transformed bundle.
    ///
    /// Launch operations are rejected here: consuming task resources is
    /// the accept pipeline's job because it also installs the task.
    pub fn apply(&self, operation: &Operation) -> Result<Resources, ResourceError> {
        match operation {
            Operation::Reserve { resources } => {
                let mut result = self.clone();
                for reserved in resources.iter() {
                    if reserved.reservation.is_none() {
                        return Err(ResourceError::Malformed(format!(
                            "RESERVE of {} carries no reservation",
                            reserved.name
                        )));
                    }

                    let unreserved = stripped(reserved);
                    result = result
                        .minus(&single(unreserved))
                        .map_err(|_| insufficient("RESERVE", &reserved.name))?;
                    result.add(reserved);
                }
                Ok(result)
            }

            Operation::Unreserve { resources } => {
                let mut result = self.clone();
                for reserved in resources.iter() {
                    if reserved.reservation.is_none() {
                        return Err(ResourceError::Malformed(format!(
                            "UNRESERVE of {} carries no reservation",
                            reserved.name
                        )));
                    }

                    result = result
                        .minus(&single(reserved.clone()))
                        .map_err(|_| insufficient("UNRESERVE", &reserved.name))?;
                    result.add(&stripped(reserved));
                }
                Ok(result)
            }

            Operation::Create { volumes } => {
                let mut result = self.clone();
                for volume in volumes.iter() {
                    if volume.name != "disk" || volume.volume.is_none() {
                        return Err(ResourceError::Malformed(format!(
                            "CREATE requires disk resources with a volume, got {}",
                            volume.name
                        )));
                    }

                    let mut plain = volume.clone();
                    plain.volume = None;
                    result = result
                        .minus(&single(plain))
                        .map_err(|_| insufficient("CREATE", &volume.name))?;
                    result.add(volume);
                }
                Ok(result)
            }

            Operation::Destroy { volumes } => {
                let mut result = self.clone();
                for volume in volumes.iter() {
                    if volume.volume.is_none() {
                        return Err(ResourceError::Malformed(
                            "DESTROY requires volume resources".to_string(),
                        ));
                    }

                    result = result
                        .minus(&single(volume.clone()))
                        .map_err(|_| insufficient("DESTROY", &volume.name))?;
                    let mut plain = volume.clone();
                    plain.volume = None;
                    result.add(&plain);
                }
                Ok(result)
            }

            Operation::Launch { .. } | Operation::LaunchGroup { .. } => Err(
                ResourceError::Unsupported(format!("{} is not a bundle transformation", operation)),
            ),
        }
    }
}

fn single(resource: Resource) -> Resources {
    std::iter::once(resource).collect()
}

fn stripped(resource: &Resource) -> Resource {
    let mut plain = resource.clone();
    plain.reservation = None;
    plain
}

fn insufficient(kind: &str, name: &str) -> ResourceError {
    ResourceError::Insufficient(format!("{} exceeds available {}", kind, name))
}
