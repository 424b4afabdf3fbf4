//! Resource bundles.
//!
//! A [`Resources`] value is a multiset of named resources (cpus, mem,
//! disk, ports, ...) with optional dynamic reservations and persistent
//! volumes attached. All arithmetic is pure: operations return new
//! bundles and never mutate in place, so callers can validate an
//! operation before committing to it.

mod bundle;
mod operation;

pub use bundle::{Reservation, Resource, ResourceError, Resources, Value, Volume};
pub use operation::Operation;

/// Tolerance used when comparing scalar resource quantities. Quantities
/// closer than this are considered equal, which keeps repeated
/// add/subtract cycles from accumulating float dust.
pub const SCALAR_EPSILON: f64 = 1e-9;
