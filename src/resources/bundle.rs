//! The resource value model and bundle arithmetic.

use super::SCALAR_EPSILON;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The quantity carried by a resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// A fractional amount (cpus, mem in MB, disk in MB, gpus).
    Scalar(f64),

    /// A set of disjoint inclusive integer ranges (ports).
    Ranges(Vec<(u64, u64)>),

    /// A set of distinct items.
    Set(BTreeSet<String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(s) => *s < SCALAR_EPSILON,
            Value::Ranges(ranges) => ranges.is_empty(),
            Value::Set(items) => items.is_empty(),
        }
    }
}

/// A dynamic reservation: the resource is pinned to a role, optionally
/// on behalf of a principal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reservation {
    pub role: String,
    pub principal: Option<String>,
}

impl Reservation {
    pub fn new(role: impl Into<String>, principal: Option<String>) -> Self {
        Self {
            role: role.into(),
            principal,
        }
    }
}

/// A persistent volume carved out of reserved disk.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub container_path: String,
}

/// One named resource with an optional reservation and volume.
///
/// Two resources are mergeable when the name, reservation, and volume
/// all match; bundle arithmetic only ever combines mergeable entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: Value,
    pub reservation: Option<Reservation>,
    pub volume: Option<Volume>,
}

impl Resource {
    pub fn scalar(name: impl Into<String>, amount: f64) -> Self {
        Self {
            name: name.into(),
            value: Value::Scalar(amount),
            reservation: None,
            volume: None,
        }
    }

    pub fn ranges(name: impl Into<String>, ranges: Vec<(u64, u64)>) -> Self {
        Self {
            name: name.into(),
            value: Value::Ranges(normalize_ranges(ranges)),
            reservation: None,
            volume: None,
        }
    }

    pub fn set(name: impl Into<String>, items: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Set(items.into_iter().collect()),
            reservation: None,
            volume: None,
        }
    }

    pub fn reserved(mut self, reservation: Reservation) -> Self {
        self.reservation = Some(reservation);
        self
    }

    pub fn with_volume(mut self, volume: Volume) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Whether this resource must be checkpointed by the agent: dynamic
    /// reservations and persistent volumes survive agent restarts.
    pub fn needs_checkpointing(&self) -> bool {
        self.reservation.is_some() || self.volume.is_some()
    }

    fn mergeable_with(&self, other: &Resource) -> bool {
        self.name == other.name
            && self.reservation == other.reservation
            && self.volume == other.volume
    }
}

/// Errors raised by bundle arithmetic and operation application.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceError {
    /// Subtraction or an operation required more than the bundle holds.
    Insufficient(String),

    /// Two values of the same resource name disagree on kind.
    KindMismatch(String),

    /// The operation payload is malformed (e.g. a reserve without a
    /// reservation, a volume on a non-disk resource).
    Malformed(String),

    /// The operation kind cannot be applied to a bundle directly.
    Unsupported(String),
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::Insufficient(msg) => write!(f, "Insufficient resources: {}", msg),
            ResourceError::KindMismatch(msg) => write!(f, "Resource kind mismatch: {}", msg),
            ResourceError::Malformed(msg) => write!(f, "Malformed operation: {}", msg),
            ResourceError::Unsupported(msg) => write!(f, "Unsupported operation: {}", msg),
        }
    }
}

impl std::error::Error for ResourceError {}

/// A multiset of resources.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources(Vec<Resource>);

impl Resources {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Convenience constructor for the common cpus/mem pair.
    pub fn cpus_mem(cpus: f64, mem: f64) -> Self {
        let mut resources = Resources::new();
        resources.add(&Resource::scalar("cpus", cpus));
        resources.add(&Resource::scalar("mem", mem));
        resources
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.iter()
    }

    /// Total scalar quantity for a resource name, 0.0 when absent.
    pub fn scalar(&self, name: &str) -> f64 {
        self.0
            .iter()
            .filter(|r| r.name == name)
            .filter_map(|r| match r.value {
                Value::Scalar(s) => Some(s),
                _ => None,
            })
            .sum()
    }

    /// The subset of resources the agent must checkpoint (reservations
    /// and persistent volumes).
    pub fn checkpointed(&self) -> Resources {
        self.filter(|r| r.needs_checkpointing())
    }

    /// The subset containing only scalar-valued resources. Whole-cluster
    /// totals are only meaningful for scalars; ranges and sets lose
    /// identity when summed across agents.
    pub fn scalars(&self) -> Resources {
        self.filter(|r| matches!(r.value, Value::Scalar(_)))
    }

    pub fn filter(&self, predicate: impl Fn(&Resource) -> bool) -> Resources {
        Resources(self.0.iter().filter(|r| predicate(r)).cloned().collect())
    }

    /// Add one resource, merging into an existing mergeable entry.
    pub fn add(&mut self, resource: &Resource) {
        if resource.value.is_empty() {
            return;
        }

        for existing in &mut self.0 {
            if existing.mergeable_with(resource) {
                match (&mut existing.value, &resource.value) {
                    (Value::Scalar(a), Value::Scalar(b)) => {
                        *a += b;
                        return;
                    }
                    (Value::Ranges(a), Value::Ranges(b)) => {
                        let mut merged = a.clone();
                        merged.extend(b.iter().copied());
                        *a = normalize_ranges(merged);
                        return;
                    }
                    (Value::Set(a), Value::Set(b)) => {
                        a.extend(b.iter().cloned());
                        return;
                    }
                    _ => {
                        // Same name but different kind: keep both entries
                        // rather than guessing. contains() will fail on
                        // the mismatch if anyone relies on it.
                    }
                }
            }
        }

        self.0.push(resource.clone());
    }

    /// Add a whole bundle.
    pub fn add_all(&mut self, other: &Resources) {
        for resource in &other.0 {
            self.add(resource);
        }
    }

    /// `self + other` without mutation.
    pub fn plus(&self, other: &Resources) -> Resources {
        let mut result = self.clone();
        result.add_all(other);
        result
    }

    /// Remove `other` from `self`, failing when `self` does not contain
    /// it. Empty entries are dropped from the result.
    pub fn minus(&self, other: &Resources) -> Result<Resources, ResourceError> {
        if !self.contains(other) {
            return Err(ResourceError::Insufficient(format!(
                "cannot subtract {} from {}",
                other, self
            )));
        }

        let mut result = self.clone();
        for resource in &other.0 {
            result.subtract_one(resource)?;
        }
        result.0.retain(|r| !r.value.is_empty());
        Ok(result)
    }

    /// Like [`Resources::minus`] but silently clamps at empty. Used for
    /// bookkeeping counters where the caller has already validated.
    pub fn subtract_all(&mut self, other: &Resources) {
        for resource in &other.0 {
            let _ = self.subtract_one(resource);
        }
        self.0.retain(|r| !r.value.is_empty());
    }

    fn subtract_one(&mut self, resource: &Resource) -> Result<(), ResourceError> {
        for existing in &mut self.0 {
            if existing.mergeable_with(resource) {
                match (&mut existing.value, &resource.value) {
                    (Value::Scalar(a), Value::Scalar(b)) => {
                        *a = (*a - b).max(0.0);
                        return Ok(());
                    }
                    (Value::Ranges(a), Value::Ranges(b)) => {
                        *a = subtract_ranges(a, b);
                        return Ok(());
                    }
                    (Value::Set(a), Value::Set(b)) => {
                        for item in b {
                            a.remove(item);
                        }
                        return Ok(());
                    }
                    _ => {
                        return Err(ResourceError::KindMismatch(resource.name.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether this bundle covers `other` entirely.
    pub fn contains(&self, other: &Resources) -> bool {
        other.0.iter().all(|needed| self.contains_one(needed))
    }

    fn contains_one(&self, needed: &Resource) -> bool {
        if needed.value.is_empty() {
            return true;
        }

        for existing in &self.0 {
            if existing.mergeable_with(needed) {
                match (&existing.value, &needed.value) {
                    (Value::Scalar(have), Value::Scalar(want)) => {
                        return *have + SCALAR_EPSILON >= *want;
                    }
                    (Value::Ranges(have), Value::Ranges(want)) => {
                        return ranges_contain(have, want);
                    }
                    (Value::Set(have), Value::Set(want)) => {
                        return want.is_subset(have);
                    }
                    _ => return false,
                }
            }
        }

        false
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }

        let mut first = true;
        for resource in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;

            write!(f, "{}", resource.name)?;
            if let Some(reservation) = &resource.reservation {
                write!(f, "(reserved:{})", reservation.role)?;
            }
            if let Some(volume) = &resource.volume {
                write!(f, "[{}]", volume.id)?;
            }
            match &resource.value {
                Value::Scalar(s) => write!(f, ":{}", s)?,
                Value::Ranges(ranges) => {
                    write!(f, ":[")?;
                    for (i, (lo, hi)) in ranges.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{}-{}", lo, hi)?;
                    }
                    write!(f, "]")?;
                }
                Value::Set(items) => {
                    write!(f, ":{{")?;
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{}", item)?;
                    }
                    write!(f, "}}")?;
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        let mut resources = Resources::new();
        for resource in iter {
            resources.add(&resource);
        }
        resources
    }
}

/// Sort, then merge adjacent/overlapping inclusive ranges.
fn normalize_ranges(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.retain(|(lo, hi)| lo <= hi);
    ranges.sort_unstable();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (lo, hi) in ranges {
        match merged.last_mut() {
            Some((_, prev_hi)) if lo <= prev_hi.saturating_add(1) => {
                *prev_hi = (*prev_hi).max(hi);
            }
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

fn ranges_contain(have: &[(u64, u64)], want: &[(u64, u64)]) -> bool {
    want.iter()
        .all(|(lo, hi)| have.iter().any(|(have_lo, have_hi)| have_lo <= lo && hi <= have_hi))
}

fn subtract_ranges(have: &[(u64, u64)], remove: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut result = have.to_vec();
    for &(remove_lo, remove_hi) in remove {
        let mut next = Vec::with_capacity(result.len() + 1);
        for (lo, hi) in result {
            if remove_hi < lo || hi < remove_lo {
                next.push((lo, hi));
                continue;
            }
            if lo < remove_lo {
                next.push((lo, remove_lo - 1));
            }
            if remove_hi < hi {
                next.push((remove_hi + 1, hi));
            }
        }
        result = next;
    }
    result
}
