//! Domain identifiers (strongly-typed IDs).
//!
//! Both identifiers are ULIDs behind a phantom-typed wrapper, so a task id
//! and a fencing uid cannot be mixed up at compile time. ULIDs sort by
//! creation time and can be generated on any worker without coordination.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Marker trait for id types. Provides the prefix used by `Display`.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic id type. `T` is a zero-sized marker that only exists at compile
/// time; the runtime representation is a bare ULID.
#[repr(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Generate a fresh id: current milliseconds plus random entropy.
    pub fn generate() -> Self {
        let timestamp_ms = Utc::now().timestamp_millis() as u64;
        Self::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

// Manual impls instead of derives: the derives would put bounds on the
// marker type, which is an empty enum.

impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ok(Self::from_ulid(Ulid::from_string(bare)?))
    }
}

// On the wire an id is the prefixed string, same as `Display`. That string
// is what appears in command envelopes, record fields, and store keys, so
// there is exactly one textual form per id.

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Marker for task identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "t-"
    }
}

/// Marker for fencing uids. A record's uid changes when the task at its id
/// is replaced, which invalidates commands addressed to the predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Uid {}

impl IdMarker for Uid {
    fn prefix() -> &'static str {
        "u-"
    }
}

/// Identifier of a task record.
pub type TaskId = Id<Task>;

/// Fencing uid attached to a task record.
pub type TaskUid = Id<Uid>;
