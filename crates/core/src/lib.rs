//! kmerge core types: watched objects, change deltas and the object store contract.

#![forbid(unsafe_code)]

pub mod memory;
pub mod tags;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use tags::Kind;

/// Field key -> byte blob. Ordered, so every walk over a payload is deterministic.
pub type Payload = BTreeMap<String, Vec<u8>>;

/// `namespace/name` identity of a watched object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of one object of the watched kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedObject {
    pub id: ObjectRef,
    /// Annotations; carries the kmerge tag vocabulary (see [`tags`]).
    pub tags: BTreeMap<String, String>,
    pub payload: Payload,
    /// Set once the object is marked for deletion.
    pub deleting: bool,
}

impl WatchedObject {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: ObjectRef::new(namespace, name), ..Default::default() }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Logical name tag; an empty value counts as absent.
    pub fn logical_name(&self) -> Option<&str> {
        self.tag(tags::NAME).filter(|s| !s.is_empty())
    }

    pub fn is_primary(&self) -> bool {
        self.tags.contains_key(tags::PRIMARY)
    }

    /// Carries both tags required to be a merge target.
    pub fn is_target(&self) -> bool {
        self.is_primary() && self.logical_name().is_some()
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.tag(tags::HASH)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One change notification from the watch subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: WatchedObject,
}

impl Delta {
    pub fn applied(object: WatchedObject) -> Self {
        Self { kind: DeltaKind::Applied, object }
    }

    pub fn deleted(object: WatchedObject) -> Self {
        Self { kind: DeltaKind::Deleted, object }
    }
}

/// Partial update applied to a primary object: payload fields and tags are merged into the
/// existing object, keys not mentioned are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePatch {
    pub payload: Payload,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Object store client used by the merge pipeline.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object; `Ok(None)` when it does not exist.
    async fn get(&self, id: &ObjectRef) -> Result<Option<WatchedObject>, StoreError>;

    /// List objects of the watched kind, in one namespace or across all of them.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<WatchedObject>, StoreError>;

    /// Apply a merge-style partial update.
    async fn merge_patch(&self, id: &ObjectRef, patch: &MergePatch) -> Result<(), StoreError>;
}

pub mod prelude {
    pub use super::{Delta, DeltaKind, Kind, MergePatch, ObjectRef, ObjectStore, Payload, StoreError, WatchedObject};
}
