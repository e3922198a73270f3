use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::StoreError;
use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RangeId(pub u64);

impl std::fmt::Display for RangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: u64,
    pub store_id: u64,
    pub replica_id: u64,
}

/// Identity of a range at a point in time: the span `[start_key, end_key)`
/// it owns and the replicas that hold it. A new version is written whenever
/// the range splits, merges, or changes replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Bytes,
    pub end_key: Bytes,
    pub replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: u64,
    pub generation: u64,
}

impl RangeDescriptor {
    pub fn new(
        range_id: RangeId,
        start_key: impl Into<Bytes>,
        end_key: impl Into<Bytes>,
        replicas: Vec<ReplicaDescriptor>,
    ) -> Self {
        let next_replica_id = replicas.iter().map(|r| r.replica_id).max().unwrap_or(0) + 1;
        Self {
            range_id,
            start_key: start_key.into(),
            end_key: end_key.into(),
            replicas,
            next_replica_id,
            generation: 0,
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_ref() && key < self.end_key.as_ref()
    }

    /// The range-local key under which this descriptor is stored.
    pub fn local_key(&self) -> Bytes {
        keys::range_descriptor_key(&self.start_key)
    }

    /// The meta2 key under which this descriptor's second copy is stored.
    pub fn meta_key(&self) -> Bytes {
        keys::range_meta_key(&self.end_key)
    }

    pub fn replica(&self, replica_id: u64) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.replica_id == replica_id)
    }

    pub fn encode(&self) -> Result<Bytes, StoreError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| StoreError::InvalidDescriptor(Arc::new(e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::InvalidDescriptor(Arc::new(e)))
    }
}

impl std::fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:[{:?}, {:?})",
            self.range_id, self.start_key, self.end_key
        )
    }
}
