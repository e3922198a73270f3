use bytes::Bytes;
use crossbeam_skiplist::map::Range;
use crossbeam_skiplist::SkipMap;
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::engine::batch::{decode_repr, Batch, BatchOp};
use crate::engine::{EngineEntry, EngineIterator, MvccKeyRange, Reader};
use crate::error::StoreError;
use crate::mvcc::MvccKey;

/// An in-memory engine backed by a concurrent skip list.
///
/// Committing a batch is not atomic with respect to a concurrent reader of the
/// same keys. Callers serialize overlapping access through latches.
#[derive(Default)]
pub struct InMemEngine {
    map: SkipMap<MvccKey, Bytes>,
}

type InMemRange<'a> = Range<'a, MvccKey, (Bound<MvccKey>, Bound<MvccKey>), MvccKey, Bytes>;

struct InMemIterator<'a>(InMemRange<'a>);

impl EngineIterator for InMemIterator<'_> {
    fn next_entry(&mut self) -> Result<Option<EngineEntry>, StoreError> {
        Ok(self.0.next().map(|entry| EngineEntry {
            key: entry.key().clone(),
            value: entry.value().clone(),
        }))
    }
}

impl InMemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn apply(&self, writes: BTreeMap<MvccKey, Option<Bytes>>) {
        for (key, value) in writes {
            match value {
                Some(value) => {
                    self.map.insert(key, value);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
    }

    /// Ingests a serialized batch produced by [Batch::repr]. Returns the
    /// number of operations applied. Nothing is applied if the payload fails
    /// to decode.
    pub fn apply_repr(&self, repr: &[u8]) -> Result<usize, StoreError> {
        let ops = decode_repr(repr)?;
        let count = ops.len();
        let mut writes = BTreeMap::new();
        for op in ops {
            match op {
                BatchOp::Put(key, value) => writes.insert(key, Some(value)),
                BatchOp::Clear(key) => writes.insert(key, None),
            };
        }
        self.apply(writes);
        Ok(count)
    }
}

impl Reader for InMemEngine {
    fn get(&self, key: &MvccKey) -> Result<Option<Bytes>, StoreError> {
        Ok(self.map.get(key).map(|entry| entry.value().clone()))
    }

    fn iter<'a>(
        &'a self,
        range: MvccKeyRange,
    ) -> Result<Box<dyn EngineIterator + 'a>, StoreError> {
        let bounds = (Bound::Included(range.start), Bound::Excluded(range.end));
        Ok(Box::new(InMemIterator(self.map.range(bounds))))
    }
}
