//! Iteration over the data owned by a replica.

use bytes::Bytes;

use crate::descriptor::RangeDescriptor;
use crate::engine::{EngineEntry, EngineIterator, MvccKeyRange, Reader};
use crate::error::StoreError;
use crate::keys;

fn key_range(start: impl Into<Bytes>, end: impl Into<Bytes>) -> MvccKeyRange {
    MvccKeyRange::keys(start, end)
}

fn range_id_replicated_range(desc: &RangeDescriptor) -> MvccKeyRange {
    let prefix = keys::make_range_id_replicated_prefix(desc.range_id);
    let end = keys::prefix_end(&prefix);
    key_range(prefix, end)
}

fn range_id_unreplicated_range(desc: &RangeDescriptor) -> MvccKeyRange {
    let prefix = keys::make_range_id_unreplicated_prefix(desc.range_id);
    let end = keys::prefix_end(&prefix);
    key_range(prefix, end)
}

fn range_local_range(desc: &RangeDescriptor) -> MvccKeyRange {
    key_range(
        keys::make_range_key_prefix(&desc.start_key),
        keys::make_range_key_prefix(&desc.end_key),
    )
}

fn user_key_range(desc: &RangeDescriptor) -> MvccKeyRange {
    let start = if desc.start_key.as_ref() < keys::LOCAL_MAX {
        Bytes::from_static(keys::LOCAL_MAX)
    } else {
        desc.start_key.clone()
    };
    key_range(start, desc.end_key.clone())
}

/// The key ranges holding a range's replicated data, in key order.
pub fn replicated_key_ranges(desc: &RangeDescriptor) -> Vec<MvccKeyRange> {
    vec![
        range_id_replicated_range(desc),
        range_local_range(desc),
        user_key_range(desc),
    ]
}

/// Every key range a replica of `desc` stores, replicated or not, in key order.
pub fn all_key_ranges(desc: &RangeDescriptor) -> Vec<MvccKeyRange> {
    vec![
        range_id_replicated_range(desc),
        range_id_unreplicated_range(desc),
        range_local_range(desc),
        user_key_range(desc),
    ]
}

/// Walks the key ranges of a replica in key order, yielding raw engine entries.
pub struct ReplicaDataIterator<'a, R: Reader + ?Sized> {
    reader: &'a R,
    ranges: std::vec::IntoIter<MvccKeyRange>,
    current: Option<Box<dyn EngineIterator + 'a>>,
}

impl<'a, R: Reader + ?Sized> ReplicaDataIterator<'a, R> {
    pub fn new(desc: &RangeDescriptor, reader: &'a R, replicated_only: bool) -> Self {
        let ranges = if replicated_only {
            replicated_key_ranges(desc)
        } else {
            all_key_ranges(desc)
        };
        Self {
            reader,
            ranges: ranges.into_iter(),
            current: None,
        }
    }
}

impl<R: Reader + ?Sized> EngineIterator for ReplicaDataIterator<'_, R> {
    fn next_entry(&mut self) -> Result<Option<EngineEntry>, StoreError> {
        loop {
            if let Some(iter) = self.current.as_mut() {
                if let Some(entry) = iter.next_entry()? {
                    return Ok(Some(entry));
                }
                self.current = None;
            }
            match self.ranges.next() {
                Some(range) => self.current = Some(self.reader.iter(range)?),
                None => return Ok(None),
            }
        }
    }
}
