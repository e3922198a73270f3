//! # Batch
//!
//! A batch buffers writes against an engine. Reads through the batch see the
//! buffered writes layered over the engine's contents. A batch is either
//! committed to its engine or serialized with [Batch::repr] for transfer.
//!
//! The serialized form is:
//!
//! ```text
//! |--------------------------------------------------------------|
//! | version (u32) | count (u32) | op * count | checksum (u32)   |
//! |--------------------------------------------------------------|
//!
//! op := tag (u8) | key_len (varint) | key | [value_len (varint) | value]
//! ```
//!
//! Keys are [MvccKey::encode]d. Puts carry a value, clears do not. The
//! checksum is a CRC32 of everything before it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;

use crate::engine::{EngineEntry, EngineIterator, InMemEngine, MvccKeyRange, Reader, Writer};
use crate::error::StoreError;
use crate::mvcc::MvccKey;
use crate::utils::{decode_varint, encode_varint, varint_len};

const BATCH_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;
const CHECKSUM_LEN: usize = 4;

const TAG_CLEAR: u8 = 0;
const TAG_PUT: u8 = 1;

/// A decoded batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(MvccKey, Bytes),
    Clear(MvccKey),
}

pub struct Batch<'a> {
    engine: &'a InMemEngine,
    /// `None` marks a cleared key.
    writes: BTreeMap<MvccKey, Option<Bytes>>,
    size_bytes: usize,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(engine: &'a InMemEngine) -> Self {
        Self {
            engine,
            writes: BTreeMap::new(),
            size_bytes: 0,
        }
    }

    /// Number of buffered operations.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Total key and value bytes written to the batch, counting overwritten
    /// operations.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Applies the buffered writes to the engine.
    pub fn commit(self) {
        self.engine.apply(self.writes);
    }

    /// Serializes the buffered writes in key order.
    pub fn repr(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.size_bytes + CHECKSUM_LEN);
        buf.put_u32(BATCH_FORMAT_VERSION);
        buf.put_u32(self.writes.len() as u32);
        for (key, value) in &self.writes {
            let encoded = key.encode();
            match value {
                Some(value) => {
                    buf.put_u8(TAG_PUT);
                    encode_varint(&mut buf, encoded.len() as u64);
                    buf.put_slice(&encoded);
                    encode_varint(&mut buf, value.len() as u64);
                    buf.put_slice(value);
                }
                None => {
                    buf.put_u8(TAG_CLEAR);
                    encode_varint(&mut buf, encoded.len() as u64);
                    buf.put_slice(&encoded);
                }
            }
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        buf.freeze()
    }

    fn account(&mut self, key: &MvccKey, value_len: usize) {
        let key_len = key.encoded_len();
        self.size_bytes += 1 + varint_len(key_len as u64) + key_len + value_len;
    }
}

impl Reader for Batch<'_> {
    fn get(&self, key: &MvccKey) -> Result<Option<Bytes>, StoreError> {
        match self.writes.get(key) {
            Some(value) => Ok(value.clone()),
            None => self.engine.get(key),
        }
    }

    fn iter<'b>(
        &'b self,
        range: MvccKeyRange,
    ) -> Result<Box<dyn EngineIterator + 'b>, StoreError> {
        let bounds = (
            Bound::Included(range.start.clone()),
            Bound::Excluded(range.end.clone()),
        );
        let writes = self.writes.range(bounds).peekable();
        let base = self.engine.iter(range)?;
        Ok(Box::new(BatchIterator {
            base,
            base_next: None,
            base_done: false,
            writes,
        }))
    }
}

impl Writer for Batch<'_> {
    fn put(&mut self, key: MvccKey, value: Bytes) -> Result<(), StoreError> {
        self.account(&key, varint_len(value.len() as u64) + value.len());
        self.writes.insert(key, Some(value));
        Ok(())
    }

    fn clear(&mut self, key: &MvccKey) -> Result<(), StoreError> {
        self.account(key, 0);
        self.writes.insert(key.clone(), None);
        Ok(())
    }
}

/// Merges the engine's entries with the batch's buffered writes. On equal
/// keys the buffered write wins; a buffered clear hides the engine entry.
struct BatchIterator<'a> {
    base: Box<dyn EngineIterator + 'a>,
    base_next: Option<EngineEntry>,
    base_done: bool,
    writes: Peekable<btree_map::Range<'a, MvccKey, Option<Bytes>>>,
}

impl EngineIterator for BatchIterator<'_> {
    fn next_entry(&mut self) -> Result<Option<EngineEntry>, StoreError> {
        loop {
            if self.base_next.is_none() && !self.base_done {
                self.base_next = self.base.next_entry()?;
                self.base_done = self.base_next.is_none();
            }

            let ordering = match (self.writes.peek(), &self.base_next) {
                (None, None) => return Ok(None),
                (None, Some(_)) => return Ok(self.base_next.take()),
                (Some(_), None) => std::cmp::Ordering::Less,
                (Some((write_key, _)), Some(base)) => (*write_key).cmp(&base.key),
            };

            if ordering == std::cmp::Ordering::Greater {
                return Ok(self.base_next.take());
            }
            if ordering == std::cmp::Ordering::Equal {
                self.base_next = None;
            }
            if let Some((key, Some(value))) = self.writes.next() {
                return Ok(Some(EngineEntry {
                    key: key.clone(),
                    value: value.clone(),
                }));
            }
        }
    }
}

/// Decodes a payload produced by [Batch::repr], validating its checksum,
/// format version, and framing.
pub fn decode_repr(repr: &[u8]) -> Result<Vec<BatchOp>, StoreError> {
    if repr.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(StoreError::InvalidBatchRepr(format!(
            "payload too short. len=`{}`",
            repr.len()
        )));
    }
    let (body, mut trailer) = repr.split_at(repr.len() - CHECKSUM_LEN);
    if trailer.get_u32() != crc32fast::hash(body) {
        return Err(StoreError::ChecksumMismatch);
    }

    let mut buf = body;
    let version = buf.get_u32();
    if version != BATCH_FORMAT_VERSION {
        return Err(StoreError::InvalidVersion {
            expected_version: BATCH_FORMAT_VERSION,
            actual_version: version,
        });
    }
    let count = buf.get_u32() as usize;
    let mut ops = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        if !buf.has_remaining() {
            return Err(StoreError::InvalidBatchRepr("truncated op".to_string()));
        }
        let tag = buf.get_u8();
        let key = MvccKey::decode(&take_slice(&mut buf)?)?;
        match tag {
            TAG_PUT => ops.push(BatchOp::Put(key, take_slice(&mut buf)?)),
            TAG_CLEAR => ops.push(BatchOp::Clear(key)),
            other => {
                return Err(StoreError::InvalidBatchRepr(format!(
                    "unknown op tag. tag=`{other}`"
                )))
            }
        }
    }
    if buf.has_remaining() {
        return Err(StoreError::InvalidBatchRepr(format!(
            "trailing bytes after ops. remaining=`{}`",
            buf.remaining()
        )));
    }
    Ok(ops)
}

fn take_slice(buf: &mut &[u8]) -> Result<Bytes, StoreError> {
    let len = decode_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(StoreError::InvalidBatchRepr(format!(
            "length prefix exceeds payload. len=`{len}`, remaining=`{}`",
            buf.remaining()
        )));
    }
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(out)
}
