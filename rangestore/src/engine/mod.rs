//! # Engine
//!
//! The storage primitives consumed by command evaluation: point reads and
//! key-ordered iteration over [MvccKey]s, and buffered writes through a
//! [Batch] that can be committed or serialized for transfer.

use bytes::Bytes;

use crate::error::StoreError;
use crate::mvcc::MvccKey;

mod batch;
mod in_mem;

pub use batch::{decode_repr, Batch, BatchOp};
pub use in_mem::InMemEngine;

/// A raw engine entry. The key and value are exactly what was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEntry {
    pub key: MvccKey,
    pub value: Bytes,
}

/// The half-open interval `[start, end)` of engine keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccKeyRange {
    pub start: MvccKey,
    pub end: MvccKey,
}

impl MvccKeyRange {
    pub fn new(start: MvccKey, end: MvccKey) -> Self {
        Self { start, end }
    }

    /// Every version of every key in `[start, end)`.
    pub fn keys(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self::new(MvccKey::meta(start), MvccKey::meta(end))
    }

    pub fn contains(&self, key: &MvccKey) -> bool {
        *key >= self.start && *key < self.end
    }
}

pub trait EngineIterator {
    /// Returns the next entry in key order, or `None` once exhausted.
    fn next_entry(&mut self) -> Result<Option<EngineEntry>, StoreError>;
}

pub trait Reader {
    fn get(&self, key: &MvccKey) -> Result<Option<Bytes>, StoreError>;

    fn iter<'a>(&'a self, range: MvccKeyRange)
        -> Result<Box<dyn EngineIterator + 'a>, StoreError>;
}

pub trait Writer {
    fn put(&mut self, key: MvccKey, value: Bytes) -> Result<(), StoreError>;

    fn clear(&mut self, key: &MvccKey) -> Result<(), StoreError>;
}

pub trait ReadWriter: Reader + Writer {}

impl<T: Reader + Writer + ?Sized> ReadWriter for T {}
