//! # Span sets
//!
//! A command declares, before it is evaluated, every key span it will read or
//! write. The declarations drive latching (see [crate::spanlatch]) and are
//! enforced during evaluation by [SpanSetReadWriter].

use bytes::{BufMut, Bytes, BytesMut};

use crate::engine::{EngineIterator, MvccKeyRange, Reader, Writer};
use crate::error::StoreError;
use crate::mvcc::MvccKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanAccess {
    ReadOnly,
    ReadWrite,
}

/// A single key, or the half-open interval `[key, end_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub key: Bytes,
    pub end_key: Option<Bytes>,
}

impl Span {
    pub fn point(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            end_key: None,
        }
    }

    pub fn range(key: impl Into<Bytes>, end_key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            end_key: Some(end_key.into()),
        }
    }

    /// The exclusive end, treating a point as `[key, key\x00)`.
    fn end(&self) -> Bytes {
        match &self.end_key {
            Some(end) => end.clone(),
            None => {
                let mut end = BytesMut::with_capacity(self.key.len() + 1);
                end.put_slice(&self.key);
                end.put_u8(0);
                end.freeze()
            }
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        match &self.end_key {
            Some(end) => key >= self.key.as_ref() && key < end.as_ref(),
            None => key == self.key.as_ref(),
        }
    }

    /// Whether every key of `other` is also a key of this span.
    pub fn contains(&self, other: &Span) -> bool {
        other.key >= self.key && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.key < other.end() && other.key < self.end()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpanSet {
    read_only: Vec<Span>,
    read_write: Vec<Span>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, access: SpanAccess, span: Span) {
        match access {
            SpanAccess::ReadOnly => self.read_only.push(span),
            SpanAccess::ReadWrite => self.read_write.push(span),
        }
    }

    pub fn spans(&self, access: SpanAccess) -> &[Span] {
        match access {
            SpanAccess::ReadOnly => &self.read_only,
            SpanAccess::ReadWrite => &self.read_write,
        }
    }

    pub fn len(&self) -> usize {
        self.read_only.len() + self.read_write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every declared span with its access.
    pub fn iter(&self) -> impl Iterator<Item = (SpanAccess, &Span)> {
        self.read_only
            .iter()
            .map(|span| (SpanAccess::ReadOnly, span))
            .chain(self.read_write.iter().map(|span| (SpanAccess::ReadWrite, span)))
    }

    /// Two sets conflict when a span of one overlaps a span of the other and at
    /// least one of the two is read-write.
    pub fn conflicts_with(&self, other: &SpanSet) -> bool {
        self.iter().any(|(access, span)| {
            other.iter().any(|(other_access, other_span)| {
                (access == SpanAccess::ReadWrite || other_access == SpanAccess::ReadWrite)
                    && span.overlaps(other_span)
            })
        })
    }

    /// Checks that `span` was declared with at least `access`. Read-write
    /// declarations also permit reads.
    pub fn check_allowed(&self, access: SpanAccess, span: &Span) -> Result<(), StoreError> {
        let covered = |spans: &[Span]| spans.iter().any(|declared| declared.contains(span));
        let allowed = match access {
            SpanAccess::ReadOnly => covered(&self.read_only) || covered(&self.read_write),
            SpanAccess::ReadWrite => covered(&self.read_write),
        };
        if allowed {
            Ok(())
        } else {
            Err(StoreError::SpanNotDeclared {
                access,
                key: span.key.clone(),
            })
        }
    }
}

/// Wraps a reader-writer so that every access is checked against the spans a
/// command declared.
pub struct SpanSetReadWriter<'a, RW: ?Sized> {
    inner: &'a mut RW,
    spans: &'a SpanSet,
}

impl<'a, RW: ?Sized> SpanSetReadWriter<'a, RW> {
    pub fn new(inner: &'a mut RW, spans: &'a SpanSet) -> Self {
        Self { inner, spans }
    }
}

impl<RW: Reader + ?Sized> Reader for SpanSetReadWriter<'_, RW> {
    fn get(&self, key: &MvccKey) -> Result<Option<Bytes>, StoreError> {
        self.spans
            .check_allowed(SpanAccess::ReadOnly, &Span::point(key.key.clone()))?;
        self.inner.get(key)
    }

    fn iter<'b>(
        &'b self,
        range: MvccKeyRange,
    ) -> Result<Box<dyn EngineIterator + 'b>, StoreError> {
        if range.start.key < range.end.key {
            let span = Span::range(range.start.key.clone(), range.end.key.clone());
            self.spans.check_allowed(SpanAccess::ReadOnly, &span)?;
        }
        self.inner.iter(range)
    }
}

impl<RW: Writer + ?Sized> Writer for SpanSetReadWriter<'_, RW> {
    fn put(&mut self, key: MvccKey, value: Bytes) -> Result<(), StoreError> {
        self.spans
            .check_allowed(SpanAccess::ReadWrite, &Span::point(key.key.clone()))?;
        self.inner.put(key, value)
    }

    fn clear(&mut self, key: &MvccKey) -> Result<(), StoreError> {
        self.spans
            .check_allowed(SpanAccess::ReadWrite, &Span::point(key.key.clone()))?;
        self.inner.clear(key)
    }
}
