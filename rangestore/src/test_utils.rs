use bytes::Bytes;
use std::cell::Cell;

use crate::config::Settings;
use crate::descriptor::RangeDescriptor;
use crate::engine::{EngineEntry, EngineIterator, MvccKeyRange, Reader, Writer};
use crate::error::StoreError;
use crate::eval::EvalContext;
use crate::mvcc::MvccKey;

pub(crate) struct TestEvalContext {
    desc: RangeDescriptor,
    settings: Settings,
}

impl TestEvalContext {
    pub(crate) fn new(desc: RangeDescriptor, settings: Settings) -> Self {
        Self { desc, settings }
    }
}

impl EvalContext for TestEvalContext {
    fn desc(&self) -> &RangeDescriptor {
        &self.desc
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }
}

pub(crate) fn injected_error(what: &str) -> StoreError {
    StoreError::from(std::io::Error::other(format!("injected {what} failure")))
}

/// Wraps a reader-writer and injects storage failures into it.
pub(crate) struct FaultyReadWriter<'a, RW: ?Sized> {
    inner: &'a mut RW,
    fail_gets: bool,
    /// Entries iterators may yield, in total, before failing.
    iter_budget: Option<usize>,
    yielded: Cell<usize>,
}

impl<'a, RW: ?Sized> FaultyReadWriter<'a, RW> {
    pub(crate) fn new(inner: &'a mut RW) -> Self {
        Self {
            inner,
            fail_gets: false,
            iter_budget: None,
            yielded: Cell::new(0),
        }
    }

    pub(crate) fn fail_gets(mut self) -> Self {
        self.fail_gets = true;
        self
    }

    pub(crate) fn fail_iter_after(mut self, entries: usize) -> Self {
        self.iter_budget = Some(entries);
        self
    }
}

struct FaultyIterator<'a> {
    inner: Box<dyn EngineIterator + 'a>,
    budget: Option<usize>,
    yielded: &'a Cell<usize>,
}

impl EngineIterator for FaultyIterator<'_> {
    fn next_entry(&mut self) -> Result<Option<EngineEntry>, StoreError> {
        if let Some(budget) = self.budget {
            if self.yielded.get() >= budget {
                return Err(injected_error("iterator"));
            }
        }
        let entry = self.inner.next_entry()?;
        if entry.is_some() {
            self.yielded.set(self.yielded.get() + 1);
        }
        Ok(entry)
    }
}

impl<RW: Reader + ?Sized> Reader for FaultyReadWriter<'_, RW> {
    fn get(&self, key: &MvccKey) -> Result<Option<Bytes>, StoreError> {
        if self.fail_gets {
            return Err(injected_error("get"));
        }
        self.inner.get(key)
    }

    fn iter<'b>(
        &'b self,
        range: MvccKeyRange,
    ) -> Result<Box<dyn EngineIterator + 'b>, StoreError> {
        Ok(Box::new(FaultyIterator {
            inner: self.inner.iter(range)?,
            budget: self.iter_budget,
            yielded: &self.yielded,
        }))
    }
}

impl<RW: Writer + ?Sized> Writer for FaultyReadWriter<'_, RW> {
    fn put(&mut self, key: MvccKey, value: Bytes) -> Result<(), StoreError> {
        self.inner.put(key, value)
    }

    fn clear(&mut self, key: &MvccKey) -> Result<(), StoreError> {
        self.inner.clear(key)
    }
}
