use bytes::Bytes;

use crate::descriptor::RangeDescriptor;
use crate::engine::ReadWriter;
use crate::error::StoreError;
use crate::eval::{Command, CommandArgs, EvalResult, Header};
use crate::mvcc::mvcc_delete;
use crate::spanset::{Span, SpanAccess, SpanSet};

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub key: Bytes,
}

impl DeleteRequest {
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self { key: key.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResponse {}

impl Command for DeleteRequest {
    type Response = DeleteResponse;

    fn declare_keys(&self, _desc: &RangeDescriptor, _header: &Header, spans: &mut SpanSet) {
        spans.add(SpanAccess::ReadWrite, Span::point(self.key.clone()));
    }

    fn eval(
        &self,
        rw: &mut dyn ReadWriter,
        args: &CommandArgs<'_>,
    ) -> Result<(DeleteResponse, EvalResult), StoreError> {
        mvcc_delete(rw, &self.key, args.header.timestamp, args.header.txn.as_ref())?;
        Ok((DeleteResponse {}, EvalResult::default()))
    }
}
