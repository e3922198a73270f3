use bytes::Bytes;

use crate::descriptor::RangeDescriptor;
use crate::engine::ReadWriter;
use crate::error::StoreError;
use crate::eval::{Command, CommandArgs, EvalResult, Header};
use crate::mvcc::mvcc_put;
use crate::spanset::{Span, SpanAccess, SpanSet};

#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: Bytes,
    pub value: Bytes,
}

impl PutRequest {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResponse {}

impl Command for PutRequest {
    type Response = PutResponse;

    fn declare_keys(&self, _desc: &RangeDescriptor, _header: &Header, spans: &mut SpanSet) {
        spans.add(SpanAccess::ReadWrite, Span::point(self.key.clone()));
    }

    fn eval(
        &self,
        rw: &mut dyn ReadWriter,
        args: &CommandArgs<'_>,
    ) -> Result<(PutResponse, EvalResult), StoreError> {
        mvcc_put(
            rw,
            &self.key,
            args.header.timestamp,
            self.value.clone(),
            args.header.txn.as_ref(),
        )?;
        Ok((PutResponse {}, EvalResult::default()))
    }
}
