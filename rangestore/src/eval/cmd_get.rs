use bytes::Bytes;

use crate::descriptor::RangeDescriptor;
use crate::engine::ReadWriter;
use crate::error::StoreError;
use crate::eval::{Command, CommandArgs, EvalResult, Header};
use crate::mvcc::{mvcc_get, MvccGetOptions};
use crate::spanset::{Span, SpanAccess, SpanSet};

#[derive(Debug, Clone)]
pub struct GetRequest {
    pub key: Bytes,
}

impl GetRequest {
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self { key: key.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResponse {
    pub value: Option<Bytes>,
}

impl Command for GetRequest {
    type Response = GetResponse;

    fn declare_keys(&self, _desc: &RangeDescriptor, _header: &Header, spans: &mut SpanSet) {
        spans.add(SpanAccess::ReadOnly, Span::point(self.key.clone()));
    }

    fn eval(
        &self,
        rw: &mut dyn ReadWriter,
        args: &CommandArgs<'_>,
    ) -> Result<(GetResponse, EvalResult), StoreError> {
        let opts = MvccGetOptions {
            inconsistent: false,
            txn: args.header.txn.clone(),
        };
        let (value, _) = mvcc_get(&*rw, &self.key, args.header.timestamp, &opts)?;
        Ok((GetResponse { value }, EvalResult::default()))
    }
}
