//! # Command evaluation
//!
//! Each command declares the spans it touches ([Command::declare_keys]) and is
//! then evaluated against a read-writer over the replica's engine
//! ([Command::eval]). Evaluation is synchronous and never waits on other
//! commands; ordering between conflicting commands is established by latching
//! before evaluation begins.

mod cmd_delete;
mod cmd_get;
mod cmd_get_snapshot_for_merge;
mod cmd_put;

use tokio_util::sync::CancellationToken;

pub use self::cmd_delete::{DeleteRequest, DeleteResponse};
pub use self::cmd_get::{GetRequest, GetResponse};
pub use self::cmd_get_snapshot_for_merge::{
    GetSnapshotForMergeRequest, GetSnapshotForMergeResponse,
};
pub use self::cmd_put::{PutRequest, PutResponse};

use crate::config::Settings;
use crate::descriptor::RangeDescriptor;
use crate::engine::ReadWriter;
use crate::error::StoreError;
use crate::spanset::SpanSet;
use crate::types::{Timestamp, TxnMeta};

/// Fields common to every request.
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub timestamp: Timestamp,
    pub txn: Option<TxnMeta>,
}

impl Header {
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            txn: None,
        }
    }

    pub fn with_txn(txn: TxnMeta) -> Self {
        Self {
            timestamp: txn.write_timestamp,
            txn: Some(txn),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Delete,
    GetSnapshotForMerge,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Method::Get => "Get",
            Method::Put => "Put",
            Method::Delete => "Delete",
            Method::GetSnapshotForMerge => "GetSnapshotForMerge",
        };
        f.write_str(name)
    }
}

/// The replica state a command may consult while it is evaluated.
pub trait EvalContext: Send + Sync {
    fn desc(&self) -> &RangeDescriptor;

    fn settings(&self) -> &Settings;
}

pub struct CommandArgs<'a> {
    pub eval_ctx: &'a dyn EvalContext,
    pub header: &'a Header,
    /// Cancelled when the caller stops waiting for the response.
    pub cancel: &'a CancellationToken,
}

/// Side effects of a command on the evaluating replica's in-memory state,
/// applied only once the command's writes have been committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalResult {
    /// The range has entered the critical phase of a merge.
    pub set_merging: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalResult {
    pub local: LocalResult,
}

pub trait Command {
    type Response;

    /// Adds every span the command may access to `spans`.
    fn declare_keys(&self, desc: &RangeDescriptor, header: &Header, spans: &mut SpanSet);

    fn eval(
        &self,
        rw: &mut dyn ReadWriter,
        args: &CommandArgs<'_>,
    ) -> Result<(Self::Response, EvalResult), StoreError>;
}

#[derive(Debug, Clone)]
pub enum Request {
    Get(GetRequest),
    Put(PutRequest),
    Delete(DeleteRequest),
    GetSnapshotForMerge(GetSnapshotForMergeRequest),
}

#[derive(Debug, Clone)]
pub enum Response {
    Get(GetResponse),
    Put(PutResponse),
    Delete(DeleteResponse),
    GetSnapshotForMerge(GetSnapshotForMergeResponse),
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Get(_) => Method::Get,
            Request::Put(_) => Method::Put,
            Request::Delete(_) => Method::Delete,
            Request::GetSnapshotForMerge(_) => Method::GetSnapshotForMerge,
        }
    }

    /// Whether the command can change replicated state.
    pub fn is_write(&self) -> bool {
        !matches!(self, Request::Get(_))
    }

    pub fn declare_keys(&self, desc: &RangeDescriptor, header: &Header, spans: &mut SpanSet) {
        match self {
            Request::Get(req) => req.declare_keys(desc, header, spans),
            Request::Put(req) => req.declare_keys(desc, header, spans),
            Request::Delete(req) => req.declare_keys(desc, header, spans),
            Request::GetSnapshotForMerge(req) => req.declare_keys(desc, header, spans),
        }
    }

    pub fn eval(
        &self,
        rw: &mut dyn ReadWriter,
        args: &CommandArgs<'_>,
    ) -> Result<(Response, EvalResult), StoreError> {
        match self {
            Request::Get(req) => req
                .eval(rw, args)
                .map(|(resp, result)| (Response::Get(resp), result)),
            Request::Put(req) => req
                .eval(rw, args)
                .map(|(resp, result)| (Response::Put(resp), result)),
            Request::Delete(req) => req
                .eval(rw, args)
                .map(|(resp, result)| (Response::Delete(resp), result)),
            Request::GetSnapshotForMerge(req) => req
                .eval(rw, args)
                .map(|(resp, result)| (Response::GetSnapshotForMerge(resp), result)),
        }
    }
}

impl From<GetRequest> for Request {
    fn from(req: GetRequest) -> Self {
        Request::Get(req)
    }
}

impl From<PutRequest> for Request {
    fn from(req: PutRequest) -> Self {
        Request::Put(req)
    }
}

impl From<DeleteRequest> for Request {
    fn from(req: DeleteRequest) -> Self {
        Request::Delete(req)
    }
}

impl From<GetSnapshotForMergeRequest> for Request {
    fn from(req: GetSnapshotForMergeRequest) -> Self {
        Request::GetSnapshotForMerge(req)
    }
}

impl Response {
    pub fn into_get(self) -> Option<GetResponse> {
        match self {
            Response::Get(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn into_snapshot(self) -> Option<GetSnapshotForMergeResponse> {
        match self {
            Response::GetSnapshotForMerge(resp) => Some(resp),
            _ => None,
        }
    }
}
