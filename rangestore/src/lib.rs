#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(clippy::panic)]
#![cfg_attr(test, allow(clippy::panic))]
#![allow(clippy::result_large_err)]

/// Re-export the bytes crate.
///
/// This is useful for users of the crate who want to build requests
/// without having to depend on the bytes crate directly.
pub use bytes;

pub use config::Settings;
pub use descriptor::{RangeDescriptor, RangeId, ReplicaDescriptor};
pub use engine::InMemEngine;
pub use error::{ErrorKind, StoreError};
pub use eval::{
    DeleteRequest, GetRequest, GetSnapshotForMergeRequest, GetSnapshotForMergeResponse, Header,
    PutRequest, Request, Response,
};
pub use guard::LeaseToken;
pub use replica::{EvalKnobs, Replica};
pub use types::{Intent, Timestamp, TxnId, TxnMeta, TxnStatus};

pub mod clock;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod eval;
pub mod guard;
pub mod keys;
pub mod mvcc;
pub mod rditer;
pub mod replica;
pub mod spanlatch;
pub mod spanset;
pub mod types;

#[cfg(test)]
mod test_utils;
mod utils;
