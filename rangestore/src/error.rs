use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;

use crate::descriptor::RangeId;
use crate::guard::LeaseToken;
use crate::spanset::SpanAccess;
use crate::types::{Intent, Timestamp};

#[non_exhaustive]
#[derive(Clone, Debug, ThisError)]
pub enum StoreError {
    #[error("io error")]
    IoError(#[from] Arc<std::io::Error>),

    #[error("ranges are not adjacent: {left_end:?} != {right_start:?}")]
    RangesNotAdjacent { left_end: Bytes, right_start: Bytes },

    #[error("range missing intent on its local descriptor")]
    MissingMergeIntent,

    #[error("non-deletion intent on local range descriptor")]
    NonDeletionIntent,

    #[error("fetching local range descriptor: {source}")]
    LocalDescriptorRead {
        #[source]
        source: Box<StoreError>,
    },

    #[error("fetching local range descriptor as txn: {source}")]
    LocalDescriptorReadAsTxn {
        #[source]
        source: Box<StoreError>,
    },

    #[error("conflicting intents. count=`{}`", .intents.len())]
    WriteIntent { intents: Vec<Intent> },

    #[error("write at timestamp {timestamp} too old; existing version at {existing}")]
    WriteTooOld {
        timestamp: Timestamp,
        existing: Timestamp,
    },

    #[error("command cancelled")]
    Cancelled,

    #[error("merge snapshot exceeds limit. size=`{size}`, limit=`{limit}`")]
    SnapshotTooLarge { size: usize, limit: usize },

    #[error("key not in range. key=`{key:?}`, range_id=`{range_id}`")]
    KeyNotInRange { key: Bytes, range_id: RangeId },

    #[error("key not declared for {access:?} access. key=`{key:?}`")]
    SpanNotDeclared { access: SpanAccess, key: Bytes },

    #[error("range {0} has been subsumed by its left-hand neighbor")]
    RangeSubsumed(RangeId),

    #[error("range {0} is in the critical phase of a merge")]
    MergeInProgress(RangeId),

    #[error("timed out waiting for merge of range {range_id} to resolve after {timeout:?}")]
    MergeWatchTimeout { range_id: RangeId, timeout: Duration },

    #[error("replica does not hold the lease for range {range_id}. lease=`{lease:?}`")]
    NotLeaseHolder {
        range_id: RangeId,
        lease: Option<LeaseToken>,
    },

    #[error("local range descriptor missing for range {0}")]
    DescriptorNotFound(RangeId),

    #[error("invalid range descriptor")]
    InvalidDescriptor(#[source] Arc<serde_json::Error>),

    #[error("invalid range lease")]
    InvalidLease(#[source] Arc<serde_json::Error>),

    #[error("invalid mvcc metadata")]
    InvalidMvccMetadata(#[source] Arc<serde_json::Error>),

    #[error("invalid mvcc key. key=`{0:?}`")]
    InvalidMvccKey(Bytes),

    #[error("invalid key encoding. key=`{0:?}`")]
    InvalidKeyEncoding(Bytes),

    #[error("invalid batch representation. {0}")]
    InvalidBatchRepr(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error(
        "batch format version mismatch. expected_version=`{expected_version}`, actual_version=`{actual_version}`"
    )]
    InvalidVersion {
        expected_version: u32,
        actual_version: u32,
    },

    #[error("unknown configuration file format. path=`{0}`")]
    UnknownConfigurationFormat(PathBuf),

    #[error("invalid configuration format")]
    InvalidConfigurationFormat(#[from] Box<figment::Error>),
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// Represents the kind of failure, which tells a caller what it may do next.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller misused the protocol (for example, requested a merge snapshot
    /// without first opening a merge transaction). Never retried by this crate;
    /// the calling merge transaction decides whether to abort or retry.
    Invalid,

    /// The request conflicted with another transaction's intent or a newer write.
    Transaction,

    /// The request could not be served right now (cancelled, not the
    /// leaseholder, or blocked behind an unresolved merge). The caller may retry.
    Unavailable,

    /// The range no longer exists under this identity; it has been subsumed.
    Closed,

    /// Stored or transferred bytes are not in the expected shape.
    Data,

    /// An unexpected internal error occurred.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Invalid => write!(f, "Invalid error"),
            ErrorKind::Transaction => write!(f, "Transaction error"),
            ErrorKind::Unavailable => write!(f, "Unavailable error"),
            ErrorKind::Closed => write!(f, "Closed error"),
            ErrorKind::Data => write!(f, "Data error"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

impl StoreError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Invalid errors
            StoreError::RangesNotAdjacent { .. } => ErrorKind::Invalid,
            StoreError::MissingMergeIntent => ErrorKind::Invalid,
            StoreError::NonDeletionIntent => ErrorKind::Invalid,
            StoreError::KeyNotInRange { .. } => ErrorKind::Invalid,
            StoreError::SpanNotDeclared { .. } => ErrorKind::Invalid,
            StoreError::UnknownConfigurationFormat(_) => ErrorKind::Invalid,
            StoreError::InvalidConfigurationFormat(_) => ErrorKind::Invalid,
            StoreError::SnapshotTooLarge { .. } => ErrorKind::Invalid,

            // Transaction errors
            StoreError::WriteIntent { .. } => ErrorKind::Transaction,
            StoreError::WriteTooOld { .. } => ErrorKind::Transaction,

            // Unavailable errors
            StoreError::IoError(_) => ErrorKind::Unavailable,
            StoreError::Cancelled => ErrorKind::Unavailable,
            StoreError::MergeInProgress(_) => ErrorKind::Unavailable,
            StoreError::MergeWatchTimeout { .. } => ErrorKind::Unavailable,
            StoreError::NotLeaseHolder { .. } => ErrorKind::Unavailable,

            // Closed
            StoreError::RangeSubsumed(_) => ErrorKind::Closed,

            // Data errors
            StoreError::DescriptorNotFound(_) => ErrorKind::Data,
            StoreError::InvalidDescriptor(_) => ErrorKind::Data,
            StoreError::InvalidLease(_) => ErrorKind::Data,
            StoreError::InvalidMvccMetadata(_) => ErrorKind::Data,
            StoreError::InvalidMvccKey(_) => ErrorKind::Data,
            StoreError::InvalidKeyEncoding(_) => ErrorKind::Data,
            StoreError::InvalidBatchRepr(_) => ErrorKind::Data,
            StoreError::ChecksumMismatch => ErrorKind::Data,
            StoreError::InvalidVersion { .. } => ErrorKind::Data,

            StoreError::LocalDescriptorRead { source }
            | StoreError::LocalDescriptorReadAsTxn { source } => source.kind(),
        }
    }
}
