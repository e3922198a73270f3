use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A hybrid logical timestamp. The zero timestamp is reserved for MVCC
/// metadata records and never names a committed version.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall_time: i64,
    pub logical: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    pub const MAX: Timestamp = Timestamp {
        wall_time: i64::MAX,
        logical: u32::MAX,
    };

    pub fn new(wall_time: i64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// The smallest timestamp strictly greater than this one.
    pub fn next(&self) -> Self {
        if self.logical == u32::MAX {
            Self::new(self.wall_time.saturating_add(1), 0)
        } else {
            Self::new(self.wall_time, self.logical + 1)
        }
    }

    /// The largest timestamp strictly smaller than this one. Saturates at zero.
    pub fn prev(&self) -> Self {
        if self.logical > 0 {
            Self::new(self.wall_time, self.logical - 1)
        } else if self.wall_time > 0 {
            Self::new(self.wall_time - 1, u32::MAX)
        } else {
            Self::ZERO
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:010}", self.wall_time, self.logical)
    }
}

pub type TxnId = Uuid;

/// The part of a transaction record carried by each of its intents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnMeta {
    pub id: TxnId,
    /// The transaction's anchor key (where its record lives).
    pub key: Bytes,
    pub epoch: u32,
    pub write_timestamp: Timestamp,
}

impl TxnMeta {
    pub fn new(key: impl Into<Bytes>, write_timestamp: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            epoch: 0,
            write_timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Pending,
    Committed,
    Aborted,
}

/// A provisional write on `key` owned by `txn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub key: Bytes,
    pub txn: TxnMeta,
}

impl Intent {
    pub fn new(key: Bytes, txn: TxnMeta) -> Self {
        Self { key, txn }
    }
}
