//! # MVCC
//!
//! Every user-visible key is stored as a sequence of versions, each at its own
//! [MvccKey] and ordered newest first. A pending transactional write is an
//! intent: an [MvccMetadata] record at the key's metadata position (the zero
//! timestamp) pointing at the provisional version. An empty value is a
//! deletion tombstone.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::engine::{MvccKeyRange, ReadWriter, Reader};
use crate::error::StoreError;
use crate::types::{Intent, Timestamp, TxnMeta, TxnStatus};

const SENTINEL: u8 = 0x00;
const TIMESTAMP_LEN: usize = 12;
const VERSIONED_SUFFIX_LEN: u8 = (TIMESTAMP_LEN + 1) as u8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MvccKey {
    pub key: Bytes,
    pub timestamp: Timestamp,
}

impl MvccKey {
    pub fn new(key: impl Into<Bytes>, timestamp: Timestamp) -> Self {
        Self {
            key: key.into(),
            timestamp,
        }
    }

    /// The metadata position of `key`, which sorts before all of its versions.
    pub fn meta(key: impl Into<Bytes>) -> Self {
        Self::new(key, Timestamp::ZERO)
    }

    pub fn is_meta(&self) -> bool {
        self.timestamp.is_zero()
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_meta() {
            self.key.len() + 1
        } else {
            self.key.len() + 1 + TIMESTAMP_LEN + 1
        }
    }

    /// Encodes as `key` followed by `0x00` for metadata, or by
    /// `0x00 | wall_time (i64 BE) | logical (u32 BE) | 13` for a version.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.key);
        buf.put_u8(SENTINEL);
        if !self.is_meta() {
            buf.put_i64(self.timestamp.wall_time);
            buf.put_u32(self.timestamp.logical);
            buf.put_u8(VERSIONED_SUFFIX_LEN);
        }
        buf.freeze()
    }

    pub fn decode(encoded: &[u8]) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidMvccKey(Bytes::copy_from_slice(encoded));
        let (&suffix_len, rest) = encoded.split_last().ok_or_else(invalid)?;
        match suffix_len {
            SENTINEL => Ok(Self::meta(Bytes::copy_from_slice(rest))),
            VERSIONED_SUFFIX_LEN if rest.len() > TIMESTAMP_LEN => {
                let (with_sentinel, mut ts) = rest.split_at(rest.len() - TIMESTAMP_LEN);
                let (&sentinel, key) = with_sentinel.split_last().ok_or_else(invalid)?;
                if sentinel != SENTINEL {
                    return Err(invalid());
                }
                let timestamp = Timestamp::new(ts.get_i64(), ts.get_u32());
                if timestamp.is_zero() {
                    return Err(invalid());
                }
                Ok(Self::new(Bytes::copy_from_slice(key), timestamp))
            }
            _ => Err(invalid()),
        }
    }
}

impl Ord for MvccKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| match (self.is_meta(), other.is_meta()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => other.timestamp.cmp(&self.timestamp),
            })
    }
}

impl PartialOrd for MvccKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The metadata record of a key carrying an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccMetadata {
    pub txn: Option<TxnMeta>,
    /// Timestamp of the provisional version.
    pub timestamp: Timestamp,
    pub deleted: bool,
}

impl MvccMetadata {
    pub fn encode(&self) -> Result<Bytes, StoreError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| StoreError::InvalidMvccMetadata(Arc::new(e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::InvalidMvccMetadata(Arc::new(e)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MvccGetOptions {
    /// Return intents alongside the newest committed value instead of failing
    /// on them.
    pub inconsistent: bool,
    /// Read as this transaction, seeing its own provisional writes.
    pub txn: Option<TxnMeta>,
}

fn read_metadata<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
) -> Result<Option<MvccMetadata>, StoreError> {
    match reader.get(&MvccKey::meta(Bytes::copy_from_slice(key)))? {
        Some(raw) => MvccMetadata::decode(&raw).map(Some),
        None => Ok(None),
    }
}

/// Every version of `key` at or below `ts`, newest first.
fn versions_at_or_below(key: &[u8], ts: Timestamp) -> MvccKeyRange {
    let mut next = BytesMut::with_capacity(key.len() + 1);
    next.put_slice(key);
    next.put_u8(0);
    MvccKeyRange::new(
        MvccKey::new(Bytes::copy_from_slice(key), ts),
        MvccKey::meta(next.freeze()),
    )
}

/// Returns the newest version of `key` at or below `ts`, skipping the
/// version at `skip`.
fn newest_version<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
    ts: Timestamp,
    skip: Option<Timestamp>,
) -> Result<Option<(Timestamp, Bytes)>, StoreError> {
    let mut iter = reader.iter(versions_at_or_below(key, ts))?;
    while let Some(entry) = iter.next_entry()? {
        if entry.key.is_meta() || Some(entry.key.timestamp) == skip {
            continue;
        }
        return Ok(Some((entry.key.timestamp, entry.value)));
    }
    Ok(None)
}

fn live_value(value: Bytes) -> Option<Bytes> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Reads `key` at `ts`. Returns the visible value, if any, and the intents
/// encountered (only ever non-empty for inconsistent reads).
pub fn mvcc_get<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
    ts: Timestamp,
    opts: &MvccGetOptions,
) -> Result<(Option<Bytes>, Vec<Intent>), StoreError> {
    let mut intents = vec![];
    let mut skip = None;
    if let Some(meta) = read_metadata(reader, key)? {
        if let Some(owner) = meta.txn {
            let own = opts.txn.as_ref().is_some_and(|txn| txn.id == owner.id);
            if own {
                let provisional = reader.get(&MvccKey::new(
                    Bytes::copy_from_slice(key),
                    meta.timestamp,
                ))?;
                return Ok((provisional.and_then(live_value), intents));
            }
            skip = Some(meta.timestamp);
            if meta.timestamp <= ts {
                let intent = Intent::new(Bytes::copy_from_slice(key), owner);
                if !opts.inconsistent {
                    return Err(StoreError::WriteIntent {
                        intents: vec![intent],
                    });
                }
                intents.push(intent);
            }
        }
    }
    let value = newest_version(reader, key, ts, skip)?.and_then(|(_, value)| live_value(value));
    Ok((value, intents))
}

/// Reads `key` at `ts` from inside `txn`.
pub fn mvcc_get_as_txn<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
    ts: Timestamp,
    txn: &TxnMeta,
) -> Result<Option<Bytes>, StoreError> {
    let opts = MvccGetOptions {
        inconsistent: false,
        txn: Some(txn.clone()),
    };
    mvcc_get(reader, key, ts, &opts).map(|(value, _)| value)
}

/// Writes `value` to `key` at `ts`. With a transaction the write is left as an
/// intent owned by it.
pub fn mvcc_put<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    key: &[u8],
    ts: Timestamp,
    value: Bytes,
    txn: Option<&TxnMeta>,
) -> Result<(), StoreError> {
    let key = Bytes::copy_from_slice(key);
    if let Some(meta) = read_metadata(rw, &key)? {
        if let Some(owner) = meta.txn {
            match txn {
                Some(txn) if txn.id == owner.id => {
                    rw.clear(&MvccKey::new(key.clone(), meta.timestamp))?;
                }
                _ => {
                    return Err(StoreError::WriteIntent {
                        intents: vec![Intent::new(key, owner)],
                    })
                }
            }
        }
    }

    if let Some((existing, _)) = newest_version(rw, &key, Timestamp::MAX, None)? {
        if existing >= ts {
            return Err(StoreError::WriteTooOld {
                timestamp: ts,
                existing,
            });
        }
    }

    if let Some(txn) = txn {
        let mut owner = txn.clone();
        owner.write_timestamp = ts;
        let meta = MvccMetadata {
            txn: Some(owner),
            timestamp: ts,
            deleted: value.is_empty(),
        };
        rw.put(MvccKey::meta(key.clone()), meta.encode()?)?;
    }
    rw.put(MvccKey::new(key, ts), value)
}

/// Writes a deletion tombstone for `key` at `ts`.
pub fn mvcc_delete<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    key: &[u8],
    ts: Timestamp,
    txn: Option<&TxnMeta>,
) -> Result<(), StoreError> {
    mvcc_put(rw, key, ts, Bytes::new(), txn)
}

/// Resolves `intent` according to its transaction's final `status`. Returns
/// whether anything changed. An intent owned by another transaction, or one
/// that has already been resolved, is left alone.
pub fn mvcc_resolve_write_intent<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    intent: &Intent,
    status: TxnStatus,
) -> Result<bool, StoreError> {
    let Some(meta) = read_metadata(rw, &intent.key)? else {
        return Ok(false);
    };
    let Some(owner) = meta.txn else {
        return Ok(false);
    };
    if owner.id != intent.txn.id {
        return Ok(false);
    }
    match status {
        TxnStatus::Pending => Ok(false),
        TxnStatus::Committed => {
            rw.clear(&MvccKey::meta(intent.key.clone()))?;
            Ok(true)
        }
        TxnStatus::Aborted => {
            rw.clear(&MvccKey::meta(intent.key.clone()))?;
            rw.clear(&MvccKey::new(intent.key.clone(), meta.timestamp))?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemEngine;
    use rstest::rstest;

    fn ts(wall: i64) -> Timestamp {
        Timestamp::new(wall, 0)
    }

    fn put(engine: &InMemEngine, key: &[u8], wall: i64, value: &'static [u8], txn: Option<&TxnMeta>) {
        let mut batch = engine.new_batch();
        mvcc_put(&mut batch, key, ts(wall), Bytes::from_static(value), txn).unwrap();
        batch.commit();
    }

    fn get(engine: &InMemEngine, key: &[u8], wall: i64) -> Option<Bytes> {
        mvcc_get(engine, key, ts(wall), &MvccGetOptions::default())
            .unwrap()
            .0
    }

    #[test]
    fn test_metadata_sorts_before_versions_newest_first() {
        let mut keys = vec![
            MvccKey::new("a", ts(1)),
            MvccKey::new("b", ts(1)),
            MvccKey::meta("a"),
            MvccKey::new("a", ts(3)),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                MvccKey::meta("a"),
                MvccKey::new("a", ts(3)),
                MvccKey::new("a", ts(1)),
                MvccKey::new("b", ts(1)),
            ]
        );
    }

    #[rstest]
    #[case(MvccKey::meta("key"))]
    #[case(MvccKey::new("key", Timestamp::new(42, 7)))]
    #[case(MvccKey::new(Bytes::from_static(b"k\x00\x0d"), Timestamp::new(1, 0)))]
    fn test_encoded_key_decodes_to_itself(#[case] key: MvccKey) {
        let encoded = key.encode();
        assert_eq!(encoded.len(), key.encoded_len());
        assert_eq!(MvccKey::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn test_decode_rejects_unknown_suffix() {
        assert!(matches!(
            MvccKey::decode(b"key\x05"),
            Err(StoreError::InvalidMvccKey(_))
        ));
        assert!(matches!(
            MvccKey::decode(b""),
            Err(StoreError::InvalidMvccKey(_))
        ));
    }

    #[test]
    fn test_get_reads_newest_version_at_or_below_timestamp() {
        let engine = InMemEngine::new();
        put(&engine, b"k", 1, b"v1", None);
        put(&engine, b"k", 3, b"v3", None);

        assert_eq!(get(&engine, b"k", 0), None);
        assert_eq!(get(&engine, b"k", 2).unwrap(), "v1");
        assert_eq!(get(&engine, b"k", 3).unwrap(), "v3");
        assert_eq!(get(&engine, b"other", 3), None);
    }

    #[test]
    fn test_delete_hides_earlier_versions() {
        let engine = InMemEngine::new();
        put(&engine, b"k", 1, b"v1", None);
        let mut batch = engine.new_batch();
        mvcc_delete(&mut batch, b"k", ts(2), None).unwrap();
        batch.commit();

        assert_eq!(get(&engine, b"k", 1).unwrap(), "v1");
        assert_eq!(get(&engine, b"k", 2), None);
    }

    #[test]
    fn test_put_below_existing_version_is_too_old() {
        let engine = InMemEngine::new();
        put(&engine, b"k", 5, b"v5", None);
        let mut batch = engine.new_batch();
        let err = mvcc_put(&mut batch, b"k", ts(5), Bytes::from_static(b"v"), None).unwrap_err();
        assert!(matches!(
            err,
            StoreError::WriteTooOld { existing, .. } if existing == ts(5)
        ));
    }

    #[test]
    fn test_consistent_read_fails_on_foreign_intent() {
        let engine = InMemEngine::new();
        let txn = TxnMeta::new("k", ts(2));
        put(&engine, b"k", 1, b"v1", None);
        put(&engine, b"k", 2, b"v2", Some(&txn));

        let err = mvcc_get(&engine, b"k", ts(3), &MvccGetOptions::default()).unwrap_err();
        assert!(matches!(err, StoreError::WriteIntent { ref intents } if intents.len() == 1));
        // Below the intent the committed value is readable.
        assert_eq!(get(&engine, b"k", 1).unwrap(), "v1");
    }

    #[test]
    fn test_inconsistent_read_returns_committed_value_and_intent() {
        let engine = InMemEngine::new();
        let txn = TxnMeta::new("k", ts(2));
        put(&engine, b"k", 1, b"v1", None);
        put(&engine, b"k", 2, b"v2", Some(&txn));

        let opts = MvccGetOptions {
            inconsistent: true,
            txn: None,
        };
        let (value, intents) = mvcc_get(&engine, b"k", ts(3), &opts).unwrap();
        assert_eq!(value.unwrap(), "v1");
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].txn.id, txn.id);
        assert_eq!(intents[0].key, "k");

        let (_, intents) = mvcc_get(&engine, b"k", ts(1), &opts).unwrap();
        assert!(intents.is_empty());
    }

    #[test]
    fn test_read_as_owner_sees_provisional_value() {
        let engine = InMemEngine::new();
        let txn = TxnMeta::new("k", ts(2));
        put(&engine, b"k", 1, b"v1", None);
        let mut batch = engine.new_batch();
        mvcc_delete(&mut batch, b"k", ts(2), Some(&txn)).unwrap();
        batch.commit();

        assert_eq!(mvcc_get_as_txn(&engine, b"k", ts(3), &txn).unwrap(), None);

        let other = TxnMeta::new("k", ts(2));
        put(&engine, b"j", 2, b"put", Some(&other));
        assert_eq!(
            mvcc_get_as_txn(&engine, b"j", ts(3), &other).unwrap().unwrap(),
            "put"
        );
    }

    #[test]
    fn test_owner_rewrites_its_intent_but_others_conflict() {
        let engine = InMemEngine::new();
        let txn = TxnMeta::new("k", ts(2));
        put(&engine, b"k", 2, b"first", Some(&txn));
        put(&engine, b"k", 3, b"second", Some(&txn));
        assert_eq!(
            mvcc_get_as_txn(&engine, b"k", ts(3), &txn).unwrap().unwrap(),
            "second"
        );
        assert!(engine.get(&MvccKey::new("k", ts(2))).unwrap().is_none());

        let mut batch = engine.new_batch();
        let err = mvcc_put(&mut batch, b"k", ts(4), Bytes::from_static(b"x"), None).unwrap_err();
        assert!(matches!(err, StoreError::WriteIntent { .. }));
    }

    #[rstest]
    #[case(TxnStatus::Committed, Some("v2"))]
    #[case(TxnStatus::Aborted, Some("v1"))]
    fn test_resolve_intent(#[case] status: TxnStatus, #[case] expected: Option<&'static str>) {
        let engine = InMemEngine::new();
        let txn = TxnMeta::new("k", ts(2));
        put(&engine, b"k", 1, b"v1", None);
        put(&engine, b"k", 2, b"v2", Some(&txn));

        let intent = Intent::new(Bytes::from_static(b"k"), txn);
        let mut batch = engine.new_batch();
        assert!(mvcc_resolve_write_intent(&mut batch, &intent, status).unwrap());
        batch.commit();

        assert_eq!(get(&engine, b"k", 3), expected.map(Bytes::from));
        let mut batch = engine.new_batch();
        assert!(!mvcc_resolve_write_intent(&mut batch, &intent, status).unwrap());
    }

    #[test]
    fn test_pending_and_foreign_resolution_are_noops() {
        let engine = InMemEngine::new();
        let txn = TxnMeta::new("k", ts(2));
        put(&engine, b"k", 2, b"v2", Some(&txn));

        let mut batch = engine.new_batch();
        let intent = Intent::new(Bytes::from_static(b"k"), txn);
        assert!(!mvcc_resolve_write_intent(&mut batch, &intent, TxnStatus::Pending).unwrap());
        let foreign = Intent::new(Bytes::from_static(b"k"), TxnMeta::new("k", ts(2)));
        assert!(!mvcc_resolve_write_intent(&mut batch, &foreign, TxnStatus::Committed).unwrap());
        assert!(batch.is_empty());
    }
}
