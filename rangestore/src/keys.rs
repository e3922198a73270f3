//! # Keys
//!
//! Layout of the store's key space. Local keys (prefixed with [LOCAL_PREFIX])
//! hold per-range bookkeeping and sort below every addressable key. Meta keys
//! come next and user keys sort above [META_MAX].
//!
//! ```text
//! 0x01 'i' <range_id:u64be> 'r' <suffix>     range-ID replicated
//! 0x01 'i' <range_id:u64be> 'u' <suffix>     range-ID unreplicated
//! 0x01 'k' <encoded key> <suffix> [detail]   range-local (addressed by key)
//! 0x02 <key>                                 meta1
//! 0x03 <key>                                 meta2
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::descriptor::RangeId;
use crate::error::StoreError;
use crate::types::TxnId;

pub const KEY_MIN: &[u8] = b"";
pub const KEY_MAX: &[u8] = b"\xff\xff";

pub const LOCAL_PREFIX: &[u8] = b"\x01";
pub const LOCAL_MAX: &[u8] = b"\x02";

pub const META1_PREFIX: &[u8] = b"\x02";
pub const META2_PREFIX: &[u8] = b"\x03";
pub const META_MAX: &[u8] = b"\x04";

pub const LOCAL_RANGE_ID_PREFIX: &[u8] = b"\x01i";
pub const LOCAL_RANGE_PREFIX: &[u8] = b"\x01k";

const REPLICATED_INFIX: &[u8] = b"r";
const UNREPLICATED_INFIX: &[u8] = b"u";

const RANGE_LEASE_SUFFIX: &[u8] = b"rll-";
const RANGE_APPLIED_STATE_SUFFIX: &[u8] = b"rask";
const RAFT_HARD_STATE_SUFFIX: &[u8] = b"rfth";

const RANGE_DESCRIPTOR_SUFFIX: &[u8] = b"rdsc";
const TRANSACTION_SUFFIX: &[u8] = b"txn-";

const ESCAPE: u8 = 0x00;
const ESCAPED_00: u8 = 0xff;
const ESCAPED_TERM: u8 = 0x01;

/// Appends an order-preserving, self-delimiting encoding of `key` to `buf`.
pub fn encode_bytes_ascending(buf: &mut BytesMut, key: &[u8]) {
    for &b in key {
        if b == ESCAPE {
            buf.put_u8(ESCAPE);
            buf.put_u8(ESCAPED_00);
        } else {
            buf.put_u8(b);
        }
    }
    buf.put_u8(ESCAPE);
    buf.put_u8(ESCAPED_TERM);
}

/// Decodes a key written by [encode_bytes_ascending], returning the key and
/// the unconsumed remainder of `buf`.
pub fn decode_bytes_ascending(buf: &[u8]) -> Result<(Bytes, &[u8]), StoreError> {
    let mut out = BytesMut::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        let b = buf[i];
        if b != ESCAPE {
            out.put_u8(b);
            i += 1;
            continue;
        }
        match buf.get(i + 1) {
            Some(&ESCAPED_00) => {
                out.put_u8(ESCAPE);
                i += 2;
            }
            Some(&ESCAPED_TERM) => return Ok((out.freeze(), &buf[i + 2..])),
            _ => break,
        }
    }
    Err(StoreError::InvalidKeyEncoding(Bytes::copy_from_slice(buf)))
}

/// Returns the first key that does not have `key` as a prefix. An empty key,
/// or one made entirely of `0xff` bytes, has no such key and is returned as is.
pub fn prefix_end(key: &[u8]) -> Bytes {
    let mut end = key.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Bytes::from(end);
        }
        end.pop();
    }
    Bytes::copy_from_slice(key)
}

pub fn is_local(key: &[u8]) -> bool {
    key.starts_with(LOCAL_PREFIX)
}

fn make_range_id_prefix(range_id: RangeId) -> BytesMut {
    let mut buf = BytesMut::with_capacity(LOCAL_RANGE_ID_PREFIX.len() + 9);
    buf.put_slice(LOCAL_RANGE_ID_PREFIX);
    buf.put_u64(range_id.0);
    buf
}

/// Prefix of the range-ID keys that are part of replicated state.
pub fn make_range_id_replicated_prefix(range_id: RangeId) -> Bytes {
    let mut buf = make_range_id_prefix(range_id);
    buf.put_slice(REPLICATED_INFIX);
    buf.freeze()
}

/// Prefix of the range-ID keys that each replica keeps for itself.
pub fn make_range_id_unreplicated_prefix(range_id: RangeId) -> Bytes {
    let mut buf = make_range_id_prefix(range_id);
    buf.put_slice(UNREPLICATED_INFIX);
    buf.freeze()
}

fn make_range_id_key(prefix: Bytes, suffix: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(prefix.len() + suffix.len());
    buf.put_slice(&prefix);
    buf.put_slice(suffix);
    buf.freeze()
}

pub fn range_lease_key(range_id: RangeId) -> Bytes {
    make_range_id_key(
        make_range_id_replicated_prefix(range_id),
        RANGE_LEASE_SUFFIX,
    )
}

pub fn range_applied_state_key(range_id: RangeId) -> Bytes {
    make_range_id_key(
        make_range_id_replicated_prefix(range_id),
        RANGE_APPLIED_STATE_SUFFIX,
    )
}

pub fn raft_hard_state_key(range_id: RangeId) -> Bytes {
    make_range_id_key(
        make_range_id_unreplicated_prefix(range_id),
        RAFT_HARD_STATE_SUFFIX,
    )
}

/// Prefix shared by every range-local key addressed by `key`.
pub fn make_range_key_prefix(key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LOCAL_RANGE_PREFIX.len() + key.len() + 2);
    buf.put_slice(LOCAL_RANGE_PREFIX);
    encode_bytes_ascending(&mut buf, key);
    buf.freeze()
}

pub fn make_range_key(key: &[u8], suffix: &[u8], detail: &[u8]) -> Bytes {
    let prefix = make_range_key_prefix(key);
    let mut buf = BytesMut::with_capacity(prefix.len() + suffix.len() + detail.len());
    buf.put_slice(&prefix);
    buf.put_slice(suffix);
    buf.put_slice(detail);
    buf.freeze()
}

/// The range-local key holding the descriptor of the range starting at `start_key`.
pub fn range_descriptor_key(start_key: &[u8]) -> Bytes {
    make_range_key(start_key, RANGE_DESCRIPTOR_SUFFIX, b"")
}

pub fn transaction_key(anchor: &[u8], txn_id: TxnId) -> Bytes {
    make_range_key(anchor, TRANSACTION_SUFFIX, txn_id.as_bytes())
}

/// The meta2 key under which the descriptor of the range ending at `end_key`
/// is indexed.
pub fn range_meta_key(end_key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(META2_PREFIX.len() + end_key.len());
    buf.put_slice(META2_PREFIX);
    buf.put_slice(end_key);
    buf.freeze()
}

/// Returns the addressable key that `key` belongs to, or `None` for range-ID
/// keys, which are addressed by range rather than by key.
pub fn addr(key: &[u8]) -> Result<Option<Bytes>, StoreError> {
    if key.starts_with(LOCAL_RANGE_ID_PREFIX) {
        return Ok(None);
    }
    if let Some(rest) = key.strip_prefix(LOCAL_RANGE_PREFIX) {
        let (addressed, _suffix) = decode_bytes_ascending(rest)?;
        return Ok(Some(addressed));
    }
    if is_local(key) {
        return Err(StoreError::InvalidKeyEncoding(Bytes::copy_from_slice(key)));
    }
    Ok(Some(Bytes::copy_from_slice(key)))
}
