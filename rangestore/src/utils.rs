use bytes::{Buf, BufMut};

use crate::error::StoreError;

/// Appends `value` as an unsigned LEB128 varint.
pub(crate) fn encode_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Reads an unsigned LEB128 varint from the front of `buf`.
pub(crate) fn decode_varint(buf: &mut impl Buf) -> Result<u64, StoreError> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(StoreError::InvalidBatchRepr("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(StoreError::InvalidBatchRepr("varint overflow".to_string()))
}

pub(crate) fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}
