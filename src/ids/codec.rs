//! Delta-varint encoding for ascending ID sequences.
//!
//! The first ID is written as-is, every following ID as the (non-zero) gap to
//! its predecessor. Follower IDs cluster heavily, so most gaps fit in far fewer
//! than eight bytes.

use crate::error::{Result, StoreError};
use integer_encoding::VarInt;

/// Upper bound on the size of one encoded value.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the encoding of a strictly ascending slice to `out`.
pub fn encode_into(ids: &[u64], out: &mut Vec<u8>) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut previous = None;

    for &id in ids {
        let delta = match previous {
            Some(previous) => id - previous,
            None => id,
        };
        let len = delta.encode_var(&mut buf);
        out.extend_from_slice(&buf[..len]);
        previous = Some(id);
    }
}

/// Encode a strictly ascending slice into a fresh buffer.
pub fn encode(ids: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() * 4);
    encode_into(ids, &mut out);
    out
}

/// Decode exactly `count` IDs from `bytes`, which must be consumed entirely.
pub fn decode(bytes: &[u8], count: usize) -> Result<Vec<u64>> {
    let mut ids = Vec::with_capacity(count);
    let mut position = 0;
    let mut previous: Option<u64> = None;

    for _ in 0..count {
        let (delta, len) = u64::decode_var(&bytes[position..])
            .ok_or_else(|| StoreError::Corruption("Truncated ID block".into()))?;
        position += len;

        let id = match previous {
            None => delta,
            Some(_) if delta == 0 => {
                return Err(StoreError::Corruption("Non-increasing ID in block".into()))
            }
            Some(previous) => previous
                .checked_add(delta)
                .ok_or_else(|| StoreError::Corruption("ID overflow in block".into()))?,
        };

        ids.push(id);
        previous = Some(id);
    }

    if position != bytes.len() {
        return Err(StoreError::Corruption(format!(
            "ID block has {} trailing bytes",
            bytes.len() - position
        )));
    }

    Ok(ids)
}
