//! Base-128 varints as used inside JeeLabs V1 frames and packed payloads.
//!
//! Encoding is little-endian: each byte carries 7 value bits, and a set top
//! bit means another byte follows. A 32-bit value needs at most 5 bytes.

/// Longest encoding of a 32-bit value.
pub const MAX_VARINT_LEN: usize = 5;

/// Upper bound on values extracted by [`decode_varints`].
pub const MAX_PACKED_VALUES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// Input ended while the continuation bit was still set.
    Truncated,
    /// More than `max_len` bytes, or bits beyond 32.
    Overlong,
}

/// Decode one varint from the front of `bytes`, reading at most `max_len` bytes.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_varint(bytes: &[u8], max_len: usize) -> Result<(u32, usize), VarintError> {
    let limit = max_len.min(MAX_VARINT_LEN);
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, b) in bytes.iter().enumerate() {
        if i >= limit {
            return Err(VarintError::Overlong);
        }
        value |= ((b & 0x7F) as u64) << shift;
        if (b & 0x80) == 0 {
            if value > u32::MAX as u64 {
                return Err(VarintError::Overlong);
            }
            return Ok((value as u32, i + 1));
        }
        shift += 7;
    }
    if bytes.len() >= limit {
        Err(VarintError::Overlong)
    } else {
        Err(VarintError::Truncated)
    }
}

pub fn encode_varint(mut value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_VARINT_LEN);
    loop {
        let low = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(low);
            return out;
        }
        out.push(low | 0x80);
    }
}

/// Interpret a whole payload as a packed sequence of varints.
///
/// Returns `None` unless every byte belongs to a complete varint and at most
/// `max_count` values are present.
pub fn decode_varints(bytes: &[u8], max_count: usize) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if values.len() >= max_count {
            return None;
        }
        let (v, used) = decode_varint(rest, MAX_VARINT_LEN).ok()?;
        values.push(v);
        rest = &rest[used..];
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_values() {
        assert_eq!(decode_varint(&[0x00], 5), Ok((0, 1)));
        assert_eq!(decode_varint(&[0x7F, 0xAA], 5), Ok((127, 1)));
        assert_eq!(encode_varint(5), vec![5]);
    }

    #[test]
    fn two_byte_value_300() {
        let enc = encode_varint(300);
        assert_eq!(enc, vec![0xAC, 0x02]);
        assert_eq!(decode_varint(&enc, 5), Ok((300, 2)));
    }

    #[test]
    fn max_u32_uses_five_bytes() {
        let enc = encode_varint(u32::MAX);
        assert_eq!(enc.len(), 5);
        assert_eq!(decode_varint(&enc, 5), Ok((u32::MAX, 5)));
    }

    #[test]
    fn rejects_truncated_and_overlong() {
        assert_eq!(decode_varint(&[0x80, 0x80], 5), Err(VarintError::Truncated));
        assert_eq!(decode_varint(&[], 5), Err(VarintError::Truncated));
        assert_eq!(
            decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01], 5),
            Err(VarintError::Overlong)
        );
        // fifth byte carrying bits past 32
        assert_eq!(
            decode_varint(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F], 5),
            Err(VarintError::Overlong)
        );
        // caller-imposed window is honoured
        assert_eq!(decode_varint(&[0x80, 0x80, 0x01], 2), Err(VarintError::Overlong));
    }

    #[test]
    fn packed_values() {
        assert_eq!(decode_varints(&[1, 0xAC, 0x02, 7], 20), Some(vec![1, 300, 7]));
        assert_eq!(decode_varints(&[], 20), Some(vec![]));
        assert_eq!(decode_varints(&[1, 0x80], 20), None);
        assert_eq!(decode_varints(&[1, 2, 3], 2), None);
    }
}
