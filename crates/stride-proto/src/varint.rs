//! Signed variable-length integer coding.
//!
//! Every numeric field in a frame payload is written as a signed VLQ:
//! 7 data bits per byte, most significant group first, high bit set on every
//! byte except the last. The first group is sign-extended from bit 6, so the
//! full `i32` range fits in at most five bytes.

use crate::ProtocolError;
use bytes::BufMut;

/// Maximum encoded size of one integer.
pub const MAX_VARINT_LEN: usize = 5;

/// Appends the minimal VLQ encoding of `v` to `out`.
pub fn encode_i32(v: i32, out: &mut impl BufMut) {
    // Number of 7-bit groups needed for a sign-correct round trip.
    let mut groups = 1;
    while groups < MAX_VARINT_LEN {
        let bits = 7 * groups;
        let lo = -(1i64 << (bits - 1));
        let hi = 1i64 << (bits - 1);
        if (v as i64) >= lo && (v as i64) < hi {
            break;
        }
        groups += 1;
    }
    for g in (0..groups).rev() {
        let mut byte = ((v >> (7 * g)) & 0x7f) as u8;
        if g != 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
    }
}

/// Appends an unsigned value, which must fit in `u32`.
///
/// Values above `i32::MAX` are carried in the same signed coding by
/// reinterpreting the bit pattern; decoders recover them with
/// [`decode_i32`]` as u32`.
pub fn encode_u32(v: u32, out: &mut impl BufMut) {
    encode_i32(v as i32, out);
}

/// Decodes one VLQ from the front of `input`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_i32(input: &[u8]) -> Result<(i32, usize), ProtocolError> {
    let first = *input.first().ok_or(ProtocolError::BadVarint)?;
    // Sign-extend the leading 7-bit group from bit 6.
    let mut v = ((first & 0x3f) as i64) - ((first & 0x40) as i64);
    let mut used = 1;
    let mut cont = first & 0x80 != 0;
    while cont {
        if used >= MAX_VARINT_LEN {
            return Err(ProtocolError::BadVarint);
        }
        let byte = *input.get(used).ok_or(ProtocolError::BadVarint)?;
        v = (v << 7) | (byte & 0x7f) as i64;
        used += 1;
        cont = byte & 0x80 != 0;
    }
    if v < i32::MIN as i64 || v > u32::MAX as i64 {
        return Err(ProtocolError::BadVarint);
    }
    Ok((v as i32, used))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_i32(v, &mut buf);
        let (decoded, used) = decode_i32(&buf).unwrap();
        assert_eq!(decoded, v, "value {v} did not round trip");
        assert_eq!(used, buf.len());
        buf
    }

    #[test]
    fn single_byte_values() {
        assert_eq!(roundtrip(0), [0x00]);
        assert_eq!(roundtrip(1), [0x01]);
        assert_eq!(roundtrip(-1), [0x7f]);
        assert_eq!(roundtrip(63), [0x3f]);
        assert_eq!(roundtrip(-64), [0x40]);
    }

    #[test]
    fn multi_byte_boundaries() {
        assert_eq!(roundtrip(64), [0x80, 0x40]);
        assert_eq!(roundtrip(-65), [0xff, 0x3f]);
        assert_eq!(roundtrip(300).len(), 2);
        assert_eq!(roundtrip(-300).len(), 2);
        assert_eq!(roundtrip(1 << 20).len(), 4);
    }

    #[test]
    fn full_range() {
        assert_eq!(roundtrip(i32::MAX).len(), 5);
        assert_eq!(roundtrip(i32::MIN).len(), 5);
    }

    #[test]
    fn unsigned_reinterpret() {
        let mut buf = Vec::new();
        encode_u32(0xdead_beef, &mut buf);
        let (v, _) = decode_i32(&buf).unwrap();
        assert_eq!(v as u32, 0xdead_beef);
    }

    #[test]
    fn truncated_input_rejected() {
        assert_eq!(decode_i32(&[]), Err(ProtocolError::BadVarint));
        assert_eq!(decode_i32(&[0x80]), Err(ProtocolError::BadVarint));
        // Six continuation bytes can never be a 32-bit value.
        assert_eq!(
            decode_i32(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(ProtocolError::BadVarint)
        );
    }
}
