//! The sequenced wire frame and a streaming frame parser.
//!
//! Every frame on the link has the layout:
//!
//! ```text
//! +--------+--------+- - - - - - -+---------+--------+
//! | length | seq    | payload     | crc16   | sync   |
//! | 1 byte | 1 byte | len-5 bytes | 2 bytes | 1 byte |
//! +--------+--------+- - - - - - -+---------+--------+
//! ```
//!
//! `length` counts the whole frame including header and trailer and must lie
//! in `5..=64`. The sequence byte carries a fixed `0x10` tag in its high
//! nibble and the 4-bit sequence number in its low nibble. The CRC-16-CCITT
//! covers the length, sequence, and payload bytes and is stored big-endian.
//! The trailing sync byte is `0x7E`.

use crate::{crc::crc16_ccitt, ProtocolError};
use bytes::{BufMut, Bytes, BytesMut};

/// Smallest legal frame: header plus trailer, empty payload.
pub const FRAME_MIN: usize = 5;
/// Largest legal frame.
pub const FRAME_MAX: usize = 64;
/// Largest payload a single frame can carry.
pub const PAYLOAD_MAX: usize = FRAME_MAX - FRAME_MIN;
/// Fixed tag in the high nibble of the sequence byte.
pub const SEQ_TAG: u8 = 0x10;
/// Mask for the sequence number itself.
pub const SEQ_MASK: u8 = 0x0f;
/// Trailing sync byte.
pub const SYNC_BYTE: u8 = 0x7e;

/// One decoded frame: a 4-bit sequence number and its payload bytes.
///
/// An empty payload is meaningful: it is the acknowledgment frame, whose
/// sequence number names the next frame the sender expects to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame carrying `payload` under sequence number `seq mod 16`.
    pub fn new(seq: u64, payload: impl Into<Bytes>) -> Self {
        Frame {
            seq: (seq & SEQ_MASK as u64) as u8,
            payload: payload.into(),
        }
    }

    /// An empty acknowledgment frame for `next_expected_seq`.
    pub fn ack(next_expected_seq: u64) -> Self {
        Self::new(next_expected_seq, Bytes::new())
    }

    /// True if this frame is a bare acknowledgment.
    pub fn is_ack(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serializes the frame into `dst`.
    ///
    /// Fails with [`ProtocolError::BadLength`] when the payload exceeds
    /// [`PAYLOAD_MAX`]; callers split oversized command batches across
    /// frames instead.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = self.payload.len() + FRAME_MIN;
        if len > FRAME_MAX {
            return Err(ProtocolError::BadLength(len as u8));
        }
        dst.reserve(len);
        let start = dst.len();
        dst.put_u8(len as u8);
        dst.put_u8(SEQ_TAG | (self.seq & SEQ_MASK));
        dst.put_slice(&self.payload);
        let crc = crc16_ccitt(&dst[start..]);
        dst.put_u16(crc);
        dst.put_u8(SYNC_BYTE);
        Ok(())
    }
}

/// Attempts to parse a single frame from the start of `input`.
///
/// # Returns
///
/// - `Ok(Some((frame, consumed)))` when a valid frame was parsed.
/// - `Ok(None)` when `input` holds only a prefix of a frame; the caller
///   should read more bytes and retry.
/// - `Err((error, discard))` when the leading bytes cannot be a valid frame.
///   The caller must drop `discard` bytes and retry, which resynchronizes
///   the stream after line noise.
pub fn parse(input: &[u8]) -> Result<Option<(Frame, usize)>, (ProtocolError, usize)> {
    let Some(&len_byte) = input.first() else {
        return Ok(None);
    };
    let len = len_byte as usize;
    if !(FRAME_MIN..=FRAME_MAX).contains(&len) {
        return Err((ProtocolError::BadLength(len_byte), 1));
    }
    if input.len() < 2 {
        return Ok(None);
    }
    let seq_byte = input[1];
    if seq_byte & !SEQ_MASK != SEQ_TAG {
        return Err((ProtocolError::BadSequence(seq_byte), 1));
    }
    if input.len() < len {
        return Ok(None);
    }
    let frame = &input[..len];
    if frame[len - 1] != SYNC_BYTE {
        return Err((ProtocolError::BadSync, 1));
    }
    let want = crc16_ccitt(&frame[..len - 3]);
    let got = u16::from_be_bytes([frame[len - 3], frame[len - 2]]);
    if got != want {
        return Err((ProtocolError::BadCrc { got, want }, 1));
    }
    let parsed = Frame {
        seq: seq_byte & SEQ_MASK,
        payload: Bytes::copy_from_slice(&frame[2..len - 3]),
    };
    Ok(Some((parsed, len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn roundtrip_empty_payload() {
        let frame = Frame::ack(7);
        let buf = encode(&frame);
        assert_eq!(buf.len(), FRAME_MIN);
        assert_eq!(buf[0], 5);
        assert_eq!(buf[1], 0x17);
        assert_eq!(buf[4], SYNC_BYTE);
        let (parsed, used) = parse(&buf).unwrap().unwrap();
        assert_eq!(used, FRAME_MIN);
        assert_eq!(parsed, frame);
        assert!(parsed.is_ack());
    }

    #[test]
    fn roundtrip_with_payload() {
        let frame = Frame::new(3, &b"\x0b\x03\x01"[..]);
        let buf = encode(&frame);
        let (parsed, used) = parse(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(parsed, frame);
    }

    #[test]
    fn sequence_wraps_mod_16() {
        assert_eq!(Frame::new(16, Bytes::new()).seq, 0);
        assert_eq!(Frame::new(0x2f, Bytes::new()).seq, 0x0f);
    }

    #[test]
    fn oversized_payload_rejected() {
        let frame = Frame::new(0, vec![0u8; PAYLOAD_MAX + 1]);
        let mut buf = BytesMut::new();
        assert!(matches!(
            frame.encode(&mut buf),
            Err(ProtocolError::BadLength(_))
        ));
    }

    #[test]
    fn incomplete_frame_wants_more() {
        let buf = encode(&Frame::new(1, &b"abcdef"[..]));
        for cut in 0..buf.len() {
            assert_eq!(parse(&buf[..cut]).unwrap(), None, "prefix {cut}");
        }
    }

    #[test]
    fn corrupt_crc_discards_one_byte() {
        let mut buf = encode(&Frame::new(1, &b"xyz"[..]));
        let crc_at = buf.len() - 3;
        buf[crc_at] ^= 0xff;
        let (err, discard) = parse(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::BadCrc { .. }));
        assert_eq!(discard, 1);
    }

    #[test]
    fn resync_after_noise() {
        let mut stream = vec![0xde, 0xad, 0x03];
        let frame = Frame::new(9, &b"ok"[..]);
        stream.extend_from_slice(&encode(&frame));
        // Drive the parser the way a session reader does: drop the discard
        // count on error until a frame comes out.
        let mut offset = 0;
        let parsed = loop {
            match parse(&stream[offset..]) {
                Ok(Some((frame, _))) => break frame,
                Ok(None) => panic!("parser stalled"),
                Err((_, discard)) => offset += discard,
            }
        };
        assert_eq!(parsed, frame);
    }
}
