//! # Stride MCU Protocol
//!
//! The binary protocol spoken between the stride host process and its
//! microcontrollers. This crate owns everything below the session layer:
//!
//! - **[`frame`]**: the sequenced, CRC-protected wire frame and a streaming
//!   parser that recovers frame boundaries from a raw byte stream.
//! - **[`varint`]**: the signed 7-bit variable-length integer coding used for
//!   every numeric field inside a frame payload.
//! - **[`dictionary`]**: the command dictionary negotiated at connect time,
//!   mapping command names to numeric ids and parameter signatures. The
//!   dictionary is transferred as zlib-compressed JSON.
//! - **[`command`]**: schema-driven encoding and decoding of tagged command
//!   values against a dictionary.
//! - **[`codec`]**: a [`tokio_util::codec`] `Encoder`/`Decoder` pair for use
//!   with framed async transports.
//!
//! ## Design
//!
//! The payload coding is dictionary-driven rather than derived: a command is
//! a tagged value `{ id, args }` and the dictionary's parameter signature
//! decides how each argument is written. This keeps the wire format stable
//! across host versions and lets the MCU's own dictionary be authoritative.
//! Frame parsing is zero-copy up to the point a frame is accepted, and a
//! corrupt frame discards exactly one sync candidate so the stream can
//! resynchronize.

pub mod codec;
pub mod command;
pub mod crc;
pub mod dictionary;
pub mod frame;
pub mod varint;

pub use codec::FrameCodec;
pub use command::{Command, Value};
pub use dictionary::{Dictionary, FieldType, MessageSpec};
pub use frame::Frame;

/// Errors raised while encoding or decoding protocol data.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame declared a length outside the legal `5..=64` range.
    #[error("frame length {0} outside legal range")]
    BadLength(u8),
    /// The sequence byte's high nibble was not the fixed destination tag.
    #[error("bad sequence byte {0:#04x}")]
    BadSequence(u8),
    /// The frame trailer did not end with the sync byte.
    #[error("missing frame sync byte")]
    BadSync,
    /// The CRC-16 of a received frame did not match its contents.
    #[error("frame CRC mismatch (got {got:#06x}, want {want:#06x})")]
    BadCrc { got: u16, want: u16 },
    /// A varint ran past the end of the payload or exceeded 32 bits.
    #[error("malformed varint in payload")]
    BadVarint,
    /// A message id that the session dictionary does not define.
    #[error("unknown message id {0}")]
    UnknownMessage(u32),
    /// A message name that the session dictionary does not define.
    #[error("unknown message name {0:?}")]
    UnknownName(String),
    /// An argument value did not match the field type in the dictionary.
    #[error("argument {index} of {name:?} does not match its declared type")]
    ArgumentType { name: String, index: usize },
    /// Wrong number of arguments for a message's signature.
    #[error("{name:?} takes {want} arguments, got {got}")]
    ArgumentCount { name: String, want: usize, got: usize },
    /// The dictionary blob failed to decompress or parse.
    #[error("bad dictionary: {0}")]
    Dictionary(String),
    /// A payload ended in the middle of a command.
    #[error("truncated command payload")]
    Truncated,
}
