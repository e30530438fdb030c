//! Schema-driven command values.
//!
//! A command is a tagged value: a name plus positional arguments. Nothing
//! about its wire form lives in the type itself; the session dictionary's
//! [`MessageSpec`] drives both encoding and decoding. This mirrors the
//! dynamically-typed command layer of the original firmware without any
//! runtime reflection.

use crate::dictionary::{FieldType, MessageSpec, MessageTable};
use crate::varint;
use crate::ProtocolError;
use bytes::{BufMut, BytesMut};

/// One argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U32(u32),
    I32(i32),
    U16(u16),
    I16(i16),
    U8(u8),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn matches(&self, ty: FieldType) -> bool {
        matches!(
            (self, ty),
            (Value::U32(_), FieldType::U32)
                | (Value::I32(_), FieldType::I32)
                | (Value::U16(_), FieldType::U16)
                | (Value::I16(_), FieldType::I16)
                | (Value::U8(_), FieldType::U8)
                | (Value::Str(_), FieldType::String)
                | (Value::Bytes(_), FieldType::Buffer)
        )
    }

    /// Numeric view used by callers that consume decoded responses.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::U32(v) => Some(v),
            Value::U16(v) => Some(v.into()),
            Value::U8(v) => Some(v.into()),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::I32(v) => Some(v),
            Value::I16(v) => Some(v.into()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// A tagged command or response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Value>,
}

impl Command {
    pub fn new(name: &str, args: Vec<Value>) -> Self {
        Command {
            name: name.to_string(),
            args,
        }
    }

    /// Looks up an argument by its name in `spec`.
    pub fn arg<'a>(&'a self, spec: &MessageSpec, name: &str) -> Option<&'a Value> {
        let index = spec.params.iter().position(|(n, _)| n == name)?;
        self.args.get(index)
    }

    /// Appends this command's wire form to `out` per `table`'s signature.
    pub fn encode(&self, table: &MessageTable, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let spec = table
            .by_name(&self.name)
            .ok_or_else(|| ProtocolError::UnknownName(self.name.clone()))?;
        if self.args.len() != spec.params.len() {
            return Err(ProtocolError::ArgumentCount {
                name: self.name.clone(),
                want: spec.params.len(),
                got: self.args.len(),
            });
        }
        varint::encode_u32(spec.id, out);
        for (index, (value, (_, ty))) in self.args.iter().zip(&spec.params).enumerate() {
            if !value.matches(*ty) {
                return Err(ProtocolError::ArgumentType {
                    name: self.name.clone(),
                    index,
                });
            }
            encode_value(value, out);
        }
        Ok(())
    }
}

fn encode_value(value: &Value, out: &mut BytesMut) {
    match value {
        Value::U32(v) => varint::encode_u32(*v, out),
        Value::I32(v) => varint::encode_i32(*v, out),
        Value::U16(v) => varint::encode_u32((*v).into(), out),
        Value::I16(v) => varint::encode_i32((*v).into(), out),
        Value::U8(v) => varint::encode_u32((*v).into(), out),
        Value::Str(s) => {
            varint::encode_u32(s.len() as u32, out);
            out.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            varint::encode_u32(b.len() as u32, out);
            out.put_slice(b);
        }
    }
}

/// Encodes a batch of commands into one frame payload.
pub fn encode_batch(commands: &[Command], table: &MessageTable) -> Result<BytesMut, ProtocolError> {
    let mut out = BytesMut::new();
    for command in commands {
        command.encode(table, &mut out)?;
    }
    Ok(out)
}

/// Decodes every command in a frame payload.
///
/// The payload must be fully consumed; trailing bytes that do not form a
/// complete command are a [`ProtocolError::Truncated`].
pub fn decode_batch(payload: &[u8], table: &MessageTable) -> Result<Vec<Command>, ProtocolError> {
    let mut commands = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let (command, used) = decode_one(rest, table)?;
        commands.push(command);
        rest = &rest[used..];
    }
    Ok(commands)
}

fn decode_one(input: &[u8], table: &MessageTable) -> Result<(Command, usize), ProtocolError> {
    let (raw_id, mut used) = varint::decode_i32(input)?;
    let id = raw_id as u32;
    let (name, spec) = table.by_id(id).ok_or(ProtocolError::UnknownMessage(id))?;
    let mut args = Vec::with_capacity(spec.params.len());
    for (_, ty) in &spec.params {
        let (value, n) = decode_value(*ty, &input[used..])?;
        args.push(value);
        used += n;
    }
    Ok((Command::new(name, args), used))
}

fn decode_value(ty: FieldType, input: &[u8]) -> Result<(Value, usize), ProtocolError> {
    let (raw, used) = varint::decode_i32(input)?;
    let value = match ty {
        FieldType::U32 => Value::U32(raw as u32),
        FieldType::I32 => Value::I32(raw),
        FieldType::U16 => Value::U16(
            u16::try_from(raw).map_err(|_| ProtocolError::BadVarint)?,
        ),
        FieldType::I16 => Value::I16(
            i16::try_from(raw).map_err(|_| ProtocolError::BadVarint)?,
        ),
        FieldType::U8 => Value::U8(
            u8::try_from(raw).map_err(|_| ProtocolError::BadVarint)?,
        ),
        FieldType::String | FieldType::Buffer => {
            let len = usize::try_from(raw).map_err(|_| ProtocolError::BadVarint)?;
            let data = input
                .get(used..used + len)
                .ok_or(ProtocolError::Truncated)?;
            let value = if ty == FieldType::String {
                Value::Str(
                    String::from_utf8(data.to_vec())
                        .map_err(|_| ProtocolError::Truncated)?,
                )
            } else {
                Value::Bytes(data.to_vec())
            };
            return Ok((value, used + len));
        }
    };
    Ok((value, used))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{DictionaryBuilder, FieldType, IDENTIFY_ID};

    fn table() -> MessageTable {
        DictionaryBuilder::new("test")
            .command(
                "identify",
                IDENTIFY_ID,
                &[("offset", FieldType::U32), ("count", FieldType::U8)],
            )
            .command(
                "queue_step",
                11,
                &[
                    ("oid", FieldType::U8),
                    ("interval", FieldType::U32),
                    ("count", FieldType::U16),
                    ("add", FieldType::I16),
                ],
            )
            .command("get_clock", 14, &[])
            .command("note", 15, &[("text", FieldType::String)])
            .build()
            .commands
    }

    #[test]
    fn batch_roundtrip() {
        let table = table();
        let commands = vec![
            Command::new(
                "queue_step",
                vec![
                    Value::U8(3),
                    Value::U32(1000),
                    Value::U16(5),
                    Value::I16(-1),
                ],
            ),
            Command::new("get_clock", vec![]),
            Command::new("note", vec![Value::Str("hi".into())]),
        ];
        let payload = encode_batch(&commands, &table).unwrap();
        let decoded = decode_batch(&payload, &table).unwrap();
        assert_eq!(decoded, commands);
    }

    #[test]
    fn wrong_arity_rejected() {
        let table = table();
        let cmd = Command::new("get_clock", vec![Value::U8(1)]);
        assert!(matches!(
            cmd.encode(&table, &mut BytesMut::new()),
            Err(ProtocolError::ArgumentCount { .. })
        ));
    }

    #[test]
    fn wrong_type_rejected() {
        let table = table();
        let cmd = Command::new("note", vec![Value::U32(1)]);
        assert!(matches!(
            cmd.encode(&table, &mut BytesMut::new()),
            Err(ProtocolError::ArgumentType { index: 0, .. })
        ));
    }

    #[test]
    fn unknown_id_rejected() {
        let table = table();
        let mut payload = BytesMut::new();
        crate::varint::encode_u32(99, &mut payload);
        assert_eq!(
            decode_batch(&payload, &table),
            Err(ProtocolError::UnknownMessage(99))
        );
    }

    #[test]
    fn out_of_range_decode_rejected() {
        let table = table();
        // queue_step with count encoded as a value above u16::MAX.
        let mut payload = BytesMut::new();
        crate::varint::encode_u32(11, &mut payload);
        crate::varint::encode_u32(3, &mut payload);
        crate::varint::encode_u32(1000, &mut payload);
        crate::varint::encode_u32(0x1_0000, &mut payload);
        crate::varint::encode_i32(-1, &mut payload);
        assert!(decode_batch(&payload, &table).is_err());
    }

    #[test]
    fn truncated_buffer_rejected() {
        let table = DictionaryBuilder::new("t")
            .command("blob", 4, &[("data", FieldType::Buffer)])
            .build()
            .commands;
        let mut payload = BytesMut::new();
        crate::varint::encode_u32(4, &mut payload);
        crate::varint::encode_u32(10, &mut payload);
        payload.put_slice(b"abc");
        assert_eq!(
            decode_batch(&payload, &table),
            Err(ProtocolError::Truncated)
        );
    }
}
