//! The negotiated command dictionary.
//!
//! An MCU does not use fixed ids for its commands. At connect time the host
//! fetches a compact id→signature mapping from the MCU (the `identify`
//! exchange) and pins it for the session's lifetime. The mapping travels as
//! zlib-compressed JSON so it fits in a handful of frames.
//!
//! The one exception is `identify` itself: its id and signature are pinned
//! by the protocol so the dictionary can be fetched before any dictionary
//! exists. [`Dictionary::bootstrap`] returns exactly that subset.

use crate::ProtocolError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

/// Wire type of one command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U32,
    I32,
    U16,
    I16,
    U8,
    String,
    Buffer,
}

impl FieldType {
    fn parse(s: &str) -> Result<Self, ProtocolError> {
        Ok(match s {
            "u32" => FieldType::U32,
            "i32" => FieldType::I32,
            "u16" => FieldType::U16,
            "i16" => FieldType::I16,
            "u8" => FieldType::U8,
            "string" => FieldType::String,
            "buffer" => FieldType::Buffer,
            other => {
                return Err(ProtocolError::Dictionary(format!(
                    "unknown field type {other:?}"
                )))
            }
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldType::U32 => "u32",
            FieldType::I32 => "i32",
            FieldType::U16 => "u16",
            FieldType::I16 => "i16",
            FieldType::U8 => "u8",
            FieldType::String => "string",
            FieldType::Buffer => "buffer",
        }
    }
}

/// Signature of one command or response: its numeric id and parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSpec {
    pub id: u32,
    pub params: Vec<(String, FieldType)>,
}

/// One direction of the dictionary: name→spec plus an id index for decoding.
#[derive(Debug, Clone, Default)]
pub struct MessageTable {
    by_name: HashMap<String, MessageSpec>,
    id_to_name: HashMap<u32, String>,
}

impl MessageTable {
    fn insert(&mut self, name: &str, spec: MessageSpec) {
        self.id_to_name.insert(spec.id, name.to_string());
        self.by_name.insert(name.to_string(), spec);
    }

    pub fn by_name(&self, name: &str) -> Option<&MessageSpec> {
        self.by_name.get(name)
    }

    pub fn by_id(&self, id: u32) -> Option<(&str, &MessageSpec)> {
        let name = self.id_to_name.get(&id)?;
        self.by_name.get(name).map(|spec| (name.as_str(), spec))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

/// A session's pinned command dictionary.
///
/// `commands` are host→MCU, `responses` are MCU→host; the two id spaces are
/// independent.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    pub version: String,
    pub commands: MessageTable,
    pub responses: MessageTable,
}

/// Pinned id of `identify` and `identify_response`.
pub const IDENTIFY_ID: u32 = 0;

#[derive(Serialize, Deserialize)]
struct RawDictionary {
    version: String,
    commands: BTreeMap<String, RawSpec>,
    responses: BTreeMap<String, RawSpec>,
}

#[derive(Serialize, Deserialize)]
struct RawSpec {
    id: u32,
    params: Vec<(String, String)>,
}

impl Dictionary {
    /// The pre-negotiation dictionary: just the pinned `identify` exchange.
    pub fn bootstrap() -> Self {
        DictionaryBuilder::new("bootstrap")
            .command(
                "identify",
                IDENTIFY_ID,
                &[("offset", FieldType::U32), ("count", FieldType::U8)],
            )
            .response(
                "identify_response",
                IDENTIFY_ID,
                &[("offset", FieldType::U32), ("data", FieldType::Buffer)],
            )
            .build()
    }

    /// Parses a dictionary from its raw (decompressed) JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawDictionary = serde_json::from_slice(data)
            .map_err(|e| ProtocolError::Dictionary(e.to_string()))?;
        let mut dict = Dictionary {
            version: raw.version,
            ..Default::default()
        };
        for (name, spec) in &raw.commands {
            dict.commands.insert(name, Self::parse_spec(spec)?);
        }
        for (name, spec) in &raw.responses {
            dict.responses.insert(name, Self::parse_spec(spec)?);
        }
        // The identify exchange must always be present at its pinned id, or
        // the host could never re-fetch the dictionary after a reset.
        match dict.commands.by_name("identify") {
            Some(spec) if spec.id == IDENTIFY_ID => {}
            _ => {
                return Err(ProtocolError::Dictionary(
                    "dictionary does not pin identify at id 0".into(),
                ))
            }
        }
        Ok(dict)
    }

    /// Parses a dictionary from its zlib-compressed transfer form.
    pub fn from_zlib(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut decoder = ZlibDecoder::new(data);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| ProtocolError::Dictionary(e.to_string()))?;
        Self::from_json(&json)
    }

    /// Serializes to the zlib-compressed transfer form (used by the MCU
    /// simulator and by dictionary round-trip tests).
    pub fn to_zlib(&self) -> Vec<u8> {
        let raw = RawDictionary {
            version: self.version.clone(),
            commands: Self::raw_table(&self.commands),
            responses: Self::raw_table(&self.responses),
        };
        let json = serde_json::to_vec(&raw).expect("dictionary serialization cannot fail");
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .expect("in-memory zlib write cannot fail");
        encoder.finish().expect("in-memory zlib write cannot fail")
    }

    fn parse_spec(raw: &RawSpec) -> Result<MessageSpec, ProtocolError> {
        let params = raw
            .params
            .iter()
            .map(|(name, ty)| Ok((name.clone(), FieldType::parse(ty)?)))
            .collect::<Result<_, ProtocolError>>()?;
        Ok(MessageSpec { id: raw.id, params })
    }

    fn raw_table(table: &MessageTable) -> BTreeMap<String, RawSpec> {
        table
            .by_name
            .iter()
            .map(|(name, spec)| {
                let params = spec
                    .params
                    .iter()
                    .map(|(n, t)| (n.clone(), t.as_str().to_string()))
                    .collect();
                (name.clone(), RawSpec { id: spec.id, params })
            })
            .collect()
    }
}

/// Builder used by the simulator and by tests to assemble dictionaries.
#[derive(Debug, Default)]
pub struct DictionaryBuilder {
    dict: Dictionary,
}

impl DictionaryBuilder {
    pub fn new(version: &str) -> Self {
        DictionaryBuilder {
            dict: Dictionary {
                version: version.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn command(mut self, name: &str, id: u32, params: &[(&str, FieldType)]) -> Self {
        self.dict.commands.insert(name, Self::spec(id, params));
        self
    }

    pub fn response(mut self, name: &str, id: u32, params: &[(&str, FieldType)]) -> Self {
        self.dict.responses.insert(name, Self::spec(id, params));
        self
    }

    pub fn build(self) -> Dictionary {
        self.dict
    }

    fn spec(id: u32, params: &[(&str, FieldType)]) -> MessageSpec {
        MessageSpec {
            id,
            params: params
                .iter()
                .map(|(n, t)| (n.to_string(), *t))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dictionary {
        DictionaryBuilder::new("test-1")
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
            .response(
                "identify_response",
                IDENTIFY_ID,
                &[("offset", FieldType::U32), ("data", FieldType::Buffer)],
            )
            .response("clock", 72, &[("clock", FieldType::U32)])
            .build()
    }

    #[test]
    fn zlib_roundtrip() {
        let dict = sample();
        let blob = dict.to_zlib();
        let parsed = Dictionary::from_zlib(&blob).unwrap();
        assert_eq!(parsed.version, "test-1");
        let spec = parsed.commands.by_name("queue_step").unwrap();
        assert_eq!(spec.id, 11);
        assert_eq!(spec.params.len(), 4);
        assert_eq!(spec.params[3].1, FieldType::I16);
        let (name, _) = parsed.responses.by_id(72).unwrap();
        assert_eq!(name, "clock");
    }

    #[test]
    fn missing_identify_is_rejected() {
        let dict = DictionaryBuilder::new("broken")
            .command("queue_step", 11, &[])
            .build();
        let blob = dict.to_zlib();
        assert!(matches!(
            Dictionary::from_zlib(&blob),
            Err(ProtocolError::Dictionary(_))
        ));
    }

    #[test]
    fn unknown_field_type_is_rejected() {
        let json = br#"{"version":"x","commands":{"identify":{"id":0,"params":[["offset","f64"]]}},"responses":{}}"#;
        assert!(matches!(
            Dictionary::from_json(json),
            Err(ProtocolError::Dictionary(_))
        ));
    }

    #[test]
    fn bootstrap_contains_only_identify() {
        let dict = Dictionary::bootstrap();
        assert!(dict.commands.by_name("identify").is_some());
        assert_eq!(dict.commands.names().count(), 1);
        assert_eq!(dict.responses.names().count(), 1);
    }
}
