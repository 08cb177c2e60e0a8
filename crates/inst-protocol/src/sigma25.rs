//! Sigma25 gamma spectrometer profile
//!
//! Newline-delimited `key:value` text. Once started with `S` the device
//! pushes spectrum lines (`C:` followed by comma-separated channel
//! counts) until stopped with `s`.

use crate::command::{Outbound, Request};
use crate::error::{ParseError, ProtocolError};
use crate::event::{FieldValue, Reading};
use crate::framing::Framing;
use crate::profile::{
    frame_text, unsupported, Decoded, InstrumentProfile, Sent, StreamPolicy, UniqueIdSource,
};
use crate::InstrumentKind;

/// Serial line speed
pub const DEFAULT_BAUD: u32 = 115_200;

/// Identifier reported for devices without a readable serial
pub const NO_UNIQUE_ID: &str = "00000000 (n.a.)";

/// How the value part of a known key is typed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Channels,
    Text,
    Integer,
}

/// Static dispatch table for known keys
const FIELDS: &[(&str, FieldType)] = &[
    ("C", FieldType::Channels),
    ("version", FieldType::Text),
    ("serial", FieldType::Text),
    ("gain", FieldType::Integer),
    ("bias", FieldType::Integer),
    ("lld_channel", FieldType::Integer),
];

#[derive(Debug, Default)]
pub struct Sigma25Profile;

impl Sigma25Profile {
    pub fn new() -> Self {
        Self
    }

    fn parse_line(text: &str) -> Result<Reading, ParseError> {
        let parts: Vec<&str> = text.split(':').collect();
        let key = parts[0];
        let value = parts.get(1).copied().unwrap_or("");

        let field_type = FIELDS
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, ty)| *ty);

        match field_type {
            Some(FieldType::Channels) => {
                let channels = value
                    .split(',')
                    .map(|n| parse_int(key, n))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Reading::Spectrum { channels })
            }
            Some(FieldType::Text) => Ok(Reading::Field {
                name: key.to_string(),
                value: FieldValue::Text(value.to_string()),
            }),
            Some(FieldType::Integer) => Ok(Reading::Field {
                name: key.to_string(),
                value: FieldValue::Integer(parse_int(key, value)?),
            }),
            None if parts.len() > 1 => Ok(Reading::Field {
                name: key.to_string(),
                value: FieldValue::TextList(parts[1..].iter().map(|s| s.to_string()).collect()),
            }),
            None => Ok(Reading::Raw {
                text: text.to_string(),
            }),
        }
    }
}

fn parse_int(field: &str, value: &str) -> Result<i64, ParseError> {
    value
        .trim()
        .parse()
        .map_err(|_| ParseError::InvalidInteger {
            field: field.to_string(),
            value: value.to_string(),
        })
}

impl InstrumentProfile for Sigma25Profile {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Sigma25
    }

    fn framing(&self) -> Framing {
        Framing::key_value_lines()
    }

    fn stream_policy(&self) -> StreamPolicy {
        StreamPolicy::ActivePush {
            start: Some(Request::StartStream),
            stop: Some(Request::StopStream),
        }
    }

    fn encode(&mut self, request: &Request) -> Result<Outbound, ProtocolError> {
        match request {
            Request::StartStream => Ok(Outbound::fire_and_forget(b"S".to_vec())),
            Request::StopStream => Ok(Outbound::fire_and_forget(b"s".to_vec())),
            Request::Raw { text } => Ok(Outbound::fire_and_forget(format!("{}\n", text).into_bytes())),
            other => Err(unsupported(self.kind(), other)),
        }
    }

    fn decode(&mut self, frame: &[u8], _sent: Option<Sent<'_>>) -> Result<Vec<Decoded>, ParseError> {
        let text = frame_text(frame)?.trim_end();
        if text.len() < 2 {
            return Ok(Vec::new());
        }
        Ok(vec![Decoded::Reading(Self::parse_line(text)?)])
    }

    fn unique_id(&mut self) -> UniqueIdSource {
        UniqueIdSource::Immediate(NO_UNIQUE_ID.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(line: &str) -> Reading {
        let mut profile = Sigma25Profile::new();
        match profile.decode(line.as_bytes(), None).unwrap().pop() {
            Some(Decoded::Reading(r)) => r,
            other => panic!("Expected a reading, got {:?}", other),
        }
    }

    #[test]
    fn test_spectrum_line() {
        assert_eq!(
            reading("C:0,3,17,4"),
            Reading::Spectrum {
                channels: vec![0, 3, 17, 4]
            }
        );
    }

    #[test]
    fn test_typed_fields() {
        assert_eq!(
            reading("gain:12"),
            Reading::Field {
                name: "gain".into(),
                value: FieldValue::Integer(12)
            }
        );
        assert_eq!(
            reading("version:1.04"),
            Reading::Field {
                name: "version".into(),
                value: FieldValue::Text("1.04".into())
            }
        );
    }

    #[test]
    fn test_unknown_keys_and_raw_text() {
        assert_eq!(
            reading("temp:21:C"),
            Reading::Field {
                name: "temp".into(),
                value: FieldValue::TextList(vec!["21".into(), "C".into()])
            }
        );
        assert_eq!(
            reading("Sigma25 ready"),
            Reading::Raw {
                text: "Sigma25 ready".into()
            }
        );
    }

    #[test]
    fn test_bad_integer_is_decode_error() {
        let mut profile = Sigma25Profile::new();
        assert!(matches!(
            profile.decode(b"bias:high", None),
            Err(ParseError::InvalidInteger { .. })
        ));
        assert!(profile.decode(b"C:1,x,3", None).is_err());
    }

    #[test]
    fn test_start_stop_commands() {
        let mut profile = Sigma25Profile::new();
        assert_eq!(profile.encode(&Request::StartStream).unwrap().bytes, b"S");
        assert_eq!(profile.encode(&Request::StopStream).unwrap().bytes, b"s");
        assert_eq!(
            profile.unique_id(),
            UniqueIdSource::Immediate(NO_UNIQUE_ID.to_string())
        );
    }
}
