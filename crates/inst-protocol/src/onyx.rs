//! Onyx Geiger counter profile (USB serial, JSON console)
//!
//! The counter answers console commands with one JSON document per line.
//! It does not stream by itself, so live data comes from polling
//! `GETCPM`. Console prompts (`>`) and short noise lines are ignored.

use serde_json::Value;

use crate::command::{Outbound, Request};
use crate::error::{ParseError, ProtocolError};
use crate::event::Reading;
use crate::framing::Framing;
use crate::profile::{
    frame_text, unsupported, Decoded, InstrumentProfile, Sent, StreamPolicy, UniqueIdSource,
};
use crate::InstrumentKind;

/// Serial line speed
pub const DEFAULT_BAUD: u32 = 115_200;

/// Every console command is followed by a blank line
const TERMINATOR: &str = "\n\n";

#[derive(Debug, Default)]
pub struct OnyxProfile {
    guid_requested: bool,
}

impl OnyxProfile {
    pub fn new() -> Self {
        Self::default()
    }

    fn console(text: &str) -> Outbound {
        Outbound::fire_and_forget(format!("{}{}", text, TERMINATOR).into_bytes())
    }
}

impl InstrumentProfile for OnyxProfile {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Onyx
    }

    fn framing(&self) -> Framing {
        Framing::json_lines()
    }

    fn stream_policy(&self) -> StreamPolicy {
        StreamPolicy::PollDriven {
            read: Request::ReadRate,
        }
    }

    fn encode(&mut self, request: &Request) -> Result<Outbound, ProtocolError> {
        match request {
            Request::ReadRate => Ok(Self::console("GETCPM")),
            Request::GetGuid => Ok(Self::console(r#"{ "get": "guid" }"#)),
            Request::Raw { text } => Ok(Self::console(text)),
            other => Err(unsupported(self.kind(), other)),
        }
    }

    fn decode(&mut self, frame: &[u8], _sent: Option<Sent<'_>>) -> Result<Vec<Decoded>, ParseError> {
        let text = frame_text(frame)?.trim();
        if text.starts_with('>') || text.len() < 3 {
            return Ok(Vec::new());
        }

        let value: Value = serde_json::from_str(text)?;

        if self.guid_requested {
            if let Some(guid) = value.get("guid").and_then(Value::as_str) {
                self.guid_requested = false;
                return Ok(vec![Decoded::Reading(Reading::UniqueId {
                    id: guid.to_string(),
                })]);
            }
        }

        if let Some(cpm) = value.get("cpm") {
            if let Some(rate) = cpm.get("value").and_then(Value::as_f64) {
                let valid = cpm.get("valid").and_then(Value::as_bool).unwrap_or(true);
                return Ok(vec![Decoded::Reading(Reading::rate(rate, valid))]);
            }
        }

        Ok(vec![Decoded::Reading(Reading::Json { value })])
    }

    fn unique_id(&mut self) -> UniqueIdSource {
        self.guid_requested = true;
        UniqueIdSource::Query(Request::GetGuid)
    }

    fn reset(&mut self) {
        self.guid_requested = false;
    }
}
