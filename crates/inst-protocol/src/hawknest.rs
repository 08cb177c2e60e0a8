//! Hawk Nest networked radiation probe hub
//!
//! The hub forwards probe reports as JSON lines of the form
//! `{"token": "...", "report": {...}}`. `Hawk` reports carry two count
//! rates and the probe's own clock; `power` and `temp` reports are passed
//! through untouched. Probe clocks drift, so at most once every
//! [`RESYNC_INTERVAL_SECS`] per probe the profile asks for the clock to be set
//! and for a power report.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde_json::{json, Value};

use crate::command::{Outbound, Request};
use crate::error::{ParseError, ProtocolError};
use crate::event::Reading;
use crate::framing::Framing;
use crate::profile::{
    frame_text, unsupported, Decoded, InstrumentProfile, Sent, StreamPolicy, UniqueIdSource,
};
use crate::sigma25::NO_UNIQUE_ID;
use crate::InstrumentKind;

/// Minimum spacing of clock resync commands per probe
pub const RESYNC_INTERVAL_SECS: i64 = 5;

#[derive(Debug, Default)]
pub struct HawkNestProfile {
    last_resync: HashMap<String, DateTime<Utc>>,
}

impl HawkNestProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one hub document as of `now`
    pub fn decode_document(&mut self, doc: &Value, now: DateTime<Utc>) -> Vec<Decoded> {
        let Some(report) = doc.get("report") else {
            return Vec::new();
        };

        match report.get("type").and_then(Value::as_str) {
            Some("Hawk") => {
                let mut out = vec![Decoded::Reading(hawk_reading(report))];
                if let Some(token) = doc.get("token").and_then(Value::as_str) {
                    out.extend(self.resync(token, now));
                }
                out
            }
            Some("power") | Some("temp") => vec![Decoded::Reading(Reading::Json {
                value: report.clone(),
            })],
            _ => Vec::new(),
        }
    }

    fn resync(&mut self, token: &str, now: DateTime<Utc>) -> Vec<Decoded> {
        let last = self.last_resync.entry(token.to_string()).or_insert(now);
        if now - *last <= TimeDelta::seconds(RESYNC_INTERVAL_SECS) {
            return Vec::new();
        }
        *last = now;

        vec![
            Decoded::Reply(Request::Probe {
                token: token.to_string(),
                command: format!("nest.settimedate(\"{}\")", now.format("%y%m%d%H%M%S")),
            }),
            Decoded::Reply(Request::Probe {
                token: token.to_string(),
                command: "power.report".to_string(),
            }),
        ]
    }
}

fn hawk_reading(report: &Value) -> Reading {
    let field = |name: &str| report.get(name).and_then(Value::as_u64);

    let device_time = (|| {
        let year = i32::try_from(field("year")?).ok()? + 2000;
        let date = NaiveDate::from_ymd_opt(year, field("month")? as u32, field("day")? as u32)?;
        let time = date.and_hms_opt(
            field("hour")? as u32,
            field("min")? as u32,
            field("sec")? as u32,
        )?;
        Some(time.and_utc())
    })();

    Reading::Rate {
        cpm: report.get("ch1").and_then(Value::as_f64).unwrap_or(0.0),
        valid: true,
        cpm2: report.get("ch2").and_then(Value::as_f64),
        probe_id: report.get("hwser").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        device_time,
    }
}

impl InstrumentProfile for HawkNestProfile {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::HawkNest
    }

    fn framing(&self) -> Framing {
        Framing::json_lines()
    }

    fn stream_policy(&self) -> StreamPolicy {
        StreamPolicy::ActivePush {
            start: None,
            stop: None,
        }
    }

    fn encode(&mut self, request: &Request) -> Result<Outbound, ProtocolError> {
        match request {
            Request::Probe { token, command } => {
                let mut bytes = json!({ "token": token, "command": command })
                    .to_string()
                    .into_bytes();
                bytes.push(b'\n');
                Ok(Outbound::fire_and_forget(bytes))
            }
            other => Err(unsupported(self.kind(), other)),
        }
    }

    fn decode(&mut self, frame: &[u8], _sent: Option<Sent<'_>>) -> Result<Vec<Decoded>, ParseError> {
        let doc: Value = serde_json::from_str(frame_text(frame)?)?;
        Ok(self.decode_document(&doc, Utc::now()))
    }

    fn answer_locally(&mut self, request: &Request) -> Option<Reading> {
        match request {
            Request::Tag => Some(Reading::DeviceTag {
                tag: "Not supported".to_string(),
            }),
            _ => None,
        }
    }

    fn unique_id(&mut self) -> UniqueIdSource {
        UniqueIdSource::Immediate(NO_UNIQUE_ID.to_string())
    }

    fn reset(&mut self) {
        self.last_resync.clear();
    }
}
