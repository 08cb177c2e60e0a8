//! FriedCircuits BT/USB data logger profile
//!
//! A BLE serial bridge (service `ffe0`, characteristic `ffe1`) that
//! pushes newline-delimited JSON once subscribed.

use serde_json::Value;
use uuid::Uuid;

use crate::command::{Address, Outbound, Request};
use crate::error::{ParseError, ProtocolError};
use crate::event::Reading;
use crate::framing::Framing;
use crate::profile::{
    frame_text, unsupported, Decoded, InstrumentProfile, OpenAction, Sent, StreamPolicy,
};
use crate::InstrumentKind;

/// Serial bridge service
pub const SERIAL_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Serial bridge data characteristic
pub const SERIAL_DATA: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

#[derive(Debug, Default)]
pub struct FcBtUsbProfile;

impl FcBtUsbProfile {
    pub fn new() -> Self {
        Self
    }

    pub fn data_address() -> Address {
        Address::Gatt {
            service: SERIAL_SERVICE,
            characteristic: SERIAL_DATA,
        }
    }
}

impl InstrumentProfile for FcBtUsbProfile {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::FcBtUsb
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
            Request::Raw { text } => Ok(Outbound::fire_and_forget(format!("{}\n", text).into_bytes())
                .with_address(Self::data_address())),
            other => Err(unsupported(self.kind(), other)),
        }
    }

    fn decode(&mut self, frame: &[u8], _sent: Option<Sent<'_>>) -> Result<Vec<Decoded>, ParseError> {
        let value: Value = serde_json::from_str(frame_text(frame)?)?;
        Ok(vec![Decoded::Reading(Reading::Json { value })])
    }

    fn on_open(&mut self) -> Vec<OpenAction> {
        vec![OpenAction::Subscribe(Self::data_address())]
    }
}
