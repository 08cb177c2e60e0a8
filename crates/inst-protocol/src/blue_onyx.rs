//! Blue Onyx BLE Geiger counter profile
//!
//! The counter masquerades as a BLE Heart Rate sensor: every
//! notification on the heart-rate measurement characteristic carries the
//! number of pulses counted during the last 5 seconds in its first byte.
//! Those raw counts go through the rate conditioner.
//!
//! A freshly powered counter may sit in its bootloader. The first open,
//! and the first open after a lost link, therefore write `"0"` to the
//! measuring-mode characteristic, close the link after 2 seconds and
//! open it again; only the second open subscribes to measurements.

use std::time::Duration;

use uuid::Uuid;

use crate::command::{Address, Outbound, Request};
use crate::error::{ParseError, ProtocolError};
use crate::framing::Framing;
use crate::profile::{
    unsupported, Decoded, InstrumentProfile, OpenAction, RateConfig, Sent, StreamPolicy,
};
use crate::InstrumentKind;

/// Heart Rate GATT service
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Vendor characteristic selecting measuring mode
pub const MEASURING_MODE: Uuid = Uuid::from_u128(0xe7add780_b042_4876_aae1_112855353cc1);

/// Seconds of counting behind each notification
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Smoothing window
pub const WINDOW: Duration = Duration::from_secs(90);

/// Geiger tube dead time
pub const DEAD_TIME_SECS: f64 = 90e-6;

/// Delay between the bootloader cancel write and the re-open
pub const INIT_CYCLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStage {
    Fresh,
    ModeWritten,
    Subscribed,
}

#[derive(Debug)]
pub struct BlueOnyxProfile {
    stage: InitStage,
}

impl Default for BlueOnyxProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl BlueOnyxProfile {
    pub fn new() -> Self {
        Self {
            stage: InitStage::Fresh,
        }
    }

    /// Sub-channel carrying count notifications
    pub fn measurement_address() -> Address {
        Address::Gatt {
            service: HEART_RATE_SERVICE,
            characteristic: HEART_RATE_MEASUREMENT,
        }
    }

    /// Sub-channel selecting measuring mode
    pub fn mode_address() -> Address {
        Address::Gatt {
            service: HEART_RATE_SERVICE,
            characteristic: MEASURING_MODE,
        }
    }
}

impl InstrumentProfile for BlueOnyxProfile {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::BlueOnyx
    }

    fn framing(&self) -> Framing {
        Framing::Datagram
    }

    fn stream_policy(&self) -> StreamPolicy {
        StreamPolicy::ActivePush {
            start: None,
            stop: None,
        }
    }

    fn rate_config(&self) -> Option<RateConfig> {
        Some(RateConfig {
            sample_interval: SAMPLE_INTERVAL,
            window: WINDOW,
            dead_time_secs: DEAD_TIME_SECS,
        })
    }

    fn encode(&mut self, request: &Request) -> Result<Outbound, ProtocolError> {
        match request {
            Request::Raw { text } => Ok(Outbound::fire_and_forget(text.as_bytes().to_vec())
                .with_address(Self::mode_address())),
            other => Err(unsupported(self.kind(), other)),
        }
    }

    fn decode(&mut self, frame: &[u8], _sent: Option<Sent<'_>>) -> Result<Vec<Decoded>, ParseError> {
        // Heart Rate Measurement is at least flags + one value byte
        if frame.len() < 2 {
            return Err(ParseError::UnexpectedLength {
                expected: 2,
                actual: frame.len(),
            });
        }
        Ok(vec![Decoded::Counts(u32::from(frame[0]))])
    }

    fn on_open(&mut self) -> Vec<OpenAction> {
        match self.stage {
            InitStage::Fresh => {
                self.stage = InitStage::ModeWritten;
                vec![
                    OpenAction::Write(
                        Outbound::fire_and_forget(b"0".to_vec()).with_address(Self::mode_address()),
                    ),
                    OpenAction::CycleAfter(INIT_CYCLE),
                ]
            }
            InitStage::ModeWritten | InitStage::Subscribed => {
                self.stage = InitStage::Subscribed;
                vec![OpenAction::Subscribe(Self::measurement_address())]
            }
        }
    }

    fn reset(&mut self) {
        self.stage = InitStage::Fresh;
    }
}
