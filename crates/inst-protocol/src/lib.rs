//! Instrument Protocol Library
//!
//! This crate turns the wire protocols of heterogeneous measurement
//! instruments into a uniform vocabulary:
//!
//! - **FT-817**: 5-byte binary commands, half-duplex, BCD frequency replies
//! - **Onyx**: JSON console over USB serial, polled with `GETCPM`
//! - **Sigma25**: `key:value` text spectrometer, streams after `S`
//! - **Blue Onyx**: BLE Heart Rate notifications carrying raw pulse counts
//! - **FC BT/USB**: BLE serial bridge pushing JSON lines
//! - **Hawk Nest**: networked probe hub pushing JSON reports
//!
//! # Architecture
//!
//! Each protocol module provides an [`InstrumentProfile`]:
//! - A [`Framing`] discipline consumed by the streaming [`Framer`]
//! - Encoding of normalized [`Request`]s into [`Outbound`] frames
//! - Decoding of complete frames into [`Reading`]s, raw counts or replies
//!
//! Profiles never perform I/O; the link layer drives them.
//!
//! # Example
//!
//! ```rust
//! use inst_protocol::{create_profile, Framer, InstrumentKind, Request};
//!
//! let mut profile = create_profile(InstrumentKind::Sigma25);
//! let start = profile.encode(&Request::StartStream).unwrap();
//! assert_eq!(start.bytes, b"S");
//!
//! let mut framer = Framer::new(profile.framing());
//! framer.push_bytes(b"C:0,4,9\n");
//! let frame = framer.next_frame().unwrap();
//! let decoded = profile.decode(&frame, None).unwrap();
//! assert_eq!(decoded.len(), 1);
//! ```

pub mod blue_onyx;
pub mod command;
pub mod error;
pub mod event;
pub mod fcbtusb;
pub mod framing;
pub mod ft817;
pub mod hawknest;
pub mod onyx;
pub mod profile;
pub mod sigma25;

use serde::{Deserialize, Serialize};

pub use command::{Address, Expect, Outbound, RadioMode, Request};
pub use error::{ParseError, ProtocolError};
pub use event::{FieldValue, NormalizedEvent, Reading};
pub use framing::{Framer, Framing};
pub use profile::{
    Decoded, Duplex, InstrumentProfile, OpenAction, RateConfig, Sent, StreamPolicy,
    UniqueIdSource,
};

/// Identifies which instrument family a profile speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Yaesu FT-817/857/897 transceiver
    Ft817,
    /// Onyx Geiger counter (USB serial)
    Onyx,
    /// Sigma25 gamma spectrometer
    Sigma25,
    /// Blue Onyx BLE Geiger counter
    BlueOnyx,
    /// FriedCircuits BT/USB logger
    #[serde(rename = "fcbtusb")]
    FcBtUsb,
    /// Hawk Nest probe hub
    #[serde(rename = "hawknest")]
    HawkNest,
}

impl InstrumentKind {
    /// All supported instrument families
    pub const ALL: [InstrumentKind; 6] = [
        InstrumentKind::Ft817,
        InstrumentKind::Onyx,
        InstrumentKind::Sigma25,
        InstrumentKind::BlueOnyx,
        InstrumentKind::FcBtUsb,
        InstrumentKind::HawkNest,
    ];

    /// Returns a human-readable name for the instrument family
    pub fn name(&self) -> &'static str {
        match self {
            InstrumentKind::Ft817 => "Yaesu FT-817",
            InstrumentKind::Onyx => "Onyx",
            InstrumentKind::Sigma25 => "Sigma25",
            InstrumentKind::BlueOnyx => "Blue Onyx",
            InstrumentKind::FcBtUsb => "FC BT/USB",
            InstrumentKind::HawkNest => "Hawk Nest",
        }
    }
}

/// Create a fresh profile for the given instrument family
pub fn create_profile(kind: InstrumentKind) -> Box<dyn InstrumentProfile> {
    match kind {
        InstrumentKind::Ft817 => Box::new(ft817::Ft817Profile::new()),
        InstrumentKind::Onyx => Box::new(onyx::OnyxProfile::new()),
        InstrumentKind::Sigma25 => Box::new(sigma25::Sigma25Profile::new()),
        InstrumentKind::BlueOnyx => Box::new(blue_onyx::BlueOnyxProfile::new()),
        InstrumentKind::FcBtUsb => Box::new(fcbtusb::FcBtUsbProfile::new()),
        InstrumentKind::HawkNest => Box::new(hawknest::HawkNestProfile::new()),
    }
}
