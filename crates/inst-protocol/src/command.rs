//! Normalized command types
//!
//! Collaborators issue [`Request`]s without knowing which instrument is
//! attached. Each profile encodes the requests it understands into an
//! [`Outbound`] frame that also states what kind of reply to wait for.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transceiver operating mode as reported by half-duplex radios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioMode {
    Lsb,
    Usb,
    Cw,
    CwR,
    Am,
    Wfm,
    Fm,
    Dig,
    Pkt,
    /// Mode byte outside the known table
    Unknown(u8),
}

impl RadioMode {
    /// Returns the conventional display name for the mode
    pub fn name(&self) -> &'static str {
        match self {
            RadioMode::Lsb => "LSB",
            RadioMode::Usb => "USB",
            RadioMode::Cw => "CW",
            RadioMode::CwR => "CW-R",
            RadioMode::Am => "AM",
            RadioMode::Wfm => "WFM",
            RadioMode::Fm => "FM",
            RadioMode::Dig => "DIG",
            RadioMode::Pkt => "PKT",
            RadioMode::Unknown(_) => "?",
        }
    }
}

/// Instrument-agnostic request accepted by `output()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Text sent verbatim (line terminator added by the profile)
    Raw { text: String },
    /// Read frequency and mode
    GetFrequency,
    /// Tune to a frequency in Hz
    SetFrequency { hz: u64 },
    /// Select an operating mode
    SetMode { mode: RadioMode },
    /// Front panel lock
    Lock { on: bool },
    /// Key or unkey the transmitter
    Ptt { on: bool },
    /// Clarifier (RIT) on/off
    Clarifier { on: bool },
    /// Swap VFO A/B
    ToggleVfo,
    /// Split operation on/off
    Split { on: bool },
    /// Power the instrument on/off
    Power { on: bool },
    /// Read the receive or transmit status byte
    TxRxStatus,
    /// Read the current count rate
    ReadRate,
    /// Read the instrument's unique identifier
    GetGuid,
    /// Ask an active-push instrument to begin emitting readings
    StartStream,
    /// Ask an active-push instrument to stop emitting readings
    StopStream,
    /// Command addressed to one probe behind a networked hub
    Probe {
        token: String,
        #[serde(rename = "script")]
        command: String,
    },
    /// Read the device tag
    Tag,
}

impl Request {
    /// Returns true for idempotent reads that are safe to reissue
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Request::GetFrequency | Request::TxRxStatus | Request::ReadRate | Request::GetGuid
        )
    }
}

/// Sub-channel addressing for transports with more than one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    /// A GATT characteristic within a service
    Gatt { service: Uuid, characteristic: Uuid },
    /// A HID report id
    HidReport(u8),
}

/// What the link owes us after a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expect {
    /// Fire-and-forget
    #[default]
    None,
    /// A fixed number of bytes
    Bytes(usize),
}

impl Expect {
    /// Returns true if the command occupies the half-duplex slot until answered
    pub fn awaits_response(&self) -> bool {
        !matches!(self, Expect::None)
    }
}

/// An encoded command ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Wire bytes
    pub bytes: Vec<u8>,
    /// Sub-channel for the write, if the medium has several
    pub address: Option<Address>,
    /// Reply owed by the instrument
    pub expect: Expect,
}

impl Outbound {
    /// A write with no reply
    pub fn fire_and_forget(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            address: None,
            expect: Expect::None,
        }
    }

    /// A write answered by exactly `len` bytes
    pub fn expecting_bytes(bytes: impl Into<Vec<u8>>, len: usize) -> Self {
        Self {
            bytes: bytes.into(),
            address: None,
            expect: Expect::Bytes(len),
        }
    }

    /// Route the write to a sub-channel
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }
}
