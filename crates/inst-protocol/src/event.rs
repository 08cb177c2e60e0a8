//! Normalized readings published to collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::RadioMode;

/// A decoded, instrument-agnostic reading
///
/// Immutable once published; collaborators receive clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Host time at which the reading was decoded
    pub timestamp: DateTime<Utc>,
    /// Whether the reading can be trusted
    pub valid: bool,
    /// The reading itself
    #[serde(flatten)]
    pub reading: Reading,
}

impl NormalizedEvent {
    /// Stamp a reading with the current time
    pub fn now(reading: Reading) -> Self {
        let valid = reading.is_valid();
        Self {
            timestamp: Utc::now(),
            valid,
            reading,
        }
    }

    /// Returns true if this event reports a failed open
    pub fn is_open_error(&self) -> bool {
        matches!(self.reading, Reading::OpenError { .. })
    }
}

/// Typed value of a key:value field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    IntegerList(Vec<i64>),
    Text(String),
    TextList(Vec<String>),
}

/// Reading payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    /// The transport failed to open
    OpenError {
        reason: String,
        description: Option<String>,
    },
    /// Instrument unique identifier
    UniqueId { id: String },
    /// Count rate in counts per minute
    Rate {
        cpm: f64,
        /// The enclosing event owns the `valid` key
        #[serde(rename = "rate_valid")]
        valid: bool,
        /// Secondary channel for dual-tube probes
        cpm2: Option<f64>,
        /// Probe serial for hub-attached probes
        probe_id: Option<String>,
        /// Clock of the probe itself, when reported
        device_time: Option<DateTime<Utc>>,
    },
    /// Frequency and mode report
    Radio { frequency_hz: u64, mode: RadioMode },
    /// Receiver status byte
    RxStatus {
        smeter: u8,
        squelch: bool,
        pl_code: bool,
        discriminator: bool,
    },
    /// Transmitter status byte
    TxStatus {
        power: u8,
        ptt: bool,
        high_swr: bool,
        split: bool,
    },
    /// Answer to a lock command
    Lock { was_locked: bool },
    /// Spectrometer channel counts
    Spectrum { channels: Vec<i64> },
    /// A named field from a key:value protocol
    Field { name: String, value: FieldValue },
    /// Structured document passed through unchanged
    Json { value: serde_json::Value },
    /// Unstructured text line
    Raw { text: String },
    /// Device tag
    DeviceTag { tag: String },
}

impl Reading {
    fn is_valid(&self) -> bool {
        match self {
            Reading::OpenError { .. } => false,
            Reading::Rate { valid, .. } => *valid,
            _ => true,
        }
    }

    /// Convenience constructor for a plain single-channel rate
    pub fn rate(cpm: f64, valid: bool) -> Self {
        Reading::Rate {
            cpm,
            valid,
            cpm2: None,
            probe_id: None,
            device_time: None,
        }
    }
}
