//! Events published by a driver
//!
//! Everything a collaborator learns about an instrument arrives on one
//! channel in the order it happened: readings as [`DriverEvent::Data`],
//! connection changes as [`DriverEvent::Status`].

use inst_protocol::{InstrumentKind, NormalizedEvent};
use serde::Serialize;

/// Connection status as seen by collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriverStatus {
    pub portopen: bool,
    /// Recorder state, when it changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<bool>,
}

/// Unified event enum for driver activity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DriverEvent {
    /// A decoded reading
    Data(NormalizedEvent),
    /// The transport opened or closed, or recording was toggled
    Status(DriverStatus),
}

impl DriverEvent {
    pub(crate) fn port(portopen: bool) -> Self {
        DriverEvent::Status(DriverStatus {
            portopen,
            recording: None,
        })
    }

    /// Returns true if this is a status event
    pub fn is_status(&self) -> bool {
        matches!(self, DriverEvent::Status(_))
    }

    /// Returns the reading if this is a data event
    pub fn data(&self) -> Option<&NormalizedEvent> {
        match self {
            DriverEvent::Data(event) => Some(event),
            DriverEvent::Status(_) => None,
        }
    }

    /// Returns the reported port state if this is a status event
    pub fn portopen(&self) -> Option<bool> {
        match self {
            DriverEvent::Status(status) => Some(status.portopen),
            DriverEvent::Data(_) => None,
        }
    }
}

/// Lifecycle of the driver's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Closed,
    /// Transport requested, outcome not yet reported
    Opening,
    Open,
    /// Close requested, waiting for the transport to confirm
    Closing,
    /// The last open attempt failed
    Error,
}

/// Point-in-time view of a driver
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DriverSnapshot {
    pub state: ConnectionState,
    pub streaming: bool,
    pub recording: bool,
    pub instrument: Option<String>,
    pub kind: Option<InstrumentKind>,
    /// Commands waiting in the half-duplex queue
    pub queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use inst_protocol::Reading;

    #[test]
    fn test_classification() {
        let status = DriverEvent::port(false);
        assert!(status.is_status());
        assert_eq!(status.portopen(), Some(false));
        assert!(status.data().is_none());

        let data = DriverEvent::Data(NormalizedEvent::now(Reading::rate(30.0, true)));
        assert!(!data.is_status());
        assert!(data.data().unwrap().valid);
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(DriverEvent::port(true)).unwrap();
        assert_eq!(json, serde_json::json!({"event": "status", "portopen": true}));

        let data = DriverEvent::Data(NormalizedEvent::now(Reading::Raw { text: "hi".into() }));
        let json = serde_json::to_value(data).unwrap();
        assert_eq!(json["event"], "data");
        assert_eq!(json["kind"], "raw");
        assert_eq!(json["text"], "hi");
    }
}
