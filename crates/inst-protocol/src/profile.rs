//! The per-instrument protocol contract
//!
//! An [`InstrumentProfile`] bundles everything the link layer needs to
//! know about one instrument family: how frames are delimited, whether
//! the link is half-duplex, how continuous readings are obtained, how
//! requests are encoded and how frames decode into readings.
//!
//! Profiles are pure state machines. They never touch I/O or timers; the
//! driver feeds them frames and acts on what they return.

use std::time::Duration;

use crate::command::{Address, Outbound, Request};
use crate::error::{ParseError, ProtocolError};
use crate::event::Reading;
use crate::framing::Framing;
use crate::InstrumentKind;

/// Link direction discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
    /// One outstanding request, replies correlated by arrival order
    Half,
    /// Requests and readings flow independently
    Full,
}

/// How continuous readings are obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPolicy {
    /// The instrument emits readings on its own once initialized
    ActivePush {
        /// Request sent when streaming starts, if any
        start: Option<Request>,
        /// Request sent when streaming stops, if any
        stop: Option<Request>,
    },
    /// The host issues `read` on a timer
    PollDriven { read: Request },
}

/// Sampling constants for instruments that report raw counts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateConfig {
    /// Interval over which each count sample accrues
    pub sample_interval: Duration,
    /// Length of the smoothing window
    pub window: Duration,
    /// Detector dead time in seconds
    pub dead_time_secs: f64,
}

impl RateConfig {
    /// Number of samples in a full window (at least one)
    pub fn slots(&self) -> usize {
        let interval = self.sample_interval.as_secs_f64();
        if interval <= 0.0 {
            return 1;
        }
        ((self.window.as_secs_f64() / interval).round() as usize).max(1)
    }

    /// Age after which the latest sample can no longer be trusted
    pub fn stale_after(&self) -> Duration {
        self.sample_interval * 2
    }
}

/// The command a frame is being decoded against
#[derive(Debug, Clone, Copy)]
pub struct Sent<'a> {
    /// Request as issued by the caller
    pub request: &'a Request,
    /// Bytes that went on the wire for it
    pub outbound: &'a Outbound,
}

/// One item produced by decoding a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A reading ready to publish
    Reading(Reading),
    /// A raw event count for the signal conditioner
    Counts(u32),
    /// A request the instrument's protocol requires us to send back
    Reply(Request),
}

/// How `sendUniqueID` is satisfied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniqueIdSource {
    /// Known without asking the instrument
    Immediate(String),
    /// Ask the instrument; the answer decodes to [`Reading::UniqueId`]
    Query(Request),
    /// The instrument has no identifier
    Unsupported,
}

/// Initialization step to run when the transport reports open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenAction {
    /// Write an initialization command
    Write(Outbound),
    /// Subscribe to notifications on a sub-channel
    Subscribe(Address),
    /// Close the transport after a delay and open it again
    CycleAfter(Duration),
}

/// Protocol behaviour of one instrument family
pub trait InstrumentProfile: Send {
    /// Which instrument family this profile speaks for
    fn kind(&self) -> InstrumentKind;

    /// Framing discipline for inbound data
    fn framing(&self) -> Framing;

    /// Whether requests must be serialized through the command queue
    fn duplex(&self) -> Duplex {
        Duplex::Full
    }

    /// How continuous readings are obtained
    fn stream_policy(&self) -> StreamPolicy;

    /// Sampling constants if the instrument reports raw counts
    fn rate_config(&self) -> Option<RateConfig> {
        None
    }

    /// Encode a request for the wire
    fn encode(&mut self, request: &Request) -> Result<Outbound, ProtocolError>;

    /// Decode one complete frame
    ///
    /// `sent` is the command at the head of the queue on half-duplex links
    /// and `None` otherwise.
    fn decode(&mut self, frame: &[u8], sent: Option<Sent<'_>>) -> Result<Vec<Decoded>, ParseError>;

    /// Answer a request without touching the wire
    fn answer_locally(&mut self, _request: &Request) -> Option<Reading> {
        None
    }

    /// How to obtain the instrument's unique identifier
    fn unique_id(&mut self) -> UniqueIdSource {
        UniqueIdSource::Unsupported
    }

    /// Steps to run each time the transport reports open
    fn on_open(&mut self) -> Vec<OpenAction> {
        Vec::new()
    }

    /// Forget state tied to a connection that went away
    fn reset(&mut self) {}
}

/// Shorthand for rejecting a request a profile cannot express
pub(crate) fn unsupported(kind: InstrumentKind, request: &Request) -> ProtocolError {
    ProtocolError::UnsupportedRequest {
        instrument: kind.name(),
        request: format!("{:?}", request),
    }
}

/// Parse a frame as UTF-8 text
pub(crate) fn frame_text(frame: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(frame).map_err(|_| ParseError::InvalidUtf8)
}
