//! Message boundary recovery
//!
//! Transports deliver opaque chunks that rarely line up with protocol
//! messages. A [`Framer`] owns the receive buffer for one session and
//! turns those chunks into complete frames according to the instrument's
//! [`Framing`] discipline:
//!
//! - **Delimited / JSON-line / key:value**: split on a single delimiter
//!   byte, keeping partial trailing fragments until the delimiter arrives
//! - **Fixed-length**: accumulate until the length armed by the command
//!   queue is reached; excess bytes stay buffered for the next frame
//! - **Datagram**: every inbound chunk is already one frame (BLE
//!   notifications, HID reports)

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Longest delimited fragment kept while waiting for a delimiter
pub const MAX_LINE_LEN: usize = 4096;

/// Framing discipline selected by an instrument profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Plain text split on a delimiter
    Delimited { delimiter: u8 },
    /// Delimited text where each frame is a JSON document
    JsonLine { delimiter: u8 },
    /// Delimited text of the form `key:value`
    KeyValue { delimiter: u8 },
    /// Binary frames whose length is known only to the pending command
    FixedLength,
    /// One inbound chunk per frame
    Datagram,
}

impl Framing {
    /// Newline-delimited JSON
    pub const fn json_lines() -> Self {
        Framing::JsonLine { delimiter: b'\n' }
    }

    /// Newline-delimited key:value text
    pub const fn key_value_lines() -> Self {
        Framing::KeyValue { delimiter: b'\n' }
    }

    /// The delimiter byte for line-based disciplines
    pub fn delimiter(&self) -> Option<u8> {
        match self {
            Framing::Delimited { delimiter }
            | Framing::JsonLine { delimiter }
            | Framing::KeyValue { delimiter } => Some(*delimiter),
            Framing::FixedLength | Framing::Datagram => None,
        }
    }
}

/// Streaming frame extractor for one session
#[derive(Debug)]
pub struct Framer {
    framing: Framing,
    buffer: Vec<u8>,
    expected_len: Option<usize>,
    datagrams: VecDeque<Vec<u8>>,
}

impl Framer {
    /// Create a framer for the given discipline
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::with_capacity(64),
            expected_len: None,
            datagrams: VecDeque::new(),
        }
    }

    /// The discipline this framer applies
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Push raw bytes into the framer's buffer
    pub fn push_bytes(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        match self.framing {
            Framing::Datagram => self.datagrams.push_back(data.to_vec()),
            Framing::FixedLength => self.buffer.extend_from_slice(data),
            _ => {
                self.buffer.extend_from_slice(data);
                let delimiter = self.framing.delimiter().unwrap_or(b'\n');
                if self.buffer.len() > MAX_LINE_LEN && !self.buffer.contains(&delimiter) {
                    warn!(
                        "Discarding {} bytes received without a delimiter",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
            }
        }
    }

    /// Arm the length of the next fixed-length frame
    pub fn expect(&mut self, len: usize) {
        self.expected_len = Some(len);
    }

    #[cfg(test)]
    fn expected(&self) -> Option<usize> {
        self.expected_len
    }

    /// Number of bytes waiting for a frame boundary
    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.len() + self.datagrams.iter().map(Vec::len).sum::<usize>()
    }

    /// Try to extract the next complete frame
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        match self.framing {
            Framing::Datagram => self.datagrams.pop_front(),
            Framing::FixedLength => {
                let len = self.expected_len?;
                if self.buffer.len() < len {
                    return None;
                }
                self.expected_len = None;
                Some(self.buffer.drain(..len).collect())
            }
            _ => {
                let delimiter = self.framing.delimiter().unwrap_or(b'\n');
                loop {
                    let pos = self.buffer.iter().position(|&b| b == delimiter)?;
                    let mut frame: Vec<u8> = self.buffer.drain(..=pos).collect();
                    frame.pop();
                    if frame.last() == Some(&b'\r') {
                        frame.pop();
                    }
                    if !frame.is_empty() {
                        return Some(frame);
                    }
                }
            }
        }
    }

    /// Drain bytes that arrived while no fixed-length frame was armed
    ///
    /// Returns an empty vector for line-based disciplines, whose partial
    /// fragments are legitimate and must be kept.
    pub fn take_unsolicited(&mut self) -> Vec<u8> {
        match self.framing {
            Framing::FixedLength if self.expected_len.is_none() => {
                std::mem::take(&mut self.buffer)
            }
            _ => Vec::new(),
        }
    }

    /// Clear the internal buffer and any armed length
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.datagrams.clear();
        self.expected_len = None;
    }
}
