//! Yaesu FT-817 family (FT-817ND/857/897) CAT profile
//!
//! The radio speaks a strictly half-duplex binary protocol. Every
//! command is 5 bytes; answers carry no command echo, so the reply to a
//! query is whatever arrives next.
//!
//! # Command Format
//! ```text
//! [P1] [P2] [P3] [P4] [OPCODE]
//! ```
//!
//! # Replies
//! - Read frequency/mode (`0x03`): 4 BCD bytes (10 Hz resolution) + mode byte
//! - Lock (`0x00`/`0x80`): 1 byte, non-zero if the radio was already locked
//! - RX status (`0xE7`) / TX status (`0xF7`): 1 status byte
//! - Everything else: no reply

use crate::command::{Outbound, RadioMode, Request};
use crate::error::{ParseError, ProtocolError};
use crate::event::Reading;
use crate::framing::Framing;
use crate::profile::{unsupported, Decoded, Duplex, InstrumentProfile, Sent, StreamPolicy};
use crate::InstrumentKind;

/// Length of every command
pub const COMMAND_LEN: usize = 5;

/// Serial line speed the radio ships with
pub const DEFAULT_BAUD: u32 = 4800;

/// Opcodes (byte 4 of a command)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    LockOn = 0x00,
    LockOff = 0x80,
    SetFrequency = 0x01,
    ReadFreqMode = 0x03,
    SetMode = 0x07,
    SplitOn = 0x02,
    SplitOff = 0x82,
    ClarOn = 0x05,
    ClarOff = 0x85,
    PttOn = 0x08,
    PttOff = 0x88,
    ToggleVfo = 0x81,
    PowerOn = 0x0F,
    PowerOff = 0x8F,
    ReadRxStatus = 0xE7,
    ReadTxStatus = 0xF7,
}

impl Opcode {
    /// Reply length owed by the radio for this opcode
    pub fn reply_len(self) -> Option<usize> {
        match self {
            Opcode::ReadFreqMode => Some(5),
            Opcode::LockOn | Opcode::LockOff => Some(1),
            Opcode::ReadRxStatus | Opcode::ReadTxStatus => Some(1),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::LockOn),
            0x80 => Ok(Self::LockOff),
            0x01 => Ok(Self::SetFrequency),
            0x03 => Ok(Self::ReadFreqMode),
            0x07 => Ok(Self::SetMode),
            0x02 => Ok(Self::SplitOn),
            0x82 => Ok(Self::SplitOff),
            0x05 => Ok(Self::ClarOn),
            0x85 => Ok(Self::ClarOff),
            0x08 => Ok(Self::PttOn),
            0x88 => Ok(Self::PttOff),
            0x81 => Ok(Self::ToggleVfo),
            0x0F => Ok(Self::PowerOn),
            0x8F => Ok(Self::PowerOff),
            0xE7 => Ok(Self::ReadRxStatus),
            0xF7 => Ok(Self::ReadTxStatus),
            _ => Err(ParseError::InvalidFrame(format!(
                "FT-817 opcode 0x{:02X}",
                value
            ))),
        }
    }
}

/// RX status byte flags
pub mod rx_status {
    /// Squelch open (signal present)
    pub const SQUELCH: u8 = 0x80;
    /// CTCSS/DCS match
    pub const PL_CODE: u8 = 0x40;
    /// Discriminator centered
    pub const DISCRIMINATOR: u8 = 0x20;
    /// S-meter reading (bits 0-3)
    pub const S_METER_MASK: u8 = 0x0F;
}

/// TX status byte flags
pub mod tx_status {
    /// PTT state
    pub const PTT: u8 = 0x80;
    /// High SWR
    pub const HIGH_SWR: u8 = 0x40;
    /// Split active
    pub const SPLIT: u8 = 0x20;
    /// Power output meter (bits 0-3)
    pub const POWER_MASK: u8 = 0x0F;
}

/// Build a parameterless command
pub fn command(opcode: Opcode) -> [u8; COMMAND_LEN] {
    [0x00, 0x00, 0x00, 0x00, opcode as u8]
}

/// FT-817 protocol state
#[derive(Debug, Default)]
pub struct Ft817Profile {
    /// Whether we last keyed the transmitter
    transmitting: bool,
}

impl Ft817Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the profile believes the radio is transmitting
    pub fn transmitting(&self) -> bool {
        self.transmitting
    }

    fn decode_reply(&mut self, opcode: Opcode, frame: &[u8]) -> Result<Reading, ParseError> {
        let expected = opcode.reply_len().unwrap_or(0);
        if frame.len() != expected {
            return Err(ParseError::UnexpectedLength {
                expected,
                actual: frame.len(),
            });
        }

        match opcode {
            Opcode::ReadFreqMode => Ok(Reading::Radio {
                frequency_hz: bcd_to_frequency_be(&frame[..4])?,
                mode: mode_from_byte(frame[4]),
            }),
            Opcode::LockOn | Opcode::LockOff => Ok(Reading::Lock {
                was_locked: frame[0] != 0,
            }),
            Opcode::ReadTxStatus => {
                let status = frame[0];
                self.transmitting = status & tx_status::PTT != 0;
                Ok(Reading::TxStatus {
                    power: status & tx_status::POWER_MASK,
                    ptt: self.transmitting,
                    high_swr: status & tx_status::HIGH_SWR != 0,
                    split: status & tx_status::SPLIT != 0,
                })
            }
            Opcode::ReadRxStatus => {
                let status = frame[0];
                Ok(Reading::RxStatus {
                    smeter: status & rx_status::S_METER_MASK,
                    squelch: status & rx_status::SQUELCH != 0,
                    pl_code: status & rx_status::PL_CODE != 0,
                    discriminator: status & rx_status::DISCRIMINATOR != 0,
                })
            }
            other => Err(ParseError::InvalidFrame(format!(
                "no reply expected for {:?}",
                other
            ))),
        }
    }
}

impl InstrumentProfile for Ft817Profile {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Ft817
    }

    fn framing(&self) -> Framing {
        Framing::FixedLength
    }

    fn duplex(&self) -> Duplex {
        Duplex::Half
    }

    fn stream_policy(&self) -> StreamPolicy {
        StreamPolicy::PollDriven {
            read: Request::GetFrequency,
        }
    }

    fn encode(&mut self, request: &Request) -> Result<Outbound, ProtocolError> {
        let opcode = match request {
            Request::GetFrequency => Opcode::ReadFreqMode,
            Request::SetFrequency { hz } => {
                let mut bytes = frequency_to_bcd_be(*hz)?;
                bytes.push(Opcode::SetFrequency as u8);
                return Ok(Outbound::fire_and_forget(bytes));
            }
            Request::SetMode { mode } => {
                let bytes = vec![mode_to_byte(*mode), 0x00, 0x00, 0x00, Opcode::SetMode as u8];
                return Ok(Outbound::fire_and_forget(bytes));
            }
            Request::Lock { on: true } => Opcode::LockOn,
            Request::Lock { on: false } => Opcode::LockOff,
            Request::Ptt { on } => {
                self.transmitting = *on;
                if *on {
                    Opcode::PttOn
                } else {
                    Opcode::PttOff
                }
            }
            Request::Clarifier { on: true } => Opcode::ClarOn,
            Request::Clarifier { on: false } => Opcode::ClarOff,
            Request::ToggleVfo => Opcode::ToggleVfo,
            Request::Split { on: true } => Opcode::SplitOn,
            Request::Split { on: false } => Opcode::SplitOff,
            Request::Power { on: true } => Opcode::PowerOn,
            Request::Power { on: false } => Opcode::PowerOff,
            Request::TxRxStatus if self.transmitting => Opcode::ReadTxStatus,
            Request::TxRxStatus => Opcode::ReadRxStatus,
            other => return Err(unsupported(self.kind(), other)),
        };

        let bytes = command(opcode);
        Ok(match opcode.reply_len() {
            Some(len) => Outbound::expecting_bytes(bytes, len),
            None => Outbound::fire_and_forget(bytes),
        })
    }

    fn decode(&mut self, frame: &[u8], sent: Option<Sent<'_>>) -> Result<Vec<Decoded>, ParseError> {
        let sent = sent.ok_or_else(|| {
            ParseError::InvalidFrame("reply without a pending command".to_string())
        })?;
        let opcode_byte = sent
            .outbound
            .bytes
            .get(COMMAND_LEN - 1)
            .copied()
            .ok_or_else(|| ParseError::InvalidFrame("pending command too short".to_string()))?;
        let opcode = Opcode::try_from(opcode_byte)?;

        Ok(vec![Decoded::Reading(self.decode_reply(opcode, frame)?)])
    }

    fn reset(&mut self) {
        self.transmitting = false;
    }
}

/// Convert big-endian BCD bytes to frequency in Hz
///
/// 4 bytes = 8 BCD digits at 10 Hz resolution.
/// Example: 14.250.00 MHz = 0x01 0x42 0x50 0x00
pub fn bcd_to_frequency_be(bytes: &[u8]) -> Result<u64, ParseError> {
    let mut freq: u64 = 0;

    for &byte in bytes.iter().take(4) {
        let high = (byte >> 4) & 0x0F;
        let low = byte & 0x0F;
        if high > 9 || low > 9 {
            return Err(ParseError::InvalidBcd(byte));
        }
        freq = freq * 100 + u64::from(high) * 10 + u64::from(low);
    }

    Ok(freq * 10)
}

/// Convert frequency in Hz to big-endian BCD bytes (4 bytes)
pub fn frequency_to_bcd_be(hz: u64) -> Result<Vec<u8>, ProtocolError> {
    let mut remaining = hz / 10;
    if remaining > 99_999_999 {
        return Err(ProtocolError::InvalidArgument(format!(
            "{} Hz does not fit in 8 BCD digits",
            hz
        )));
    }

    let mut result = vec![0u8; 4];
    for slot in result.iter_mut().rev() {
        let low = (remaining % 10) as u8;
        remaining /= 10;
        let high = (remaining % 10) as u8;
        remaining /= 10;
        *slot = (high << 4) | low;
    }

    Ok(result)
}

/// Convert a mode byte to a [`RadioMode`]
pub fn mode_from_byte(mode: u8) -> RadioMode {
    match mode {
        0x00 => RadioMode::Lsb,
        0x01 => RadioMode::Usb,
        0x02 => RadioMode::Cw,
        0x03 => RadioMode::CwR,
        0x04 => RadioMode::Am,
        0x06 => RadioMode::Wfm,
        0x08 => RadioMode::Fm,
        0x0A => RadioMode::Dig,
        0x0C => RadioMode::Pkt,
        other => RadioMode::Unknown(other),
    }
}

/// Convert a [`RadioMode`] to its mode byte
pub fn mode_to_byte(mode: RadioMode) -> u8 {
    match mode {
        RadioMode::Lsb => 0x00,
        RadioMode::Usb => 0x01,
        RadioMode::Cw => 0x02,
        RadioMode::CwR => 0x03,
        RadioMode::Am => 0x04,
        RadioMode::Wfm => 0x06,
        RadioMode::Fm => 0x08,
        RadioMode::Dig => 0x0A,
        RadioMode::Pkt => 0x0C,
        RadioMode::Unknown(byte) => byte,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Expect;
    use proptest::prelude::*;

    fn decode_against(
        profile: &mut Ft817Profile,
        request: Request,
        frame: &[u8],
    ) -> Result<Vec<Decoded>, ParseError> {
        let outbound = profile.encode(&request).unwrap();
        profile.decode(
            frame,
            Some(Sent {
                request: &request,
                outbound: &outbound,
            }),
        )
    }

    #[test]
    fn test_get_frequency_expects_five_bytes() {
        let mut profile = Ft817Profile::new();
        let out = profile.encode(&Request::GetFrequency).unwrap();
        assert_eq!(out.bytes, vec![0x00, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(out.expect, Expect::Bytes(5));
    }

    #[test]
    fn test_decode_frequency_report() {
        let mut profile = Ft817Profile::new();
        let decoded =
            decode_against(&mut profile, Request::GetFrequency, &[0x01, 0x42, 0x50, 0x00, 0x01])
                .unwrap();
        assert_eq!(
            decoded,
            vec![Decoded::Reading(Reading::Radio {
                frequency_hz: 14_250_000,
                mode: RadioMode::Usb,
            })]
        );
    }

    #[test]
    fn test_decode_rejects_short_reply() {
        let mut profile = Ft817Profile::new();
        let err = decode_against(&mut profile, Request::GetFrequency, &[0x01, 0x42]).unwrap_err();
        assert_eq!(
            err,
            ParseError::UnexpectedLength {
                expected: 5,
                actual: 2
            }
        );
    }

    #[test]
    fn test_decode_without_pending_is_error() {
        let mut profile = Ft817Profile::new();
        assert!(profile.decode(&[0x00], None).is_err());
    }

    #[test]
    fn test_status_query_follows_ptt() {
        let mut profile = Ft817Profile::new();
        let rx = profile.encode(&Request::TxRxStatus).unwrap();
        assert_eq!(rx.bytes[4], 0xE7);

        let ptt = profile.encode(&Request::Ptt { on: true }).unwrap();
        assert_eq!(ptt.bytes[4], 0x08);
        assert_eq!(ptt.expect, Expect::None);

        let tx = profile.encode(&Request::TxRxStatus).unwrap();
        assert_eq!(tx.bytes[4], 0xF7);
        assert_eq!(tx.expect, Expect::Bytes(1));
    }

    #[test]
    fn test_decode_rx_status() {
        let mut profile = Ft817Profile::new();
        let decoded = decode_against(&mut profile, Request::TxRxStatus, &[0xC9]).unwrap();
        assert_eq!(
            decoded,
            vec![Decoded::Reading(Reading::RxStatus {
                smeter: 9,
                squelch: true,
                pl_code: true,
                discriminator: false,
            })]
        );
    }

    #[test]
    fn test_decode_tx_status_tracks_ptt() {
        let mut profile = Ft817Profile::new();
        profile.encode(&Request::Ptt { on: true }).unwrap();
        let decoded = decode_against(&mut profile, Request::TxRxStatus, &[0x25]).unwrap();
        assert_eq!(
            decoded,
            vec![Decoded::Reading(Reading::TxStatus {
                power: 5,
                ptt: false,
                high_swr: false,
                split: true,
            })]
        );
        assert!(!profile.transmitting());
    }

    #[test]
    fn test_lock_reply() {
        let mut profile = Ft817Profile::new();
        let decoded = decode_against(&mut profile, Request::Lock { on: true }, &[0x0F]).unwrap();
        assert_eq!(
            decoded,
            vec![Decoded::Reading(Reading::Lock { was_locked: true })]
        );
    }

    #[test]
    fn test_fire_and_forget_commands() {
        let mut profile = Ft817Profile::new();
        for req in [
            Request::Clarifier { on: true },
            Request::ToggleVfo,
            Request::Split { on: false },
            Request::Power { on: true },
            Request::SetFrequency { hz: 7_074_000 },
            Request::SetMode { mode: RadioMode::Cw },
        ] {
            let out = profile.encode(&req).unwrap();
            assert_eq!(out.bytes.len(), COMMAND_LEN);
            assert_eq!(out.expect, Expect::None, "{:?}", req);
        }
    }

    #[test]
    fn test_unsupported_request() {
        let mut profile = Ft817Profile::new();
        assert!(matches!(
            profile.encode(&Request::ReadRate),
            Err(ProtocolError::UnsupportedRequest { .. })
        ));
    }

    #[test]
    fn test_set_frequency_encoding() {
        let bytes = frequency_to_bcd_be(14_250_000).unwrap();
        assert_eq!(bytes, vec![0x01, 0x42, 0x50, 0x00]);
        assert!(frequency_to_bcd_be(1_000_000_000).is_err());
    }

    #[test]
    fn test_invalid_bcd() {
        assert_eq!(
            bcd_to_frequency_be(&[0x1A, 0x00, 0x00, 0x00]),
            Err(ParseError::InvalidBcd(0x1A))
        );
    }

    #[test]
    fn test_mode_table() {
        assert_eq!(mode_from_byte(0x0C), RadioMode::Pkt);
        assert_eq!(mode_from_byte(0x06), RadioMode::Wfm);
        assert_eq!(mode_from_byte(0x42), RadioMode::Unknown(0x42));
        assert_eq!(mode_to_byte(RadioMode::CwR), 0x03);
    }

    proptest! {
        #[test]
        fn bcd_preserves_ten_hz_resolution(hz in 0u64..999_999_990) {
            let bcd = frequency_to_bcd_be(hz).unwrap();
            prop_assert_eq!(bcd_to_frequency_be(&bcd).unwrap(), hz / 10 * 10);
        }
    }
}
