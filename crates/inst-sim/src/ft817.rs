//! Virtual FT-817 transceiver
//!
//! Answers 5-byte CAT commands the way the radio does: queries get a
//! fixed-length reply with no echo, everything else is silent. The radio
//! can be muted to exercise reply timeouts and slowed down with a
//! response delay.

use std::io;
use std::time::Duration;

use inst_protocol::ft817::{
    bcd_to_frequency_be, frequency_to_bcd_be, mode_from_byte, mode_to_byte, rx_status, tx_status,
    Opcode, COMMAND_LEN,
};
use inst_protocol::RadioMode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lock reply when the radio was already locked
const LOCK_WAS_LOCKED: u8 = 0x0F;

/// Lock reply when the radio was unlocked
const LOCK_WAS_UNLOCKED: u8 = 0x00;

#[derive(Debug, Clone)]
pub struct VirtualFt817 {
    id: String,
    frequency_hz: u64,
    other_vfo_hz: u64,
    mode: RadioMode,
    ptt: bool,
    locked: bool,
    split: bool,
    clarifier: bool,
    powered: bool,
    smeter: u8,
    power_meter: u8,
    muted: bool,
    response_delay: Duration,
    buffer: Vec<u8>,
}

impl VirtualFt817 {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            frequency_hz: 14_250_000,
            other_vfo_hz: 7_074_000,
            mode: RadioMode::Usb,
            ptt: false,
            locked: false,
            split: false,
            clarifier: false,
            powered: true,
            smeter: 0,
            power_meter: 0,
            muted: false,
            response_delay: Duration::ZERO,
            buffer: Vec::with_capacity(COMMAND_LEN),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }

    pub fn set_frequency(&mut self, hz: u64) {
        self.frequency_hz = hz;
    }

    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RadioMode) {
        self.mode = mode;
    }

    pub fn ptt(&self) -> bool {
        self.ptt
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn split(&self) -> bool {
        self.split
    }

    pub fn clarifier(&self) -> bool {
        self.clarifier
    }

    pub fn powered(&self) -> bool {
        self.powered
    }

    /// S-meter reading reported in RX status (0-15)
    pub fn set_smeter(&mut self, level: u8) {
        self.smeter = level & rx_status::S_METER_MASK;
    }

    /// Power meter reading reported in TX status (0-15)
    pub fn set_power_meter(&mut self, level: u8) {
        self.power_meter = level & tx_status::POWER_MASK;
    }

    /// Stop answering queries; state changes still apply
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn set_response_delay(&mut self, delay: Duration) {
        self.response_delay = delay;
    }

    pub fn response_delay(&self) -> Duration {
        self.response_delay
    }

    /// Feed raw bytes; returns the replies owed, in order
    pub fn process_bytes(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut replies = Vec::new();

        while self.buffer.len() >= COMMAND_LEN {
            let mut command = [0u8; COMMAND_LEN];
            command.copy_from_slice(&self.buffer[..COMMAND_LEN]);
            self.buffer.drain(..COMMAND_LEN);
            if let Some(reply) = self.process_command(&command) {
                replies.push(reply);
            }
        }
        replies
    }

    /// Apply one command; returns the reply if one is owed and not muted
    pub fn process_command(&mut self, command: &[u8; COMMAND_LEN]) -> Option<Vec<u8>> {
        let opcode = match Opcode::try_from(command[COMMAND_LEN - 1]) {
            Ok(opcode) => opcode,
            Err(e) => {
                warn!("{} ignoring {:02X?}: {}", self.id, command, e);
                return None;
            }
        };
        debug!("{} processing {:?}", self.id, opcode);

        let reply = match opcode {
            Opcode::LockOn | Opcode::LockOff => {
                let was = if self.locked {
                    LOCK_WAS_LOCKED
                } else {
                    LOCK_WAS_UNLOCKED
                };
                self.locked = opcode == Opcode::LockOn;
                Some(vec![was])
            }
            Opcode::SetFrequency => {
                match bcd_to_frequency_be(&command[..4]) {
                    Ok(hz) => self.frequency_hz = hz,
                    Err(e) => warn!("{} rejected frequency {:02X?}: {}", self.id, &command[..4], e),
                }
                None
            }
            Opcode::ReadFreqMode => {
                let mut reply = frequency_to_bcd_be(self.frequency_hz).ok()?;
                reply.push(mode_to_byte(self.mode));
                Some(reply)
            }
            Opcode::SetMode => {
                self.mode = mode_from_byte(command[0]);
                None
            }
            Opcode::SplitOn | Opcode::SplitOff => {
                self.split = opcode == Opcode::SplitOn;
                None
            }
            Opcode::ClarOn | Opcode::ClarOff => {
                self.clarifier = opcode == Opcode::ClarOn;
                None
            }
            Opcode::PttOn | Opcode::PttOff => {
                self.ptt = opcode == Opcode::PttOn;
                None
            }
            Opcode::ToggleVfo => {
                std::mem::swap(&mut self.frequency_hz, &mut self.other_vfo_hz);
                None
            }
            Opcode::PowerOn | Opcode::PowerOff => {
                self.powered = opcode == Opcode::PowerOn;
                None
            }
            Opcode::ReadRxStatus => {
                let mut status = self.smeter;
                if self.smeter > 0 {
                    status |= rx_status::SQUELCH;
                }
                Some(vec![status])
            }
            Opcode::ReadTxStatus => {
                let mut status = self.power_meter;
                if self.ptt {
                    status |= tx_status::PTT;
                }
                if self.split {
                    status |= tx_status::SPLIT;
                }
                Some(vec![status])
            }
        };

        if self.muted {
            if reply.is_some() {
                debug!("{} muted, not answering {:?}", self.id, opcode);
            }
            return None;
        }
        reply
    }
}

/// Commands accepted by a running virtual FT-817 task
#[derive(Debug, Clone)]
pub enum VirtualFt817Command {
    SetMuted(bool),
    SetResponseDelay(Duration),
    SetFrequency(u64),
    SetSMeter(u8),
    Shutdown,
}

/// Run a virtual FT-817 over `stream` until shut down or disconnected
pub async fn run_ft817_task<S>(
    mut stream: S,
    mut radio: VirtualFt817,
    mut cmd_rx: mpsc::Receiver<VirtualFt817Command>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 256];
    let mut commands_open = true;
    info!("Starting virtual FT-817 {}", radio.id());

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                let n = match result {
                    Ok(0) => {
                        debug!("Virtual FT-817 {} stream closed", radio.id());
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Virtual FT-817 {} stream error: {}", radio.id(), e);
                        return Err(e);
                    }
                };

                for reply in radio.process_bytes(&buf[..n]) {
                    if !radio.response_delay().is_zero() {
                        tokio::time::sleep(radio.response_delay()).await;
                    }
                    stream.write_all(&reply).await?;
                    stream.flush().await?;
                }
            }

            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(VirtualFt817Command::SetMuted(muted)) => radio.set_muted(muted),
                    Some(VirtualFt817Command::SetResponseDelay(delay)) => radio.set_response_delay(delay),
                    Some(VirtualFt817Command::SetFrequency(hz)) => radio.set_frequency(hz),
                    Some(VirtualFt817Command::SetSMeter(level)) => radio.set_smeter(level),
                    None => commands_open = false,
                    Some(VirtualFt817Command::Shutdown) => {
                        info!("Shutdown requested for virtual FT-817 {}", radio.id());
                        break;
                    }
                }
            }
        }
    }

    info!("Virtual FT-817 task ended for {}", radio.id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use inst_protocol::ft817::command;

    #[test]
    fn test_read_frequency_and_mode() {
        let mut radio = VirtualFt817::new("ft817");
        radio.set_frequency(7_074_000);
        radio.set_mode(RadioMode::Dig);
        let reply = radio.process_command(&command(Opcode::ReadFreqMode)).unwrap();
        assert_eq!(reply, vec![0x00, 0x70, 0x74, 0x00, 0x0A]);
    }

    #[test]
    fn test_lock_reports_previous_state() {
        let mut radio = VirtualFt817::new("ft817");
        assert_eq!(radio.process_command(&command(Opcode::LockOn)), Some(vec![0x00]));
        assert_eq!(radio.process_command(&command(Opcode::LockOn)), Some(vec![0x0F]));
        assert_eq!(radio.process_command(&command(Opcode::LockOff)), Some(vec![0x0F]));
        assert!(!radio.locked());
    }

    #[test]
    fn test_set_commands_are_silent() {
        let mut radio = VirtualFt817::new("ft817");
        assert!(radio.process_command(&command(Opcode::PttOn)).is_none());
        assert!(radio.ptt());
        assert!(radio
            .process_command(&[0x00, 0x70, 0x74, 0x00, Opcode::SetFrequency as u8])
            .is_none());
        assert_eq!(radio.frequency_hz(), 7_074_000);

        let status = radio.process_command(&command(Opcode::ReadTxStatus)).unwrap();
        assert_eq!(status[0] & tx_status::PTT, tx_status::PTT);
    }

    #[test]
    fn test_partial_commands_are_buffered() {
        let mut radio = VirtualFt817::new("ft817");
        assert!(radio.process_bytes(&[0x00, 0x00]).is_empty());
        let replies = radio.process_bytes(&[0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0xE7]);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].len(), 5);
        assert_eq!(replies[1].len(), 1);
    }

    #[test]
    fn test_muted_radio_still_changes_state() {
        let mut radio = VirtualFt817::new("ft817");
        radio.set_muted(true);
        assert!(radio.process_command(&command(Opcode::ReadFreqMode)).is_none());
        assert!(radio.process_command(&command(Opcode::LockOn)).is_none());
        assert!(radio.locked());
    }

    #[tokio::test]
    async fn test_task_answers_over_stream() {
        let (mut host, device) = tokio::io::duplex(64);
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(run_ft817_task(device, VirtualFt817::new("ft817"), cmd_rx));

        host.write_all(&command(Opcode::ReadRxStatus)).await.unwrap();
        let mut reply = [0u8; 1];
        host.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x00);

        drop(host);
        task.await.unwrap().unwrap();
    }
}
