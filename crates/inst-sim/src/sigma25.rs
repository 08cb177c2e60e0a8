//! Virtual Sigma25 spectrometer
//!
//! Streams `C:` spectrum lines on a fixed interval between `S` and `s`.
//! Any other newline-terminated text is treated as a console query and
//! answered with one `key:value` line.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between spectrum lines
pub const DEFAULT_SPECTRUM_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct VirtualSigma25 {
    id: String,
    version: String,
    gain: i64,
    channels: Vec<i64>,
    streaming: bool,
    line: String,
}

impl VirtualSigma25 {
    pub fn new(id: impl Into<String>, channel_count: usize) -> Self {
        Self {
            id: id.into(),
            version: "Sigma25 2.1".to_string(),
            gain: 12,
            channels: vec![0; channel_count.max(1)],
            streaming: false,
            line: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn channels(&self) -> &[i64] {
        &self.channels
    }

    /// Feed raw bytes; returns any console answers owed
    pub fn process_bytes(&mut self, data: &[u8]) -> String {
        let mut output = String::new();

        for &byte in data {
            match byte {
                b'S' if self.line.is_empty() => {
                    debug!("{} streaming on", self.id);
                    self.streaming = true;
                }
                b's' if self.line.is_empty() => {
                    debug!("{} streaming off", self.id);
                    self.streaming = false;
                }
                b'\n' | b'\r' => {
                    let line = std::mem::take(&mut self.line);
                    if let Some(answer) = self.process_line(line.trim()) {
                        output.push_str(&answer);
                        output.push('\n');
                    }
                }
                other => self.line.push(char::from(other)),
            }
        }
        output
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        match line {
            "" => None,
            "version" => Some(format!("version:{}", self.version)),
            "gain" => Some(format!("gain:{}", self.gain)),
            "channels" => Some(format!("channels:{}", self.channels.len())),
            other => Some(format!("error:unknown:{}", other)),
        }
    }

    /// Accumulate one interval of counts and render the spectrum line
    pub fn next_spectrum(&mut self) -> String {
        let peak = self.channels.len() / 2;
        for (i, count) in self.channels.iter_mut().enumerate() {
            *count += if i == peak { 3 } else { 1 };
        }
        let counts: Vec<String> = self.channels.iter().map(i64::to_string).collect();
        format!("C:{}\n", counts.join(","))
    }
}

/// Commands accepted by a running virtual Sigma25 task
#[derive(Debug, Clone)]
pub enum VirtualSigma25Command {
    /// Emit a line as if the device had printed it
    Emit(String),
    Shutdown,
}

/// Run a virtual Sigma25 over `stream`, pushing spectra every `period` while streaming
pub async fn run_sigma25_task<S>(
    mut stream: S,
    mut device: VirtualSigma25,
    period: Duration,
    mut cmd_rx: mpsc::Receiver<VirtualSigma25Command>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 256];
    let mut commands_open = true;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Starting virtual Sigma25 {}", device.id());

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                let n = match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Virtual Sigma25 {} stream error: {}", device.id(), e);
                        return Err(e);
                    }
                };
                let was_streaming = device.is_streaming();
                let output = device.process_bytes(&buf[..n]);
                if !was_streaming && device.is_streaming() {
                    ticker.reset();
                }
                if !output.is_empty() {
                    stream.write_all(output.as_bytes()).await?;
                }
            }

            _ = ticker.tick(), if device.is_streaming() => {
                let line = device.next_spectrum();
                stream.write_all(line.as_bytes()).await?;
            }

            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(VirtualSigma25Command::Emit(line)) => {
                        stream.write_all(line.as_bytes()).await?;
                        stream.write_all(b"\n").await?;
                    }
                    Some(VirtualSigma25Command::Shutdown) => break,
                    None => commands_open = false,
                }
            }
        }
    }

    info!("Virtual Sigma25 task ended for {}", device.id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_bytes() {
        let mut device = VirtualSigma25::new("sigma", 4);
        assert!(device.process_bytes(b"S").is_empty());
        assert!(device.is_streaming());
        device.process_bytes(b"s");
        assert!(!device.is_streaming());
    }

    #[test]
    fn test_console_query() {
        let mut device = VirtualSigma25::new("sigma", 4);
        assert_eq!(device.process_bytes(b"version\n"), "version:Sigma25 2.1\n");
        assert_eq!(device.process_bytes(b"gain\n"), "gain:12\n");
        assert!(!device.is_streaming());
    }

    #[test]
    fn test_spectrum_accumulates() {
        let mut device = VirtualSigma25::new("sigma", 3);
        assert_eq!(device.next_spectrum(), "C:1,3,1\n");
        assert_eq!(device.next_spectrum(), "C:2,6,2\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_streams_after_start() {
        let (mut host, peer) = tokio::io::duplex(1024);
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(run_sigma25_task(
            peer,
            VirtualSigma25::new("sigma", 2),
            Duration::from_millis(100),
            cmd_rx,
        ));

        host.write_all(b"S").await.unwrap();
        let mut buf = [0u8; 8];
        let n = host.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"C:"));

        drop(host);
        task.await.unwrap().unwrap();
    }
}
