//! Virtual Onyx Geiger counter
//!
//! A line-oriented JSON console: each command line gets one JSON
//! document back, followed by the `>` prompt when prompting is enabled.

use std::io;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PROMPT: &str = ">";

#[derive(Debug, Clone)]
pub struct VirtualOnyx {
    id: String,
    guid: String,
    version: String,
    cpm: f64,
    valid: bool,
    prompt: bool,
    line: String,
}

impl VirtualOnyx {
    pub fn new(id: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            guid: guid.into(),
            version: "Onyx 1.0.0".to_string(),
            cpm: 0.0,
            valid: true,
            prompt: true,
            line: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_cpm(&mut self, cpm: f64, valid: bool) {
        self.cpm = cpm;
        self.valid = valid;
    }

    /// Print the console prompt after every answer
    pub fn set_prompt(&mut self, prompt: bool) {
        self.prompt = prompt;
    }

    /// Feed raw bytes; returns the output owed, newline terminated
    pub fn process_bytes(&mut self, data: &[u8]) -> String {
        self.line.push_str(&String::from_utf8_lossy(data));
        let mut output = String::new();

        while let Some(pos) = self.line.find('\n') {
            let line: String = self.line.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(answer) = self.process_line(line) {
                output.push_str(&answer);
                output.push('\n');
            }
            if self.prompt {
                output.push_str(PROMPT);
                output.push('\n');
            }
        }
        output
    }

    /// Answer one console command
    pub fn process_line(&mut self, line: &str) -> Option<String> {
        debug!("{} console: {}", self.id, line);

        if line.eq_ignore_ascii_case("GETCPM") {
            return Some(json!({"cpm": {"value": self.cpm, "valid": self.valid}}).to_string());
        }
        if line.eq_ignore_ascii_case("GETVER") {
            return Some(json!({"version": self.version}).to_string());
        }

        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => match value.get("get").and_then(|v| v.as_str()) {
                Some("guid") => Some(json!({"guid": self.guid}).to_string()),
                Some(other) => Some(json!({"error": format!("unknown key {}", other)}).to_string()),
                None => Some(json!({"error": "missing get"}).to_string()),
            },
            Err(_) => Some(json!({"error": format!("unknown command {}", line)}).to_string()),
        }
    }
}

/// Commands accepted by a running virtual Onyx task
#[derive(Debug, Clone)]
pub enum VirtualOnyxCommand {
    SetCpm { cpm: f64, valid: bool },
    Shutdown,
}

/// Run a virtual Onyx over `stream` until shut down or disconnected
pub async fn run_onyx_task<S>(
    mut stream: S,
    mut counter: VirtualOnyx,
    mut cmd_rx: mpsc::Receiver<VirtualOnyxCommand>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 256];
    let mut commands_open = true;
    info!("Starting virtual Onyx {}", counter.id());

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                let n = match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Virtual Onyx {} stream error: {}", counter.id(), e);
                        return Err(e);
                    }
                };
                let output = counter.process_bytes(&buf[..n]);
                if !output.is_empty() {
                    stream.write_all(output.as_bytes()).await?;
                    stream.flush().await?;
                }
            }

            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(VirtualOnyxCommand::SetCpm { cpm, valid }) => counter.set_cpm(cpm, valid),
                    Some(VirtualOnyxCommand::Shutdown) => break,
                    None => commands_open = false,
                }
            }
        }
    }

    info!("Virtual Onyx task ended for {}", counter.id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_getcpm_answer() {
        let mut onyx = VirtualOnyx::new("onyx", "ABCD-1234");
        onyx.set_cpm(42.0, true);
        let output = onyx.process_bytes(b"GETCPM\n\n");
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value, json!({"cpm": {"value": 42.0, "valid": true}}));
        assert_eq!(lines[1], ">");
    }

    #[test]
    fn test_guid_answer() {
        let mut onyx = VirtualOnyx::new("onyx", "ABCD-1234");
        onyx.set_prompt(false);
        let output = onyx.process_bytes(b"{ \"get\": \"guid\" }\n\n");
        assert_eq!(output, "{\"guid\":\"ABCD-1234\"}\n");
    }

    #[test]
    fn test_split_command() {
        let mut onyx = VirtualOnyx::new("onyx", "g");
        onyx.set_prompt(false);
        assert!(onyx.process_bytes(b"GET").is_empty());
        assert!(onyx.process_bytes(b"CPM\n").starts_with("{\"cpm\""));
    }

    #[test]
    fn test_unknown_command() {
        let mut onyx = VirtualOnyx::new("onyx", "g");
        let answer = onyx.process_line("HELP").unwrap();
        assert!(answer.contains("error"));
    }
}
