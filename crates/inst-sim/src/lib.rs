//! Instrument Simulation Library
//!
//! Protocol-accurate stand-ins for the supported instruments, for testing
//! the link layer without hardware:
//!
//! - **VirtualFt817**: half-duplex CAT radio, can be muted or slowed
//! - **VirtualOnyx**: JSON console Geiger counter answering `GETCPM`
//! - **VirtualSigma25**: spectrometer pushing `C:` lines while started
//! - **VirtualBlueOnyx**: BLE counter behind a mock [`GattBackend`](inst_link::GattBackend)
//!
//! Serial-style simulators run as tasks on one end of an in-memory stream;
//! the `attach_*` helpers register the other end with [`VirtualPorts`] so
//! a driver can open it as an [`Endpoint::Virtual`](inst_link::Endpoint::Virtual).
//!
//! # Example
//!
//! ```rust
//! use inst_protocol::ft817::{command, Opcode};
//! use inst_sim::VirtualFt817;
//!
//! let mut radio = VirtualFt817::new("FT-817");
//! radio.set_frequency(7_074_000);
//!
//! let reply = radio.process_command(&command(Opcode::ReadFreqMode)).unwrap();
//! assert_eq!(reply[..4], [0x00, 0x70, 0x74, 0x00]);
//! ```

pub mod blue_onyx;
pub mod ft817;
pub mod onyx;
pub mod sigma25;

use std::time::Duration;

use inst_link::VirtualPorts;
use tokio::sync::mpsc;
use tracing::warn;

pub use blue_onyx::{GattWrite, VirtualBlueOnyx};
pub use ft817::{run_ft817_task, VirtualFt817, VirtualFt817Command};
pub use onyx::{run_onyx_task, VirtualOnyx, VirtualOnyxCommand};
pub use sigma25::{run_sigma25_task, VirtualSigma25, VirtualSigma25Command};

/// Buffer size of the in-memory streams handed to drivers
const STREAM_BUFFER: usize = 4096;

/// Serve `radio` on the virtual port `name`
pub fn attach_ft817(
    ports: &VirtualPorts,
    name: &str,
    radio: VirtualFt817,
) -> mpsc::Sender<VirtualFt817Command> {
    let stream = ports.create(name, STREAM_BUFFER);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Err(e) = run_ft817_task(stream, radio, cmd_rx).await {
            warn!("Virtual FT-817 task failed: {}", e);
        }
    });
    cmd_tx
}

/// Serve `counter` on the virtual port `name`
pub fn attach_onyx(
    ports: &VirtualPorts,
    name: &str,
    counter: VirtualOnyx,
) -> mpsc::Sender<VirtualOnyxCommand> {
    let stream = ports.create(name, STREAM_BUFFER);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Err(e) = run_onyx_task(stream, counter, cmd_rx).await {
            warn!("Virtual Onyx task failed: {}", e);
        }
    });
    cmd_tx
}

/// Serve `device` on the virtual port `name`, pushing spectra every `period`
pub fn attach_sigma25(
    ports: &VirtualPorts,
    name: &str,
    device: VirtualSigma25,
    period: Duration,
) -> mpsc::Sender<VirtualSigma25Command> {
    let stream = ports.create(name, STREAM_BUFFER);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Err(e) = run_sigma25_task(stream, device, period, cmd_rx).await {
            warn!("Virtual Sigma25 task failed: {}", e);
        }
    });
    cmd_tx
}
