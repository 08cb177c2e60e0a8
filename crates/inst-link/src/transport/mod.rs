//! Transports
//!
//! One [`Link`] implementation per physical medium. A link is driven by a
//! dedicated transport task ([`spawn_transport`]) that owns it
//! exclusively: the driver talks to the task through a
//! [`TransportHandle`] and hears back through [`TransportEvent`]s.
//!
//! Opening is asynchronous. Its outcome is reported only as a
//! [`TransportEvent::Status`], never as a return value.
//!
//! ## Media
//!
//! - Serial ports and TCP sockets are byte streams ([`StreamLink`])
//! - BLE GATT and USB HID are reached through host-supplied backends
//!   ([`GattBackend`], [`HidBackend`]); sub-channels (characteristics,
//!   report ids) travel with each write as an [`Address`]
//! - Virtual endpoints hand out in-memory duplex streams registered by
//!   tests and simulators ([`VirtualPorts`])

mod ble;
mod hid;
pub mod ports;
mod stream;
mod task;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use inst_protocol::Address;
use serde::{Deserialize, Serialize};
use tokio::io::DuplexStream;
use tracing::debug;

use crate::error::TransportError;

pub use ble::{GattBackend, GattLink, GattSession, Notification};
pub use hid::{HidBackend, HidDevice, HidLink};
pub use stream::{connect_tcp, open_serial, StreamLink};
pub use task::{spawn_transport, TransportEvent, TransportHandle, TransportStatus};

/// Longest slice of raw traffic written to the log
const LOG_PREVIEW: usize = 64;

/// Head of a buffer, short enough for a log line
pub(crate) fn preview(data: &[u8]) -> &[u8] {
    &data[..data.len().min(LOG_PREVIEW)]
}

/// Where an instrument lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    /// Serial port
    Serial {
        /// Port name (e.g., /dev/ttyUSB0, COM3)
        path: String,
        baud_rate: u32,
        /// Assert DTR after opening
        #[serde(default)]
        dtr: bool,
    },
    /// TCP socket
    Tcp { host: String, port: u16 },
    /// BLE peripheral
    Gatt { address: String },
    /// USB HID device
    Hid { vendor_id: u16, product_id: u16 },
    /// In-memory stream registered with [`VirtualPorts`]
    Virtual { name: String },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial {
                path, baud_rate, ..
            } => write!(f, "{}@{}", path, baud_rate),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Gatt { address } => write!(f, "ble:{}", address),
            Endpoint::Hid {
                vendor_id,
                product_id,
            } => write!(f, "hid:{:04x}:{:04x}", vendor_id, product_id),
            Endpoint::Virtual { name } => write!(f, "virtual:{}", name),
        }
    }
}

/// One chunk of inbound data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Raw bytes as delivered by the medium
    pub data: Vec<u8>,
    /// Sub-channel the data arrived on
    pub address: Option<Address>,
}

impl Inbound {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            address: None,
        }
    }
}

/// An open connection to one instrument
///
/// `read` must be cancel-safe: the transport task races it against
/// outgoing commands and drops the future when a command wins.
#[async_trait]
pub trait Link: Send {
    /// Wait for the next inbound chunk; `Ok(None)` means the peer closed
    async fn read(&mut self) -> io::Result<Option<Inbound>>;

    /// Write bytes, optionally to a sub-channel
    async fn write(&mut self, data: &[u8], address: Option<&Address>) -> io::Result<()>;

    /// Start notifications on a sub-channel
    async fn subscribe(&mut self, address: &Address) -> io::Result<()> {
        debug!("Ignoring subscribe to {:?} on a stream link", address);
        Ok(())
    }

    /// Release the connection
    async fn close(&mut self) -> io::Result<()>;
}

/// Opens links for endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>, TransportError>;
}

/// Registry of in-memory streams served for [`Endpoint::Virtual`]
///
/// Each connect consumes one registered stream, so a test that expects a
/// reconnect registers two.
#[derive(Debug, Clone, Default)]
pub struct VirtualPorts {
    streams: Arc<Mutex<HashMap<String, VecDeque<DuplexStream>>>>,
}

impl VirtualPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stream` available to the next connect on `name`
    pub fn register(&self, name: impl Into<String>, stream: DuplexStream) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.entry(name.into()).or_default().push_back(stream);
        }
    }

    /// Create a connected pair, register one end and return the other
    pub fn create(&self, name: impl Into<String>, buffer: usize) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(buffer);
        self.register(name, ours);
        theirs
    }

    fn take(&self, name: &str) -> Option<DuplexStream> {
        self.streams
            .lock()
            .ok()
            .and_then(|mut streams| streams.get_mut(name).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl Connector for VirtualPorts {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>, TransportError> {
        match endpoint {
            Endpoint::Virtual { name } => self
                .take(name)
                .map(|stream| Box::new(StreamLink::new(name.clone(), stream)) as Box<dyn Link>)
                .ok_or_else(|| TransportError::NotFound(endpoint.to_string())),
            other => Err(TransportError::Unsupported(other.to_string())),
        }
    }
}

/// Connector for real hardware
///
/// Serial and TCP are built in. BLE and HID need a backend supplied by
/// the host; without one those endpoints fail to open with
/// "Unsupported transport".
#[derive(Clone, Default)]
pub struct SystemConnector {
    gatt: Option<Arc<dyn GattBackend>>,
    hid: Option<Arc<dyn HidBackend>>,
    virtual_ports: VirtualPorts,
}

impl SystemConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gatt(mut self, backend: Arc<dyn GattBackend>) -> Self {
        self.gatt = Some(backend);
        self
    }

    pub fn with_hid(mut self, backend: Arc<dyn HidBackend>) -> Self {
        self.hid = Some(backend);
        self
    }

    pub fn with_virtual_ports(mut self, ports: VirtualPorts) -> Self {
        self.virtual_ports = ports;
        self
    }
}

#[async_trait]
impl Connector for SystemConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>, TransportError> {
        match endpoint {
            Endpoint::Serial {
                path,
                baud_rate,
                dtr,
            } => Ok(Box::new(stream::open_serial(path, *baud_rate, *dtr)?)),
            Endpoint::Tcp { host, port } => Ok(Box::new(stream::connect_tcp(host, *port).await?)),
            Endpoint::Gatt { address } => {
                let backend = self
                    .gatt
                    .as_ref()
                    .ok_or_else(|| TransportError::Unsupported(endpoint.to_string()))?;
                let session = backend.connect(address).await?;
                Ok(Box::new(GattLink::new(address.clone(), session)))
            }
            Endpoint::Hid {
                vendor_id,
                product_id,
            } => {
                let backend = self
                    .hid
                    .as_ref()
                    .ok_or_else(|| TransportError::Unsupported(endpoint.to_string()))?;
                let device = backend.open(*vendor_id, *product_id).await?;
                Ok(Box::new(HidLink::new(device)))
            }
            Endpoint::Virtual { .. } => self.virtual_ports.connect(endpoint).await,
        }
    }
}
