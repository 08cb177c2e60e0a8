//! Instrument Link Layer
//!
//! This crate connects [`inst_protocol`] profiles to real (or simulated)
//! instruments and exposes one uniform driver to collaborators.
//!
//! # Architecture
//!
//! - **Transport**: one task per open endpoint owning a [`Link`]
//!   (serial, TCP, BLE GATT, USB HID or an in-memory pipe); opening and
//!   closing are reported asynchronously as status events
//! - **Command queue**: serializes half-duplex request/response traffic
//!   and times out replies that never come
//! - **Streaming engine**: idempotent start/stop of continuous readings,
//!   either pushed by the instrument or polled on a timer
//! - **Rate conditioner**: windowed, dead-time corrected count rates
//! - **Driver**: a single actor task tying the above together per
//!   instrument, controlled through a [`DriverHandle`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use inst_link::{spawn_driver, DriverConfig, Endpoint, InstrumentConfig, StaticRegistry, SystemConnector};
//! use inst_protocol::InstrumentKind;
//!
//! # async fn example() -> Result<(), inst_link::DriverError> {
//! let registry = StaticRegistry::from_configs([InstrumentConfig {
//!     id: "onyx".into(),
//!     name: "Onyx".into(),
//!     kind: InstrumentKind::Onyx,
//!     endpoint: Endpoint::Serial { path: "/dev/ttyACM0".into(), baud_rate: 115_200, dtr: true },
//! }]);
//!
//! let (driver, mut events) = spawn_driver(
//!     Arc::new(registry),
//!     Arc::new(SystemConnector::new()),
//!     DriverConfig::default(),
//! );
//! driver.open_port("onyx").await?;
//! driver.start_live_stream(Some(2.0)).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod conditioner;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod queue;
pub mod registry;
pub mod streaming;
pub mod transport;

pub use conditioner::{dead_time_correct, RateConditioner, RateEstimate};
pub use config::DriverConfig;
pub use driver::{spawn_driver, DriverHandle};
pub use error::{DriverError, TransportError};
pub use events::{ConnectionState, DriverEvent, DriverSnapshot, DriverStatus};
pub use queue::{CommandQueue, Dispatch, Expired, PendingCommand, QueueConfig, QueueState};
pub use registry::{InstrumentConfig, InstrumentRegistry, StaticRegistry};
pub use streaming::StreamingEngine;
pub use transport::ports::{list_serial_ports, SerialPortInfo};
pub use transport::{
    spawn_transport, Connector, Endpoint, GattBackend, GattSession, HidBackend, HidDevice,
    Inbound, Link, Notification, SystemConnector, TransportEvent, TransportHandle,
    TransportStatus, VirtualPorts,
};
