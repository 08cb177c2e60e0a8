//! USB HID links
//!
//! Like BLE, HID access goes through a host-supplied [`HidBackend`]. Each
//! report id is a sub-channel; writes without an address go to report 0.

use std::io;

use async_trait::async_trait;
use inst_protocol::Address;
use tracing::debug;

use super::{preview, Inbound, Link};
use crate::error::TransportError;

/// Host HID stack
#[async_trait]
pub trait HidBackend: Send + Sync {
    async fn open(&self, vendor_id: u16, product_id: u16)
        -> Result<Box<dyn HidDevice>, TransportError>;
}

/// One opened HID device
#[async_trait]
pub trait HidDevice: Send {
    async fn write_report(&mut self, report_id: u8, data: &[u8]) -> io::Result<()>;

    /// Next input report as `(report_id, data)`; `Ok(None)` once detached
    ///
    /// Must be cancel-safe.
    async fn read_report(&mut self) -> io::Result<Option<(u8, Vec<u8>)>>;

    async fn close(&mut self) -> io::Result<()>;
}

/// [`Link`] over a HID device
pub struct HidLink {
    device: Box<dyn HidDevice>,
}

impl HidLink {
    pub fn new(device: Box<dyn HidDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl Link for HidLink {
    async fn read(&mut self) -> io::Result<Option<Inbound>> {
        Ok(self
            .device
            .read_report()
            .await?
            .map(|(report_id, data)| Inbound {
                data,
                address: Some(Address::HidReport(report_id)),
            }))
    }

    async fn write(&mut self, data: &[u8], address: Option<&Address>) -> io::Result<()> {
        let report_id = match address {
            Some(Address::HidReport(id)) => *id,
            None => 0,
            Some(other) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("HID write cannot target {:?}", other),
                ))
            }
        };
        debug!("Writing HID report {}: {:02X?}", report_id, preview(data));
        self.device.write_report(report_id, data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.device.close().await
    }
}
