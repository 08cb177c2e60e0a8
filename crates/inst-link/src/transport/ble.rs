//! BLE GATT links
//!
//! The radio stack itself is host-specific, so the link layer only
//! defines the seam: a [`GattBackend`] opens [`GattSession`]s and
//! [`GattLink`] adapts a session to the [`Link`] contract, mapping
//! characteristics to [`Address::Gatt`].

use std::io;

use async_trait::async_trait;
use inst_protocol::Address;
use tracing::debug;
use uuid::Uuid;

use super::{preview, Inbound, Link};
use crate::error::TransportError;

/// A value notified on a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Host BLE stack
#[async_trait]
pub trait GattBackend: Send + Sync {
    /// Connect to a peripheral by address
    async fn connect(&self, address: &str) -> Result<Box<dyn GattSession>, TransportError>;
}

/// One connected peripheral
#[async_trait]
pub trait GattSession: Send {
    /// Write a characteristic value
    async fn write(&mut self, service: Uuid, characteristic: Uuid, value: &[u8]) -> io::Result<()>;

    /// Enable notifications on a characteristic
    async fn subscribe(&mut self, service: Uuid, characteristic: Uuid) -> io::Result<()>;

    /// Wait for the next notification; `Ok(None)` once disconnected
    ///
    /// Must be cancel-safe.
    async fn next_notification(&mut self) -> io::Result<Option<Notification>>;

    /// Drop the connection
    async fn disconnect(&mut self) -> io::Result<()>;
}

/// [`Link`] over a GATT session
pub struct GattLink {
    address: String,
    session: Box<dyn GattSession>,
}

impl GattLink {
    pub fn new(address: impl Into<String>, session: Box<dyn GattSession>) -> Self {
        Self {
            address: address.into(),
            session,
        }
    }
}

fn gatt_target(address: Option<&Address>) -> io::Result<(Uuid, Uuid)> {
    match address {
        Some(Address::Gatt {
            service,
            characteristic,
        }) => Ok((*service, *characteristic)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("GATT write needs a characteristic, got {:?}", other),
        )),
    }
}

#[async_trait]
impl Link for GattLink {
    async fn read(&mut self) -> io::Result<Option<Inbound>> {
        Ok(self
            .session
            .next_notification()
            .await?
            .map(|n| Inbound {
                data: n.value,
                address: Some(Address::Gatt {
                    service: n.service,
                    characteristic: n.characteristic,
                }),
            }))
    }

    async fn write(&mut self, data: &[u8], address: Option<&Address>) -> io::Result<()> {
        let (service, characteristic) = gatt_target(address)?;
        debug!(
            "Writing {:02X?} to {} characteristic {}",
            preview(data),
            self.address,
            characteristic
        );
        self.session.write(service, characteristic, data).await
    }

    async fn subscribe(&mut self, address: &Address) -> io::Result<()> {
        let (service, characteristic) = gatt_target(Some(address))?;
        debug!("Subscribing to {} characteristic {}", self.address, characteristic);
        self.session.subscribe(service, characteristic).await
    }

    async fn close(&mut self) -> io::Result<()> {
        debug!("Disconnecting {}", self.address);
        self.session.disconnect().await
    }
}
