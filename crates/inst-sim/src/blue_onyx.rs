//! Virtual Blue Onyx counter behind a mock GATT backend
//!
//! Implements [`GattBackend`] so it can be plugged into a
//! [`SystemConnector`](inst_link::SystemConnector). Count notifications
//! are only delivered once the host has subscribed to the Heart Rate
//! Measurement characteristic on the current connection.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use inst_link::{GattBackend, GattSession, Notification, TransportError};
use inst_protocol::blue_onyx::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

/// A characteristic write seen by the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattWrite {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    connects: usize,
    disconnects: usize,
    failing_connects: usize,
    writes: Vec<GattWrite>,
    /// Notification sink of the live connection
    current: Option<mpsc::UnboundedSender<Notification>>,
}

/// Simulated Blue Onyx peripheral
#[derive(Debug, Clone)]
pub struct VirtualBlueOnyx {
    address: String,
    state: Arc<Mutex<State>>,
    subscribed_tx: Arc<watch::Sender<bool>>,
}

impl VirtualBlueOnyx {
    pub fn new(address: impl Into<String>) -> Self {
        let (subscribed_tx, _) = watch::channel(false);
        Self {
            address: address.into(),
            state: Arc::new(Mutex::new(State::default())),
            subscribed_tx: Arc::new(subscribed_tx),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.state().failing_connects = count;
    }

    /// Number of successful connections so far
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Every characteristic write received, across connections
    pub fn writes(&self) -> Vec<GattWrite> {
        self.state().writes.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        *self.subscribed_tx.borrow()
    }

    /// Wait until the current connection subscribes to counts
    pub async fn wait_subscribed(&self) {
        let mut rx = self.subscribed_tx.subscribe();
        let _ = rx.wait_for(|subscribed| *subscribed).await;
    }

    /// Notify one counting interval; returns false if nobody listens
    pub fn notify_counts(&self, count: u8) -> bool {
        if !self.is_subscribed() {
            debug!("{} not subscribed, dropping {} counts", self.address, count);
            return false;
        }
        let state = self.state();
        let Some(tx) = &state.current else {
            return false;
        };
        tx.send(Notification {
            service: HEART_RATE_SERVICE,
            characteristic: HEART_RATE_MEASUREMENT,
            value: vec![count, 0x00],
        })
        .is_ok()
    }

    /// Drop the live connection as if the peripheral went out of range
    pub fn drop_connection(&self) {
        if self.state().current.take().is_some() {
            info!("{} dropped the connection", self.address);
        }
        self.subscribed_tx.send_replace(false);
    }
}

#[async_trait]
impl GattBackend for VirtualBlueOnyx {
    async fn connect(&self, address: &str) -> Result<Box<dyn GattSession>, TransportError> {
        if address != self.address {
            return Err(TransportError::NotFound(address.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peripheral did not answer",
                )));
            }
            state.connects += 1;
            state.current = Some(tx);
        }
        self.subscribed_tx.send_replace(false);
        info!("{} connected", self.address);

        Ok(Box::new(VirtualGattSession {
            device: self.clone(),
            notifications: rx,
        }))
    }
}

struct VirtualGattSession {
    device: VirtualBlueOnyx,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

#[async_trait]
impl GattSession for VirtualGattSession {
    async fn write(&mut self, service: Uuid, characteristic: Uuid, value: &[u8]) -> io::Result<()> {
        debug!("{} write {:02X?} to {}", self.device.address, value, characteristic);
        self.device.state().writes.push(GattWrite {
            service,
            characteristic,
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&mut self, service: Uuid, characteristic: Uuid) -> io::Result<()> {
        if service != HEART_RATE_SERVICE || characteristic != HEART_RATE_MEASUREMENT {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no notifying characteristic {}", characteristic),
            ));
        }
        self.device.subscribed_tx.send_replace(true);
        Ok(())
    }

    async fn next_notification(&mut self) -> io::Result<Option<Notification>> {
        Ok(self.notifications.recv().await)
    }

    async fn disconnect(&mut self) -> io::Result<()> {
        self.notifications.close();
        let mut state = self.device.state();
        state.disconnects += 1;
        state.current = None;
        drop(state);
        self.device.subscribed_tx.send_replace(false);
        Ok(())
    }
}
