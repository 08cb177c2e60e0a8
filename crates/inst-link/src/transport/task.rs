//! Transport task
//!
//! Each open endpoint gets its own task that owns the [`Link`]. The task
//! races inbound reads against outgoing commands and reports everything
//! that happens on the link as [`TransportEvent`]s. A status with
//! `portopen: false` is always the last event a task emits.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use inst_protocol::Address;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{Connector, Endpoint, Inbound, Link};
use crate::error::TransportError;

/// Open/closed report from a transport task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    pub portopen: bool,
    /// The open attempt itself failed
    pub openerror: bool,
    pub reason: Option<String>,
    pub description: Option<String>,
}

impl TransportStatus {
    pub fn opened() -> Self {
        Self {
            portopen: true,
            openerror: false,
            reason: None,
            description: None,
        }
    }

    pub fn closed() -> Self {
        Self {
            portopen: false,
            openerror: false,
            reason: None,
            description: None,
        }
    }

    pub fn open_failed(error: &TransportError) -> Self {
        Self {
            portopen: false,
            openerror: true,
            reason: Some(error.reason().to_string()),
            description: Some(error.to_string()),
        }
    }
}

/// Events emitted by a transport task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status(TransportStatus),
    Data(Inbound),
}

#[derive(Debug)]
enum TransportCommand {
    Write {
        data: Vec<u8>,
        address: Option<Address>,
    },
    Subscribe(Address),
    Close,
}

/// Control side of a transport task
#[derive(Debug, Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::UnboundedSender<TransportCommand>,
    open: watch::Receiver<bool>,
}

impl TransportHandle {
    /// Whether the link is currently open
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Queue a write; silently dropped unless the link is open
    pub fn write(&self, data: Vec<u8>, address: Option<Address>) -> bool {
        if !self.is_open() {
            debug!("Dropping {} byte write to a closed transport", data.len());
            return false;
        }
        self.cmd_tx
            .send(TransportCommand::Write { data, address })
            .is_ok()
    }

    /// Enable notifications on a sub-channel
    pub fn subscribe(&self, address: Address) -> bool {
        self.cmd_tx.send(TransportCommand::Subscribe(address)).is_ok()
    }

    /// Ask the task to close the link; completion is reported as a status event
    pub fn close(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Close);
    }
}

/// Spawn a task that opens `endpoint` and drives the resulting link
///
/// The outcome of the open is reported asynchronously on the returned
/// receiver.
pub fn spawn_transport(
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    buffer: usize,
) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(buffer.max(1));
    let (open_tx, open_rx) = watch::channel(false);

    tokio::spawn(run_transport_task(
        connector, endpoint, cmd_rx, event_tx, open_tx,
    ));

    (
        TransportHandle {
            cmd_tx,
            open: open_rx,
        },
        event_rx,
    )
}

enum Step {
    Command(Option<TransportCommand>),
    Read(io::Result<Option<Inbound>>),
}

async fn run_transport_task(
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
    open_tx: watch::Sender<bool>,
) {
    let Some(mut link) = connect(&*connector, &endpoint, &mut cmd_rx, &event_tx).await else {
        return;
    };

    let _ = open_tx.send(true);
    info!("Transport open on {}", endpoint);
    if event_tx
        .send(TransportEvent::Status(TransportStatus::opened()))
        .await
        .is_err()
    {
        debug!("No listener for {}, closing", endpoint);
    } else {
        drive(&mut *link, &endpoint, &mut cmd_rx, &event_tx).await;
    }

    let _ = open_tx.send(false);
    if let Err(e) = link.close().await {
        debug!("Error closing {}: {}", endpoint, e);
    }
    info!("Transport closed on {}", endpoint);
    let _ = event_tx
        .send(TransportEvent::Status(TransportStatus::closed()))
        .await;
}

/// Open the link unless a close arrives first
async fn connect(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    cmd_rx: &mut mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> Option<Box<dyn Link>> {
    let connecting = connector.connect(endpoint);
    tokio::pin!(connecting);

    loop {
        tokio::select! {
            result = &mut connecting => {
                return match result {
                    Ok(link) => Some(link),
                    Err(e) => {
                        warn!("Failed to open {}: {}", endpoint, e);
                        let _ = event_tx
                            .send(TransportEvent::Status(TransportStatus::open_failed(&e)))
                            .await;
                        None
                    }
                };
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(TransportCommand::Close) | None => {
                    info!("Open of {} cancelled", endpoint);
                    let _ = event_tx
                        .send(TransportEvent::Status(TransportStatus::closed()))
                        .await;
                    return None;
                }
                Some(other) => debug!("Ignoring {:?} before {} is open", other, endpoint),
            }
        }
    }
}

/// Run the open link until it closes for any reason
async fn drive(
    link: &mut dyn Link,
    endpoint: &Endpoint,
    cmd_rx: &mut mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: &mpsc::Sender<TransportEvent>,
) {
    loop {
        let step = tokio::select! {
            biased;
            cmd = cmd_rx.recv() => Step::Command(cmd),
            result = link.read() => Step::Read(result),
        };

        match step {
            Step::Command(Some(TransportCommand::Write { data, address })) => {
                match link.write(&data, address.as_ref()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::InvalidInput => {
                        warn!("Dropping write to {}: {}", endpoint, e);
                    }
                    Err(e) => {
                        warn!("Write to {} failed: {}", endpoint, e);
                        break;
                    }
                }
            }
            Step::Command(Some(TransportCommand::Subscribe(address))) => {
                if let Err(e) = link.subscribe(&address).await {
                    warn!("Subscribe on {} failed: {}", endpoint, e);
                }
            }
            Step::Command(Some(TransportCommand::Close)) | Step::Command(None) => {
                debug!("Close requested for {}", endpoint);
                break;
            }
            Step::Read(Ok(Some(inbound))) => {
                if event_tx.send(TransportEvent::Data(inbound)).await.is_err() {
                    debug!("Listener for {} went away", endpoint);
                    break;
                }
            }
            Step::Read(Ok(None)) => {
                info!("{} closed by peer", endpoint);
                break;
            }
            Step::Read(Err(e)) if e.kind() == ErrorKind::WouldBlock => continue,
            Step::Read(Err(e)) => {
                warn!("Read error on {}: {}", endpoint, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualPorts;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Link that only accepts addressed writes
    struct AddressedLink {
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        written: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl Link for AddressedLink {
        async fn read(&mut self) -> io::Result<Option<Inbound>> {
            Ok(self.inbound.recv().await.map(Inbound::bytes))
        }

        async fn write(&mut self, data: &[u8], address: Option<&Address>) -> io::Result<()> {
            if address.is_none() {
                return Err(io::Error::new(ErrorKind::InvalidInput, "no sub-channel"));
            }
            let _ = self.written.send(data.to_vec());
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct OneLink(Mutex<Option<AddressedLink>>);

    #[async_trait]
    impl Connector for OneLink {
        async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>, TransportError> {
            let link = self.0.lock().unwrap().take();
            match link {
                Some(link) => Ok(Box::new(link)),
                None => Err(TransportError::NotFound(endpoint.to_string())),
            }
        }
    }

    fn virtual_endpoint(name: &str) -> Endpoint {
        Endpoint::Virtual { name: name.into() }
    }

    #[tokio::test]
    async fn test_open_write_read_close() {
        let ports = VirtualPorts::new();
        let mut peer = ports.create("onyx", 256);
        let (handle, mut events) = spawn_transport(Arc::new(ports), virtual_endpoint("onyx"), 16);

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Status(TransportStatus::opened()))
        );
        assert!(handle.is_open());

        assert!(handle.write(b"GETCPM\n\n".to_vec(), None));
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GETCPM\n\n");

        peer.write_all(b"{\"cpm\":{}}\n").await.unwrap();
        match events.recv().await {
            Some(TransportEvent::Data(inbound)) => assert_eq!(inbound.data, b"{\"cpm\":{}}\n"),
            other => panic!("Expected data, got {:?}", other),
        }

        handle.close();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Status(TransportStatus::closed()))
        );
        assert!(events.recv().await.is_none());
        assert!(!handle.is_open());
        assert!(!handle.write(b"late".to_vec(), None));
    }

    #[tokio::test]
    async fn test_rejected_write_keeps_link_open() {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (written, mut written_rx) = mpsc::unbounded_channel();
        let connector = OneLink(Mutex::new(Some(AddressedLink { inbound, written })));
        let (handle, mut events) =
            spawn_transport(Arc::new(connector), virtual_endpoint("ble"), 16);

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Status(TransportStatus::opened()))
        );

        assert!(handle.write(b"0".to_vec(), None));
        assert!(handle.write(b"1".to_vec(), Some(Address::HidReport(1))));
        assert_eq!(written_rx.recv().await.unwrap(), b"1");

        inbound_tx.send(vec![0x07, 0x00]).unwrap();
        match events.recv().await {
            Some(TransportEvent::Data(inbound)) => assert_eq!(inbound.data, vec![0x07, 0x00]),
            other => panic!("Expected data, got {:?}", other),
        }
        assert!(handle.is_open());

        handle.close();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Status(TransportStatus::closed()))
        );
    }

    #[tokio::test]
    async fn test_open_failure_reports_reason() {
        let (_handle, mut events) =
            spawn_transport(Arc::new(VirtualPorts::new()), virtual_endpoint("nobody"), 4);

        match events.recv().await {
            Some(TransportEvent::Status(status)) => {
                assert!(!status.portopen);
                assert!(status.openerror);
                assert_eq!(status.reason.as_deref(), Some("Device not found"));
            }
            other => panic!("Expected status, got {:?}", other),
        }
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_peer_hangup_closes() {
        let ports = VirtualPorts::new();
        let peer = ports.create("sigma", 64);
        let (_handle, mut events) = spawn_transport(Arc::new(ports), virtual_endpoint("sigma"), 4);

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Status(TransportStatus::opened()))
        );
        drop(peer);
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Status(TransportStatus::closed()))
        );
    }
}
