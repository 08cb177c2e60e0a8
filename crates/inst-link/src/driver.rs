//! Driver actor
//!
//! One driver manages the connection to one instrument at a time. All of
//! its state lives in a single task: collaborators talk to it through a
//! [`DriverHandle`] and receive everything it learns as [`DriverEvent`]s.
//!
//! The task multiplexes:
//! - commands from handles
//! - transport events (open/close status and inbound data)
//! - the half-duplex queue's response deadline
//! - poll ticks of the streaming engine
//! - initialization cycle, reconnect and rate staleness timers
//!
//! Handlers never await. Events they produce are collected in an outbox
//! and published after each step, so ordering on the event channel always
//! matches the order in which things were handled.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use inst_protocol::{
    create_profile, Address, Decoded, Duplex, Expect, Framer, InstrumentProfile, NormalizedEvent,
    OpenAction, Reading, Request, StreamPolicy, UniqueIdSource,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::conditioner::RateConditioner;
use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::events::{ConnectionState, DriverEvent, DriverSnapshot, DriverStatus};
use crate::queue::{CommandQueue, Expired};
use crate::registry::{InstrumentConfig, InstrumentRegistry};
use crate::streaming::StreamingEngine;
use crate::transport::{
    preview, spawn_transport, Connector, Endpoint, Inbound, TransportEvent, TransportHandle,
    TransportStatus,
};

/// Capacity of the handle-to-driver command channel
const COMMAND_BUFFER: usize = 64;

#[derive(Debug)]
enum DriverCommand {
    Open(String),
    Close,
    StartStream(Option<Duration>),
    StopStream,
    SendUniqueId,
    Output(Request),
    SetRecording(bool),
    Sync(oneshot::Sender<DriverSnapshot>),
    Shutdown,
}

/// Control side of a driver
///
/// Cheap to clone. Query methods read a snapshot the driver refreshes
/// after every step and never block.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    cmd_tx: mpsc::Sender<DriverCommand>,
    snapshot: watch::Receiver<DriverSnapshot>,
}

impl DriverHandle {
    async fn send(&self, cmd: DriverCommand) -> Result<(), DriverError> {
        self.cmd_tx.send(cmd).await.map_err(|_| DriverError::Stopped)
    }

    /// Open the instrument registered under `id`
    ///
    /// The outcome is published as a status or open-error event.
    pub async fn open_port(&self, id: impl Into<String>) -> Result<(), DriverError> {
        self.send(DriverCommand::Open(id.into())).await
    }

    /// Close the current instrument
    ///
    /// Completes once the final `portopen: false` status is published.
    pub async fn close_port(&self) -> Result<(), DriverError> {
        self.send(DriverCommand::Close).await
    }

    /// Start continuous readings, polling every `period_secs` where applicable
    pub async fn start_live_stream(&self, period_secs: Option<f64>) -> Result<(), DriverError> {
        let period = period_secs
            .filter(|p| p.is_finite() && *p > 0.0)
            .map(Duration::from_secs_f64);
        self.send(DriverCommand::StartStream(period)).await
    }

    pub async fn stop_live_stream(&self) -> Result<(), DriverError> {
        self.send(DriverCommand::StopStream).await
    }

    /// Publish the instrument's unique identifier
    pub async fn send_unique_id(&self) -> Result<(), DriverError> {
        self.send(DriverCommand::SendUniqueId).await
    }

    /// Send a request to the instrument
    pub async fn output(&self, request: Request) -> Result<(), DriverError> {
        self.send(DriverCommand::Output(request)).await
    }

    /// Record the recorder state and announce it as a status event
    pub async fn set_recording(&self, recording: bool) -> Result<(), DriverError> {
        self.send(DriverCommand::SetRecording(recording)).await
    }

    /// Wait until every earlier command has been handled
    pub async fn sync(&self) -> Result<DriverSnapshot, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.send(DriverCommand::Sync(tx)).await?;
        rx.await.map_err(|_| DriverError::Stopped)
    }

    /// Stop the driver task
    pub async fn shutdown(&self) -> Result<(), DriverError> {
        self.send(DriverCommand::Shutdown).await
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> DriverSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_open_pending(&self) -> bool {
        self.state() == ConnectionState::Opening
    }

    pub fn is_streaming(&self) -> bool {
        self.snapshot.borrow().streaming
    }
}

/// Spawn a driver task
pub fn spawn_driver(
    registry: Arc<dyn InstrumentRegistry>,
    connector: Arc<dyn Connector>,
    config: DriverConfig,
) -> (DriverHandle, mpsc::Receiver<DriverEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
    let (snapshot_tx, snapshot_rx) = watch::channel(DriverSnapshot::default());

    let driver = Driver {
        registry,
        connector,
        config,
        event_tx,
        snapshot_tx,
        outbox: Vec::new(),
        state: ConnectionState::Closed,
        recording: false,
        session: None,
    };
    tokio::spawn(driver.run(cmd_rx));

    (
        DriverHandle {
            cmd_tx,
            snapshot: snapshot_rx,
        },
        event_rx,
    )
}

struct Transport {
    handle: TransportHandle,
    events: mpsc::Receiver<TransportEvent>,
}

fn open_transport(connector: &Arc<dyn Connector>, endpoint: &Endpoint, buffer: usize) -> Transport {
    let (handle, events) = spawn_transport(connector.clone(), endpoint.clone(), buffer);
    Transport { handle, events }
}

/// Everything tied to one opened instrument
struct Session {
    instrument: InstrumentConfig,
    profile: Box<dyn InstrumentProfile>,
    framer: Framer,
    queue: CommandQueue,
    streaming: StreamingEngine,
    conditioner: Option<RateConditioner>,
    transport: Option<Transport>,
    /// Explicit close in progress; nothing but the final status follows
    close_requested: bool,
    /// Closing only to reopen for initialization
    cycling: bool,
    /// Reopening after an unexpected disconnect
    reconnecting: bool,
    cycle_at: Option<Instant>,
    reopen_at: Option<Instant>,
    stale_at: Option<Instant>,
}

impl Session {
    fn new(instrument: InstrumentConfig, config: &DriverConfig) -> Self {
        let profile = create_profile(instrument.kind);
        let framer = Framer::new(profile.framing());
        let streaming = StreamingEngine::new(profile.stream_policy(), config.poll_period());
        let conditioner = profile.rate_config().map(RateConditioner::new);

        Self {
            instrument,
            profile,
            framer,
            queue: CommandQueue::new(config.queue()),
            streaming,
            conditioner,
            transport: None,
            close_requested: false,
            cycling: false,
            reconnecting: false,
            cycle_at: None,
            reopen_at: None,
            stale_at: None,
        }
    }

    fn is_open(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|t| t.handle.is_open())
    }

    fn write(&self, bytes: Vec<u8>, address: Option<Address>) {
        match &self.transport {
            Some(t) => {
                t.handle.write(bytes, address);
            }
            None => debug!("No transport, dropping {} byte write", bytes.len()),
        }
    }

    /// Put every releasable queued command on the wire
    fn pump(&mut self) {
        for dispatch in self.queue.dispatch_ready(Instant::now()) {
            if let Expect::Bytes(len) = dispatch.expect {
                self.discard_unsolicited();
                self.framer.expect(len);
            }
            self.write(dispatch.bytes, dispatch.address);
        }
    }

    fn discard_unsolicited(&mut self) {
        let junk = self.framer.take_unsolicited();
        if !junk.is_empty() {
            debug!(
                "Discarding {} unsolicited bytes: {:02X?}",
                junk.len(),
                preview(&junk)
            );
        }
        while let Some(frame) = self.framer.next_frame() {
            debug!("Discarding unsolicited frame: {:02X?}", preview(&frame));
        }
    }

    /// Frame and decode inbound bytes
    fn receive(&mut self, inbound: &Inbound) -> Vec<Decoded> {
        self.framer.push_bytes(&inbound.data);
        let mut decoded = Vec::new();

        match self.profile.duplex() {
            Duplex::Full => {
                while let Some(frame) = self.framer.next_frame() {
                    match self.profile.decode(&frame, None) {
                        Ok(items) => decoded.extend(items),
                        Err(e) => warn!(
                            "Dropping undecodable frame from {}: {} ({:02X?})",
                            self.instrument.id,
                            e,
                            preview(&frame)
                        ),
                    }
                }
            }
            Duplex::Half => loop {
                if self.queue.head().is_none() {
                    self.discard_unsolicited();
                    break;
                }
                let Some(frame) = self.framer.next_frame() else {
                    break;
                };
                let Some(cmd) = self.queue.complete() else {
                    break;
                };
                match self.profile.decode(&frame, Some(cmd.sent())) {
                    Ok(items) => decoded.extend(items),
                    Err(e) => warn!(
                        "Dropping undecodable reply to {:?}: {} ({:02X?})",
                        cmd.request,
                        e,
                        preview(&frame)
                    ),
                }
                self.pump();
            },
        }
        decoded
    }

    fn on_timeout(&mut self) {
        match self.queue.expire(Instant::now()) {
            Some(Expired::Dropped(cmd)) => {
                debug!("Giving up on command {} ({:?})", cmd.id, cmd.request);
                self.framer.clear();
                self.pump();
            }
            Some(Expired::Retrying(dispatch)) => {
                self.framer.clear();
                if let Expect::Bytes(len) = dispatch.expect {
                    self.framer.expect(len);
                }
                self.write(dispatch.bytes, dispatch.address);
            }
            None => {}
        }
    }

    /// Forget per-connection state after the link went away
    fn reset_link_state(&mut self) {
        self.queue.clear();
        self.framer.clear();
        self.cycle_at = None;
        self.stale_at = None;
        self.profile.reset();
        if let Some(conditioner) = self.conditioner.as_mut() {
            conditioner.reset();
        }
    }
}

enum Step {
    Command(Option<DriverCommand>),
    Transport(Option<TransportEvent>),
    Timeout,
    Poll(Request),
    Cycle,
    Reopen,
    Stale,
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn recv_transport(transport: &mut Option<Transport>) -> Option<TransportEvent> {
    match transport {
        Some(t) => t.events.recv().await,
        None => future::pending().await,
    }
}

struct Driver {
    registry: Arc<dyn InstrumentRegistry>,
    connector: Arc<dyn Connector>,
    config: DriverConfig,
    event_tx: mpsc::Sender<DriverEvent>,
    snapshot_tx: watch::Sender<DriverSnapshot>,
    outbox: Vec<DriverEvent>,
    state: ConnectionState,
    recording: bool,
    session: Option<Session>,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<DriverCommand>) {
        info!("Driver started");

        loop {
            let step = match self.session.as_mut() {
                None => Step::Command(cmd_rx.recv().await),
                Some(session) => tokio::select! {
                    cmd = cmd_rx.recv() => Step::Command(cmd),
                    event = recv_transport(&mut session.transport) => Step::Transport(event),
                    _ = sleep_opt(session.queue.deadline()) => Step::Timeout,
                    read = session.streaming.tick() => Step::Poll(read),
                    _ = sleep_opt(session.cycle_at) => Step::Cycle,
                    _ = sleep_opt(session.reopen_at) => Step::Reopen,
                    _ = sleep_opt(session.stale_at) => Step::Stale,
                },
            };

            let keep_running = match step {
                Step::Command(Some(cmd)) => self.handle_command(cmd),
                Step::Command(None) => false,
                Step::Transport(event) => {
                    self.handle_transport_event(event);
                    true
                }
                Step::Timeout => {
                    if let Some(session) = self.session.as_mut() {
                        session.on_timeout();
                    }
                    true
                }
                Step::Poll(read) => {
                    if self.session.as_ref().is_some_and(Session::is_open) {
                        self.output(read);
                    }
                    true
                }
                Step::Cycle => {
                    self.cycle();
                    true
                }
                Step::Reopen => {
                    self.reopen();
                    true
                }
                Step::Stale => {
                    self.publish_stale_rate();
                    true
                }
            };

            self.flush().await;
            self.publish_snapshot();

            if !keep_running {
                break;
            }
        }

        if let Some(transport) = self.session.take().and_then(|s| s.transport) {
            transport.handle.close();
        }
        info!("Driver stopped");
    }

    fn handle_command(&mut self, cmd: DriverCommand) -> bool {
        match cmd {
            DriverCommand::Open(id) => self.open(&id),
            DriverCommand::Close => self.close(),
            DriverCommand::StartStream(period) => self.start_stream(period),
            DriverCommand::StopStream => self.stop_stream(),
            DriverCommand::SendUniqueId => self.send_unique_id(),
            DriverCommand::Output(request) => self.output(request),
            DriverCommand::SetRecording(recording) => {
                self.recording = recording;
                let portopen = self.session.as_ref().is_some_and(Session::is_open);
                self.outbox.push(DriverEvent::Status(DriverStatus {
                    portopen,
                    recording: Some(recording),
                }));
            }
            DriverCommand::Sync(reply) => {
                let _ = reply.send(self.snapshot());
            }
            DriverCommand::Shutdown => {
                info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    fn data(&mut self, reading: Reading) {
        self.outbox.push(DriverEvent::Data(NormalizedEvent::now(reading)));
    }

    fn open(&mut self, id: &str) {
        if let Some(session) = &self.session {
            if session.transport.is_some() {
                warn!(
                    "{} is already open, ignoring open of {}",
                    session.instrument.id, id
                );
                return;
            }
        }
        self.session = None;

        let Some(instrument) = self.registry.lookup(id) else {
            warn!("No instrument registered as {}", id);
            self.data(Reading::OpenError {
                reason: "Unknown instrument".to_string(),
                description: Some(id.to_string()),
            });
            self.state = ConnectionState::Error;
            return;
        };

        info!(
            "Opening {} ({}) on {}",
            instrument.id,
            instrument.kind.name(),
            instrument.endpoint
        );
        let mut session = Session::new(instrument, &self.config);
        session.transport = Some(open_transport(
            &self.connector,
            &session.instrument.endpoint,
            self.config.event_buffer,
        ));
        self.session = Some(session);
        self.state = ConnectionState::Opening;
    }

    fn close(&mut self) {
        let Some(session) = self.session.as_mut() else {
            debug!("Close requested with nothing open");
            return;
        };
        if session.close_requested {
            return;
        }

        if let Some(stop) = session.streaming.stop() {
            if session.is_open() {
                match session.profile.encode(&stop) {
                    Ok(out) => session.write(out.bytes, out.address),
                    Err(e) => warn!("Cannot encode {:?}: {}", stop, e),
                }
            }
        }
        session.reset_link_state();
        session.reopen_at = None;
        session.cycling = false;
        session.close_requested = true;

        if let Some(transport) = &session.transport {
            info!("Closing {}", session.instrument.id);
            transport.handle.close();
            self.state = ConnectionState::Closing;
            return;
        }

        // Already disconnected; its closed status went out then
        info!("Closed {}", session.instrument.id);
        self.session = None;
        self.state = ConnectionState::Closed;
    }

    fn finish_close(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Closed {}", session.instrument.id);
        }
        self.outbox.push(DriverEvent::port(false));
        self.state = ConnectionState::Closed;
    }

    fn start_stream(&mut self, period: Option<Duration>) {
        let Some(session) = self.session.as_mut() else {
            warn!("Cannot stream with nothing open");
            return;
        };
        if let Some(request) = session.streaming.start(period) {
            self.output(request);
        }
    }

    fn stop_stream(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(request) = session.streaming.stop() {
            self.output(request);
        }
    }

    fn send_unique_id(&mut self) {
        let Some(session) = self.session.as_mut() else {
            warn!("Cannot read unique id with nothing open");
            return;
        };
        match session.profile.unique_id() {
            UniqueIdSource::Immediate(id) => self.data(Reading::UniqueId { id }),
            UniqueIdSource::Query(request) => self.output(request),
            UniqueIdSource::Unsupported => {
                debug!("{} has no unique id", session.instrument.kind.name())
            }
        }
    }

    fn output(&mut self, request: Request) {
        let Some(session) = self.session.as_mut() else {
            warn!("Nothing open, dropping {:?}", request);
            return;
        };

        if let Some(reading) = session.profile.answer_locally(&request) {
            self.data(reading);
            return;
        }
        if self.state != ConnectionState::Open || session.close_requested || !session.is_open() {
            debug!("Port not open, dropping {:?}", request);
            return;
        }

        let outbound = match session.profile.encode(&request) {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!("Cannot send {:?}: {}", request, e);
                return;
            }
        };

        match session.profile.duplex() {
            Duplex::Half => {
                if session.queue.enqueue(request, outbound).is_some() {
                    session.pump();
                }
            }
            Duplex::Full => session.write(outbound.bytes, outbound.address),
        }
    }

    fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Data(inbound)) => self.on_data(inbound),
            Some(TransportEvent::Status(status)) if status.portopen => self.on_opened(),
            Some(TransportEvent::Status(status)) if status.openerror => self.on_open_failed(status),
            Some(TransportEvent::Status(_)) | None => self.on_closed(),
        }
    }

    fn on_opened(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.close_requested {
            debug!("Ignoring open of {} during close", session.instrument.id);
            return;
        }

        let cycled = std::mem::take(&mut session.cycling);
        session.reconnecting = false;
        self.state = ConnectionState::Open;
        if !cycled {
            info!("{} open", session.instrument.id);
            self.outbox.push(DriverEvent::port(true));
        }

        for action in session.profile.on_open() {
            match action {
                OpenAction::Write(out) => session.write(out.bytes, out.address),
                OpenAction::Subscribe(address) => {
                    if let Some(transport) = &session.transport {
                        transport.handle.subscribe(address);
                    }
                }
                OpenAction::CycleAfter(delay) => {
                    session.cycle_at = Some(Instant::now() + delay);
                }
            }
        }

        // Streaming requested before the port opened, or before a reconnect
        if !cycled && session.streaming.is_streaming() {
            if let StreamPolicy::ActivePush {
                start: Some(request),
                ..
            } = session.profile.stream_policy()
            {
                self.output(request);
            }
        }
    }

    fn on_open_failed(&mut self, status: TransportStatus) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.transport = None;

        if session.close_requested {
            self.finish_close();
            return;
        }
        if session.reconnecting {
            if let Some(delay) = self.config.reconnect_delay() {
                warn!(
                    "Reconnect to {} failed, retrying in {:?}",
                    session.instrument.id, delay
                );
                session.reopen_at = Some(Instant::now() + delay);
                return;
            }
        }

        warn!(
            "Failed to open {}: {}",
            session.instrument.id,
            status.description.as_deref().unwrap_or("unknown error")
        );
        self.session = None;
        self.state = ConnectionState::Error;
        self.data(Reading::OpenError {
            reason: status
                .reason
                .unwrap_or_else(|| "Port open error".to_string()),
            description: status.description,
        });
    }

    fn on_closed(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.transport = None;

        if session.close_requested {
            self.finish_close();
            return;
        }
        if session.cycling {
            debug!("Reopening {} to finish initialization", session.instrument.id);
            session.transport = Some(open_transport(
                &self.connector,
                &session.instrument.endpoint,
                self.config.event_buffer,
            ));
            return;
        }

        info!("{} disconnected", session.instrument.id);
        session.reset_link_state();
        self.outbox.push(DriverEvent::port(false));
        self.state = ConnectionState::Closed;

        if let Some(delay) = self.config.reconnect_delay() {
            info!("Reconnecting to {} in {:?}", session.instrument.id, delay);
            session.reconnecting = true;
            session.reopen_at = Some(Instant::now() + delay);
        }
    }

    fn on_data(&mut self, inbound: Inbound) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.close_requested {
            return;
        }

        for item in session.receive(&inbound) {
            self.handle_decoded(item);
        }
    }

    fn handle_decoded(&mut self, item: Decoded) {
        match item {
            Decoded::Reading(reading) => self.data(reading),
            Decoded::Reply(request) => self.output(request),
            Decoded::Counts(count) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let Some(conditioner) = session.conditioner.as_mut() else {
                    debug!("Ignoring counts from {}", session.instrument.kind.name());
                    return;
                };
                let now = Instant::now();
                let estimate = conditioner.push_at(count, now);
                session.stale_at = Some(now + conditioner.config().stale_after());
                self.data(Reading::rate(estimate.value, estimate.valid));
            }
        }
    }

    fn cycle(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.cycle_at = None;
        let Some(transport) = &session.transport else {
            return;
        };
        debug!("Cycling {} after initialization", session.instrument.id);
        session.cycling = true;
        session.framer.clear();
        transport.handle.close();
    }

    fn reopen(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.reopen_at = None;
        if session.transport.is_some() {
            return;
        }
        info!("Reopening {}", session.instrument.id);
        session.transport = Some(open_transport(
            &self.connector,
            &session.instrument.endpoint,
            self.config.event_buffer,
        ));
        self.state = ConnectionState::Opening;
    }

    fn publish_stale_rate(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stale_at = None;
        let Some(conditioner) = &session.conditioner else {
            return;
        };
        // Fires only after a full allowance without samples
        let estimate = conditioner.estimate_at(Instant::now());
        debug!("No counts from {} in {:?}", session.instrument.id, conditioner.config().stale_after());
        self.data(Reading::rate(estimate.value, false));
    }

    async fn flush(&mut self) {
        for event in std::mem::take(&mut self.outbox) {
            if self.event_tx.send(event).await.is_err() {
                debug!("No event listener");
                break;
            }
        }
    }

    fn snapshot(&self) -> DriverSnapshot {
        DriverSnapshot {
            state: self.state,
            streaming: self
                .session
                .as_ref()
                .is_some_and(|s| s.streaming.is_streaming()),
            recording: self.recording,
            instrument: self.session.as_ref().map(|s| s.instrument.id.clone()),
            kind: self.session.as_ref().map(|s| s.instrument.kind),
            queued: self.session.as_ref().map_or(0, |s| s.queue.len()),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}
