//! Half-duplex command queue
//!
//! Instruments like the FT-817 answer without echoing the command, so a
//! reply can only be matched to a request by position. The queue keeps
//! at most one response-awaiting command on the wire and holds the rest
//! back until that command completes or times out.
//!
//! Fire-and-forget commands queued behind the in-flight one are released
//! in order as soon as the slot frees up; they never occupy it.

use std::collections::VecDeque;
use std::time::Duration;

use inst_protocol::{Address, Expect, Outbound, Request, Sent};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Queue tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long the in-flight command may wait for its reply
    pub response_timeout: Duration,
    /// Commands held at once, including the in-flight one
    pub capacity: usize,
    /// Reissue a timed-out query once before dropping it
    pub retry_queries: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(500),
            capacity: 64,
            retry_queries: false,
        }
    }
}

/// A command waiting for, or occupying, the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub id: u64,
    pub request: Request,
    pub outbound: Outbound,
    issued_at: Option<Instant>,
    retried: bool,
}

impl PendingCommand {
    /// View for decoding a reply against this command
    pub fn sent(&self) -> Sent<'_> {
        Sent {
            request: &self.request,
            outbound: &self.outbound,
        }
    }

    /// When the command last went on the wire
    pub fn issued_at(&self) -> Option<Instant> {
        self.issued_at
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch {
            id: self.id,
            bytes: self.outbound.bytes.clone(),
            address: self.outbound.address,
            expect: self.outbound.expect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    AwaitingResponse,
}

/// A write the caller must put on the wire now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub id: u64,
    pub bytes: Vec<u8>,
    pub address: Option<Address>,
    pub expect: Expect,
}

/// Outcome of a response timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expired {
    /// The command was abandoned
    Dropped(PendingCommand),
    /// The command was reissued and is in flight again
    Retrying(Dispatch),
}

/// FIFO of commands for one half-duplex link
#[derive(Debug)]
pub struct CommandQueue {
    config: QueueConfig,
    pending: VecDeque<PendingCommand>,
    next_id: u64,
    deadline: Option<Instant>,
}

impl CommandQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            next_id: 1,
            deadline: None,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a command; returns its id, or `None` if the queue is full
    pub fn enqueue(&mut self, request: Request, outbound: Outbound) -> Option<u64> {
        if self.pending.len() >= self.config.capacity {
            warn!(
                "Command queue full ({} entries), dropping {:?}",
                self.pending.len(),
                request
            );
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back(PendingCommand {
            id,
            request,
            outbound,
            issued_at: None,
            retried: false,
        });
        Some(id)
    }

    /// Release every command that may go on the wire now
    ///
    /// Stops after the first response-awaiting command, which stays at
    /// the head until [`complete`](Self::complete) or
    /// [`expire`](Self::expire).
    pub fn dispatch_ready(&mut self, now: Instant) -> Vec<Dispatch> {
        let mut out = Vec::new();
        if self.deadline.is_some() {
            return out;
        }

        while let Some(head) = self.pending.front_mut() {
            if head.outbound.expect.awaits_response() {
                head.issued_at = Some(now);
                self.deadline = Some(now + self.config.response_timeout);
                out.push(head.dispatch());
                break;
            }
            if let Some(cmd) = self.pending.pop_front() {
                out.push(cmd.dispatch());
            }
        }
        out
    }

    /// The command whose reply is awaited
    pub fn head(&self) -> Option<&PendingCommand> {
        self.deadline.and(self.pending.front())
    }

    /// Retire the in-flight command after its reply arrived
    pub fn complete(&mut self) -> Option<PendingCommand> {
        self.deadline.take()?;
        self.pending.pop_front()
    }

    /// Handle the response deadline passing
    ///
    /// Returns `None` if nothing is in flight or the deadline is still
    /// ahead.
    pub fn expire(&mut self, now: Instant) -> Option<Expired> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }

        let retry = self.config.retry_queries;
        let timeout = self.config.response_timeout;
        if let Some(head) = self.pending.front_mut() {
            if retry && !head.retried && head.request.is_query() {
                head.retried = true;
                head.issued_at = Some(now);
                self.deadline = Some(now + timeout);
                debug!("Retrying {:?} after timeout", head.request);
                return Some(Expired::Retrying(head.dispatch()));
            }
        }

        self.deadline = None;
        let cmd = self.pending.pop_front()?;
        warn!("No reply to {:?} within {:?}", cmd.request, timeout);
        Some(Expired::Dropped(cmd))
    }

    /// When the in-flight command times out
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn state(&self) -> QueueState {
        if self.deadline.is_some() {
            QueueState::AwaitingResponse
        } else {
            QueueState::Idle
        }
    }

    /// Forget every command, including the in-flight one
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} queued command(s)", self.pending.len());
        }
        self.pending.clear();
        self.deadline = None;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
