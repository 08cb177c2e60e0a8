//! Continuous reading control
//!
//! Starting and stopping a live stream is idempotent. What "start" means
//! depends on the instrument's [`StreamPolicy`]: push instruments get a
//! single start request, poll instruments get a periodic read request.

use std::future;
use std::time::Duration;

use inst_protocol::{Request, StreamPolicy};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Streaming state for one session
#[derive(Debug)]
pub struct StreamingEngine {
    policy: StreamPolicy,
    default_period: Duration,
    streaming: bool,
    poller: Option<Interval>,
}

impl StreamingEngine {
    pub fn new(policy: StreamPolicy, default_period: Duration) -> Self {
        Self {
            policy,
            default_period,
            streaming: false,
            poller: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Begin streaming; returns a request to send right away, if any
    ///
    /// A no-op while already streaming. `period` only matters for
    /// poll-driven instruments and falls back to the configured default.
    pub fn start(&mut self, period: Option<Duration>) -> Option<Request> {
        if self.streaming {
            debug!("Stream already running");
            return None;
        }
        self.streaming = true;

        match &self.policy {
            StreamPolicy::ActivePush { start, .. } => start.clone(),
            StreamPolicy::PollDriven { .. } => {
                let period = period
                    .filter(|p| !p.is_zero())
                    .unwrap_or(self.default_period);
                let mut poller = interval_at(Instant::now() + period, period);
                poller.set_missed_tick_behavior(MissedTickBehavior::Skip);
                self.poller = Some(poller);
                debug!("Polling every {:?}", period);
                None
            }
        }
    }

    /// Stop streaming; returns a request to send right away, if any
    pub fn stop(&mut self) -> Option<Request> {
        if !self.streaming {
            return None;
        }
        self.streaming = false;
        self.poller = None;

        match &self.policy {
            StreamPolicy::ActivePush { stop, .. } => stop.clone(),
            StreamPolicy::PollDriven { .. } => None,
        }
    }

    /// Resolve with the read request at each poll tick
    ///
    /// Pending forever when no poller is running.
    pub async fn tick(&mut self) -> Request {
        let read = match &self.policy {
            StreamPolicy::PollDriven { read } => read.clone(),
            StreamPolicy::ActivePush { .. } => return future::pending().await,
        };
        match self.poller.as_mut() {
            Some(poller) => {
                poller.tick().await;
                read
            }
            None => future::pending().await,
        }
    }
}
