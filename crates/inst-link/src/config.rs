//! Driver configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::QueueConfig;

/// Tuning for one driver
///
/// Durations are stored as milliseconds so the settings file stays
/// readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Half-duplex reply timeout
    pub response_timeout_ms: u64,
    /// Poll period used when `start_live_stream` is given none
    pub poll_period_ms: u64,
    /// Commands held by the half-duplex queue
    pub queue_capacity: usize,
    /// Reissue a timed-out query once
    pub retry_queries: bool,
    /// Reopen after an unexpected disconnect
    pub reconnect_delay_ms: Option<u64>,
    /// Capacity of the published event channel
    pub event_buffer: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 500,
            poll_period_ms: 1000,
            queue_capacity: 64,
            retry_queries: false,
            reconnect_delay_ms: None,
            event_buffer: 256,
        }
    }
}

impl DriverConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_delay_ms.map(Duration::from_millis)
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            response_timeout: self.response_timeout(),
            capacity: self.queue_capacity.max(1),
            retry_queries: self.retry_queries,
        }
    }
}
