//! Error types for the link layer

use std::io;

use thiserror::Error;

/// Errors that can occur while opening or driving a transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// No device answers at the endpoint
    #[error("device not found: {0}")]
    NotFound(String),

    /// The medium is not available in this build or host
    #[error("unsupported transport: {0}")]
    Unsupported(String),

    /// Failed to enumerate serial ports
    #[error("failed to enumerate ports: {0}")]
    EnumerationFailed(String),

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Short reason reported in open-error events
    pub fn reason(&self) -> &'static str {
        match self {
            TransportError::NotFound(_) => "Device not found",
            TransportError::Io(e) if e.kind() == io::ErrorKind::NotFound => "Device not found",
            TransportError::Serial(e) if e.kind == serialport::ErrorKind::NoDevice => {
                "Device not found"
            }
            TransportError::Unsupported(_) => "Unsupported transport",
            TransportError::EnumerationFailed(_) => "Enumeration failed",
            TransportError::Serial(_) | TransportError::Io(_) => "Port open error",
        }
    }
}

/// Errors returned by [`DriverHandle`](crate::DriverHandle) calls
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The driver task is no longer running
    #[error("driver task has stopped")]
    Stopped,
}
