//! Serial port enumeration

use serde::Serialize;
use serialport::{available_ports, SerialPortType};
use tracing::info;

use super::Endpoint;
use crate::error::TransportError;

/// Ports that never host an instrument (macOS Bluetooth, debug consoles)
const SKIP_PATTERNS: &[&str] = &["Bluetooth", "debug"];

/// Information about a serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialPortInfo {
    /// Port name (e.g., /dev/ttyUSB0, COM3)
    pub port: String,
    /// USB Vendor ID (if USB)
    pub vid: Option<u16>,
    /// USB Product ID (if USB)
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialPortInfo {
    fn from_serialport(name: String, port_type: &SerialPortType) -> Self {
        match port_type {
            SerialPortType::UsbPort(usb) => Self {
                port: name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number.clone(),
                manufacturer: usb.manufacturer.clone(),
                product: usb.product.clone(),
            },
            _ => Self {
                port: name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        }
    }

    /// Endpoint for opening this port at the given speed
    pub fn endpoint(&self, baud_rate: u32) -> Endpoint {
        Endpoint::Serial {
            path: self.port.clone(),
            baud_rate,
            dtr: false,
        }
    }

    fn should_skip(&self) -> bool {
        SKIP_PATTERNS.iter().any(|p| self.port.contains(p))
    }
}

/// Enumerate serial ports that could host an instrument
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, TransportError> {
    let ports = available_ports().map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

    let result: Vec<_> = ports
        .into_iter()
        .map(|p| SerialPortInfo::from_serialport(p.port_name, &p.port_type))
        .filter(|p| !p.should_skip())
        .collect();

    info!("Found {} serial port(s)", result.len());
    Ok(result)
}
