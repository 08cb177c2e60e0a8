//! Byte-stream links: serial ports, TCP sockets and in-memory duplex pipes

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use inst_protocol::Address;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::{preview, Inbound, Link};
use crate::error::TransportError;

const READ_BUFFER_LEN: usize = 1024;

/// A link over anything that reads and writes bytes
///
/// Generic over the I/O type; for virtual instruments use `DuplexStream`
/// from `tokio::io::duplex()`.
pub struct StreamLink<T> {
    name: String,
    io: T,
    buffer: Vec<u8>,
}

impl<T> StreamLink<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(name: impl Into<String>, io: T) -> Self {
        Self {
            name: name.into(),
            io,
            buffer: vec![0u8; READ_BUFFER_LEN],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Open a serial port, optionally asserting DTR
pub fn open_serial(
    path: &str,
    baud_rate: u32,
    dtr: bool,
) -> Result<StreamLink<SerialStream>, TransportError> {
    let mut stream = tokio_serial::new(path, baud_rate)
        .timeout(Duration::from_millis(100))
        .open_native_async()?;

    if dtr {
        if let Err(e) = stream.write_data_terminal_ready(true) {
            warn!("Failed to assert DTR on {}: {}", path, e);
        }
    }

    info!("Opened serial port {} at {} baud", path, baud_rate);
    Ok(StreamLink::new(path, stream))
}

/// Connect to a TCP endpoint
pub async fn connect_tcp(host: &str, port: u16) -> Result<StreamLink<TcpStream>, TransportError> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    info!("Connected to {}:{}", host, port);
    Ok(StreamLink::new(format!("{}:{}", host, port), stream))
}

#[async_trait]
impl<T> Link for StreamLink<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self) -> io::Result<Option<Inbound>> {
        let n = self.io.read(&mut self.buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        let data = &self.buffer[..n];
        debug!("Read {} bytes from {}: {:02X?}", n, self.name, preview(data));
        Ok(Some(Inbound::bytes(data)))
    }

    async fn write(&mut self, data: &[u8], _address: Option<&Address>) -> io::Result<()> {
        debug!("Writing {} bytes to {}: {:02X?}", data.len(), self.name, preview(data));
        self.io.write_all(data).await?;
        self.io.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        debug!("Closing {}", self.name);
        self.io.shutdown().await
    }
}
