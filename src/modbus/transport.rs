use async_trait::async_trait;
use log::{debug, error, info};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::utils::error::ModbusError;

/// Identifies one Modbus TCP slave. Immutable once a session is created;
/// pointing at a different device means creating a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One request/response exchange channel to a Modbus device.
///
/// Modbus TCP carries exactly one request in flight per connection, so the
/// transport surface is a single `exchange` call rather than split send/recv.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Writes a full MBAP frame and reads back the complete response frame.
    async fn exchange(
        &mut self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ModbusError>;

    /// False once an exchange has failed at the socket level; the session
    /// reconnects before reusing the handle.
    fn is_healthy(&self) -> bool;
}

/// Opens transports for a session. A trait seam so tests can substitute
/// in-memory stubs for real sockets.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<Box<dyn ModbusTransport>, ModbusError>;
}

/// Default connector dialing a real TCP socket.
pub struct TcpConnector;

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<Box<dyn ModbusTransport>, ModbusError> {
        info!("🔌 Connecting to Modbus device at {}", address);

        let target = format!("{}:{}", address.host, address.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| {
                error!("❌ Connection to {} timed out", target);
                ModbusError::Connection(format!("connection to {} timed out", target))
            })?
            .map_err(|e| {
                error!("❌ Failed to connect to {}: {}", target, e);
                ModbusError::Connection(format!("failed to connect to {}: {}", target, e))
            })?;

        // Request/response traffic, so coalescing hurts latency
        let _ = stream.set_nodelay(true);

        info!("✅ Connected to Modbus device at {}", target);
        Ok(Box::new(TcpTransport {
            stream,
            healthy: true,
        }))
    }
}

pub struct TcpTransport {
    stream: TcpStream,
    healthy: bool,
}

impl TcpTransport {
    async fn exchange_inner(&mut self, request: &[u8]) -> Result<Vec<u8>, ModbusError> {
        self.stream
            .write_all(request)
            .await
            .map_err(|e| ModbusError::Transport(format!("write failed: {}", e)))?;

        let mut header = [0u8; 7];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| ModbusError::Transport(format!("read failed: {}", e)))?;

        // MBAP length counts the unit id byte already consumed with the header
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length == 0 || length > 254 {
            return Err(ModbusError::Frame(format!("invalid MBAP length: {}", length)));
        }

        let mut body = vec![0u8; length - 1];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| ModbusError::Transport(format!("read failed: {}", e)))?;

        let mut frame = header.to_vec();
        frame.extend_from_slice(&body);
        debug!("📥 Received frame: {}", hex::encode(&frame));
        Ok(frame)
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn exchange(
        &mut self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ModbusError> {
        debug!("📤 Sending frame: {}", hex::encode(request));

        match tokio::time::timeout(timeout, self.exchange_inner(request)).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => {
                self.healthy = false;
                Err(e)
            }
            Err(_) => {
                self.healthy = false;
                Err(ModbusError::Timeout)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}
