//! Physical transports for the device link
//!
//! A transport only knows how to open a byte stream; framing, correlation
//! and reconnection live in [`super::DeviceLink`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::{debug, info, warn};

use crate::error::LinkError;

/// Endpoint value that triggers USB auto-detection
pub const AUTO_ENDPOINT: &str = "AUTO";

/// Known USB vendor/product ids (Arduino LLC, Arduino.org, CH340 clones)
const KNOWN_DEVICES: &[(u16, Option<u16>)] = &[
    (0x2341, None),
    (0x2A03, None),
    (0x1A86, Some(0x7523)),
];

/// Byte stream usable as a link
pub trait LinkIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> LinkIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedIo = Box<dyn LinkIo>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Human readable endpoint for logs
    fn endpoint(&self) -> String;

    /// Open a fresh connection
    async fn open(&self) -> Result<BoxedIo, LinkError>;
}

/// Build the transport matching an endpoint string
///
/// `tcp://host:port` selects a serial-over-TCP bridge, anything else is a
/// serial port path or `AUTO`.
pub fn transport_for_endpoint(endpoint: &str, baud_rate: u32) -> Arc<dyn Transport> {
    match endpoint.strip_prefix("tcp://") {
        Some(addr) => Arc::new(TcpTransport::new(addr)),
        None => Arc::new(SerialTransport::new(endpoint, baud_rate)),
    }
}

// ============================================================================
// Serial
// ============================================================================

/// Serial transport, 8N1 without flow control
#[derive(Debug, Clone)]
pub struct SerialTransport {
    port: String,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }

    fn resolve_port(&self) -> Result<String, LinkError> {
        if self.port.eq_ignore_ascii_case(AUTO_ENDPOINT) {
            detect_serial_port()
        } else {
            Ok(self.port.clone())
        }
    }
}

/// Whether a USB id pair belongs to a supported controller board
pub fn is_known_device(vid: u16, pid: u16) -> bool {
    KNOWN_DEVICES
        .iter()
        .any(|(v, p)| *v == vid && p.map_or(true, |p| p == pid))
}

/// Pick the first serial port backed by a known USB device
pub fn detect_serial_port() -> Result<String, LinkError> {
    let ports = tokio_serial::available_ports().map_err(|e| LinkError::Open {
        endpoint: AUTO_ENDPOINT.to_string(),
        reason: e.to_string(),
    })?;

    for port in ports {
        if let SerialPortType::UsbPort(usb) = &port.port_type {
            if is_known_device(usb.vid, usb.pid) {
                info!(
                    "Device detected at {} ({:04X}:{:04X})",
                    port.port_name, usb.vid, usb.pid
                );
                return Ok(port.port_name);
            }
            debug!(
                "Skipping {} ({:04X}:{:04X})",
                port.port_name, usb.vid, usb.pid
            );
        }
    }

    warn!("No known device on any serial port");
    Err(LinkError::NoDevice)
}

#[async_trait]
impl Transport for SerialTransport {
    fn endpoint(&self) -> String {
        format!("{}@{}", self.port, self.baud_rate)
    }

    async fn open(&self) -> Result<BoxedIo, LinkError> {
        let path = self.resolve_port()?;
        debug!("Opening serial port: {}", path);

        #[allow(unused_mut)]
        let mut port = tokio_serial::new(&path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| LinkError::Open {
                endpoint: path.clone(),
                reason: e.to_string(),
            })?;

        #[cfg(unix)]
        port.set_exclusive(false).map_err(|e| LinkError::Open {
            endpoint: path.clone(),
            reason: format!("Failed to set exclusive mode: {e}"),
        })?;

        info!("Opened serial port: {} @ {} baud", path, self.baud_rate);
        Ok(Box::new(port))
    }
}

// ============================================================================
// TCP serial bridge
// ============================================================================

#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn open(&self) -> Result<BoxedIo, LinkError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| LinkError::Open {
                endpoint: self.endpoint(),
                reason: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        info!("Connected to serial bridge {}", self.addr);
        Ok(Box::new(stream))
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-process transport; every `open` hands the peer half to a [`MemoryPeer`]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<DuplexStream>,
    available: AtomicBool,
    opens: AtomicU64,
    buffer: usize,
}

/// Device side of a [`MemoryTransport`]
pub struct MemoryPeer {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, MemoryPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            peers: tx,
            available: AtomicBool::new(true),
            opens: AtomicU64::new(0),
            buffer: 4096,
        });
        (transport, MemoryPeer { rx })
    }

    /// When unavailable, `open` fails as if the port were missing
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful opens so far
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    async fn open(&self) -> Result<BoxedIo, LinkError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(LinkError::Open {
                endpoint: self.endpoint(),
                reason: "device unavailable".to_string(),
            });
        }
        let (local, remote) = tokio::io::duplex(self.buffer);
        self.peers.send(remote).map_err(|_| LinkError::Open {
            endpoint: self.endpoint(),
            reason: "peer dropped".to_string(),
        })?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(local))
    }
}

impl MemoryPeer {
    /// Wait for the link to open the next connection
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_known_devices() {
        assert!(is_known_device(0x2341, 0x0043));
        assert!(is_known_device(0x2A03, 0x1234));
        assert!(is_known_device(0x1A86, 0x7523));
        assert!(!is_known_device(0x1A86, 0x5523));
        assert!(!is_known_device(0x0403, 0x6001));
    }

    #[test]
    fn test_endpoint_selection() {
        assert_eq!(
            transport_for_endpoint("tcp://10.0.0.5:4001", 115200).endpoint(),
            "tcp://10.0.0.5:4001"
        );
        assert_eq!(
            transport_for_endpoint("/dev/ttyACM0", 9600).endpoint(),
            "/dev/ttyACM0@9600"
        );
    }

    #[tokio::test]
    async fn test_memory_transport_pairs_streams() {
        let (transport, mut peer) = MemoryTransport::new();
        let mut local = transport.open().await.unwrap();
        let mut remote = peer.accept().await.unwrap();

        local.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING\n");
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_transport_unavailable() {
        let (transport, _peer) = MemoryTransport::new();
        transport.set_available(false);
        assert!(matches!(
            transport.open().await,
            Err(LinkError::Open { .. })
        ));
    }
}
