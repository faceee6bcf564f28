use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::cli::Protocol;
use crate::metrics::MetricsCollector;
use crate::shutdown::Shutdown;

pub mod coap;
pub mod mqtt_sn;
pub mod tcp;

pub use coap::CoapTransport;
pub use mqtt_sn::MqttSnTransport;
pub use tcp::TcpTransport;

/// Largest datagram a UDP receiver accepts
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Per-message send failure
///
/// These are expected under emulated loss and are swallowed by the sender
/// loop; they never abort a trial.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Timed out waiting for the peer")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Transport not connected")]
    NotConnected,
}

/// Host and port a transport connects to or binds on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first matching socket address
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.host, self.port);
        let addr = tokio::net::lookup_host(&target)
            .await
            .with_context(|| format!("Failed to resolve {}", target))?
            .next()
            .ok_or_else(|| anyhow!("No address found for {}", target));
        addr
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Two-role messaging capability implemented once per protocol
///
/// Sender side: `connect` then `send` per envelope. Receiver side: `bind`
/// then `serve` until the shutdown signal fires, feeding every payload into
/// the collector. A transport instance plays exactly one role.
#[async_trait]
pub trait Transport: Send {
    /// Establish whatever session the protocol needs to reach `endpoint`
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()>;

    /// Send one payload; `sequence` feeds protocol-level message ids
    async fn send(&mut self, sequence: u64, payload: &[u8]) -> Result<(), TransportError>;

    /// Bind the receiving socket on `endpoint`
    async fn bind(&mut self, endpoint: &Endpoint) -> Result<()>;

    /// Receive until `shutdown` fires
    async fn serve(&mut self, collector: Arc<MetricsCollector>, shutdown: Shutdown) -> Result<()>;

    /// Release sockets
    async fn close(&mut self) -> Result<()>;

    /// Get transport name for identification
    fn name(&self) -> &'static str;

    /// Address actually bound by `bind` (useful with port 0)
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Transport factory for creating protocol transport instances
pub struct TransportFactory;

impl TransportFactory {
    /// Create a new transport instance for the protocol
    pub fn create(protocol: Protocol) -> Result<Box<dyn Transport>> {
        match protocol {
            Protocol::Tcp => Ok(Box::new(TcpTransport::new())),
            Protocol::MqttSn => Ok(Box::new(MqttSnTransport::new())),
            Protocol::CoapCon => Ok(Box::new(CoapTransport::confirmable())),
            Protocol::CoapNon => Ok(Box::new(CoapTransport::non_confirmable())),
            Protocol::All => Err(anyhow!(
                "'All' protocol should be expanded before transport creation"
            )),
        }
    }
}

/// Create a UDP socket bound with SO_REUSEADDR
pub(crate) fn bind_udp(addr: SocketAddr) -> Result<tokio::net::UdpSocket> {
    use socket2::{Domain, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind UDP socket on {}", addr))?;
    Ok(tokio::net::UdpSocket::from_std(socket.into())?)
}

/// Create a TCP listener bound with SO_REUSEADDR
pub(crate) fn bind_tcp(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    use socket2::{Domain, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind TCP listener on {}", addr))?;
    socket.listen(1024)?;
    Ok(tokio::net::TcpListener::from_std(socket.into())?)
}

/// Unspecified local address of the same family as `peer`
pub(crate) fn any_local_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
