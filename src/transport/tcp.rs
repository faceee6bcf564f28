use super::{Endpoint, Transport, TransportError};
use crate::metrics::MetricsCollector;
use crate::shutdown::Shutdown;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefixed frames over a TCP stream
///
/// A broken connection is dropped and re-established lazily on the next
/// send, so a single failure costs one message rather than the trial.
pub struct TcpTransport {
    endpoint: Option<Endpoint>,
    stream: Option<TcpStream>,
    listener: Option<TcpListener>,
    has_warned_timeout: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            endpoint: None,
            stream: None,
            listener: None,
            has_warned_timeout: false,
        }
    }

    async fn open_stream(endpoint: &Endpoint) -> Result<TcpStream> {
        let addr = endpoint.resolve().await?;
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", endpoint))?
            .with_context(|| format!("Failed to connect to {}", endpoint))?;

        // Configure socket options for low latency
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        collector: Arc<MetricsCollector>,
    ) {
        debug!("Handling TCP connection from {}", peer);
        loop {
            match read_frame(&mut stream).await {
                Ok(payload) => {
                    collector.record_payload(&payload);
                }
                Err(e) => {
                    debug!("Connection {} closed: {}", peer, e);
                    break;
                }
            }
        }
    }
}

/// Write one frame: 4-byte little-endian length, then the payload
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| TransportError::Protocol(format!("Frame too large: {} bytes", payload.len())))?;

    let write_fut = async {
        writer.write_all(&len.to_le_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(()) as Result<(), std::io::Error>
    };

    // An unresponsive receiver must not stall the paced send loop
    match timeout(WRITE_TIMEOUT, write_fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TransportError::Io(e)),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Read one frame written by `write_frame`
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > MAX_FRAME_SIZE {
        return Err(anyhow!("Frame too large: {} bytes", frame_len));
    }

    let mut payload = vec![0u8; frame_len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        debug!("TCP sender connecting to {}", endpoint);
        self.stream = Some(Self::open_stream(endpoint).await?);
        self.endpoint = Some(endpoint.clone());
        debug!("TCP sender connected to {}", endpoint);
        Ok(())
    }

    async fn send(&mut self, _sequence: u64, payload: &[u8]) -> Result<(), TransportError> {
        if self.stream.is_none() {
            let endpoint = self.endpoint.as_ref().ok_or(TransportError::NotConnected)?;
            match Self::open_stream(endpoint).await {
                Ok(stream) => {
                    debug!("TCP sender reconnected to {}", endpoint);
                    self.stream = Some(stream);
                }
                Err(e) => {
                    debug!("TCP reconnect to {} failed: {:#}", endpoint, e);
                    return Err(TransportError::NotConnected);
                }
            }
        }

        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        match write_frame(stream, payload).await {
            Ok(()) => Ok(()),
            Err(TransportError::Timeout) => {
                if !self.has_warned_timeout {
                    warn!("TCP send timed out; the receiver is not draining the stream");
                    self.has_warned_timeout = true;
                }
                // A partial frame may be on the wire; the stream is unusable
                self.stream = None;
                Err(TransportError::Timeout)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    async fn bind(&mut self, endpoint: &Endpoint) -> Result<()> {
        let addr = endpoint.resolve().await?;
        let listener = super::bind_tcp(addr)?;
        debug!("TCP receiver listening on {}", listener.local_addr()?);
        self.listener = Some(listener);
        Ok(())
    }

    async fn serve(&mut self, collector: Arc<MetricsCollector>, mut shutdown: Shutdown) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow!("TCP receiver is not bound"))?;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        connections.spawn(Self::handle_connection(stream, peer, collector.clone()));
                    }
                    Err(e) => warn!("Failed to accept TCP connection: {}", e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.abort_all();
        while connections.join_next().await.is_some() {}
        debug!("TCP receiver stopped");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing TCP transport");
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.listener = None;
        self.endpoint = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TCP"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}
