//! MQTT-SN QoS 0 PUBLISH over UDP.
//!
//! Only the PUBLISH message is spoken: the sender addresses a pre-defined
//! topic id and needs no CONNECT/REGISTER exchange, so every datagram is
//! independent and a lost one is simply not counted.

use super::{Endpoint, Transport, TransportError, MAX_DATAGRAM_SIZE};
use crate::metrics::MetricsCollector;
use crate::shutdown::Shutdown;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

pub const MSG_TYPE_PUBLISH: u8 = 0x0C;
pub const DEFAULT_TOPIC_ID: u16 = 1;

/// Marks the 3-byte length form
const LONG_LENGTH_MARKER: u8 = 0x01;
/// type + flags + topic id + message id
const PUBLISH_FIXED_LEN: usize = 6;

/// Message id for a sequence number (wraps at 65535)
pub fn message_id(sequence: u64) -> u16 {
    (sequence % 65_535) as u16
}

/// Build a QoS 0 PUBLISH datagram
pub fn encode_publish(topic_id: u16, msg_id: u16, payload: &[u8]) -> Vec<u8> {
    let short_len = 1 + PUBLISH_FIXED_LEN + payload.len();
    let mut frame;
    if short_len < 256 {
        frame = Vec::with_capacity(short_len);
        frame.push(short_len as u8);
    } else {
        let long_len = 3 + PUBLISH_FIXED_LEN + payload.len();
        frame = Vec::with_capacity(long_len);
        frame.push(LONG_LENGTH_MARKER);
        frame.extend_from_slice(&(long_len.min(u16::MAX as usize) as u16).to_be_bytes());
    }
    frame.push(MSG_TYPE_PUBLISH);
    frame.push(0x00); // flags: QoS 0, normal topic id
    frame.extend_from_slice(&topic_id.to_be_bytes());
    frame.extend_from_slice(&msg_id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// A decoded PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publish<'a> {
    pub topic_id: u16,
    pub msg_id: u16,
    pub payload: &'a [u8],
}

/// Parse a datagram; anything other than a well-formed PUBLISH yields `None`
pub fn decode_publish(datagram: &[u8]) -> Option<Publish<'_>> {
    let (length, header_len) = match *datagram.first()? {
        LONG_LENGTH_MARKER => {
            let bytes = datagram.get(1..3)?;
            (u16::from_be_bytes([bytes[0], bytes[1]]) as usize, 3)
        }
        len => (len as usize, 1),
    };

    if length < header_len + PUBLISH_FIXED_LEN || datagram.len() < length {
        return None;
    }

    let message = &datagram[..length];
    if message[header_len] != MSG_TYPE_PUBLISH {
        return None;
    }

    let fixed = &message[header_len + 2..header_len + PUBLISH_FIXED_LEN];
    Some(Publish {
        topic_id: u16::from_be_bytes([fixed[0], fixed[1]]),
        msg_id: u16::from_be_bytes([fixed[2], fixed[3]]),
        payload: &message[header_len + PUBLISH_FIXED_LEN..],
    })
}

pub struct MqttSnTransport {
    topic_id: u16,
    socket: Option<UdpSocket>,
}

impl Default for MqttSnTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttSnTransport {
    pub fn new() -> Self {
        Self {
            topic_id: DEFAULT_TOPIC_ID,
            socket: None,
        }
    }
}

#[async_trait]
impl Transport for MqttSnTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        let peer = endpoint.resolve().await?;
        let socket = UdpSocket::bind(super::any_local_for(&peer)).await?;
        socket
            .connect(peer)
            .await
            .with_context(|| format!("Failed to connect UDP socket to {}", peer))?;
        debug!("MQTT-SN sender targeting {}", peer);
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, sequence: u64, payload: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        let frame = encode_publish(self.topic_id, message_id(sequence), payload);
        socket.send(&frame).await?;
        Ok(())
    }

    async fn bind(&mut self, endpoint: &Endpoint) -> Result<()> {
        let addr = endpoint.resolve().await?;
        let socket = super::bind_udp(addr)?;
        debug!("MQTT-SN receiver listening on {}", socket.local_addr()?);
        self.socket = Some(socket);
        Ok(())
    }

    async fn serve(&mut self, collector: Arc<MetricsCollector>, mut shutdown: Shutdown) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| anyhow!("MQTT-SN receiver is not bound"))?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => match decode_publish(&buf[..n]) {
                        Some(publish) if publish.topic_id == self.topic_id => {
                            collector.record_payload(publish.payload);
                        }
                        _ => debug!("Ignoring {} byte datagram from {}", n, peer),
                    },
                    Err(e) => debug!("MQTT-SN receive error: {}", e),
                },
            }
        }

        debug!("MQTT-SN receiver stopped");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MQTT-SN"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}
