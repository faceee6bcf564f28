//! CoAP (RFC 7252) PUT of each payload to the `/data` resource.
//!
//! The confirmable variant waits for the matching ACK and retransmits with a
//! doubling timeout; the non-confirmable variant is fire-and-forget. Only the
//! subset of the message format needed here is implemented: header, token,
//! Uri-Path options and payload.

use super::{Endpoint, Transport, TransportError, MAX_DATAGRAM_SIZE};
use crate::metrics::MetricsCollector;
use crate::shutdown::Shutdown;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

pub const CODE_PUT: u8 = 0x03;
/// 2.04 Changed
pub const CODE_CHANGED: u8 = 0x44;
/// 4.04 Not Found
pub const CODE_NOT_FOUND: u8 = 0x84;
pub const RESOURCE_PATH: &str = "data";

const VERSION: u8 = 1;
const OPTION_URI_PATH: u16 = 11;
const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LEN: usize = 8;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRANSMIT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub message_type: MessageType,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub uri_path: Vec<String>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    /// PUT request to `/data`
    pub fn put(message_type: MessageType, message_id: u16, token: Vec<u8>, payload: &[u8]) -> Self {
        Self {
            message_type,
            code: CODE_PUT,
            message_id,
            token,
            uri_path: vec![RESOURCE_PATH.to_string()],
            payload: payload.to_vec(),
        }
    }

    /// Piggybacked response to a confirmable request
    pub fn ack_for(request: &CoapMessage, code: u8) -> Self {
        Self {
            message_type: MessageType::Acknowledgement,
            code,
            message_id: request.message_id,
            token: request.token.clone(),
            uri_path: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let token = &self.token[..self.token.len().min(MAX_TOKEN_LEN)];
        let mut out = Vec::with_capacity(4 + token.len() + 8 + self.payload.len() + 1);

        out.push((VERSION << 6) | ((self.message_type as u8) << 4) | token.len() as u8);
        out.push(self.code);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(token);

        let mut last_option = 0u16;
        for segment in &self.uri_path {
            encode_option(&mut out, OPTION_URI_PATH - last_option, segment.as_bytes());
            last_option = OPTION_URI_PATH;
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// Parse a datagram; format errors yield `None`
    pub fn decode(data: &[u8]) -> Option<CoapMessage> {
        if data.len() < 4 || data[0] >> 6 != VERSION {
            return None;
        }
        let message_type = MessageType::from_bits(data[0] >> 4);
        let token_len = (data[0] & 0x0F) as usize;
        if token_len > MAX_TOKEN_LEN {
            return None;
        }

        let code = data[1];
        let message_id = u16::from_be_bytes([data[2], data[3]]);
        let mut idx = 4;
        let token = data.get(idx..idx + token_len)?.to_vec();
        idx += token_len;

        let mut option_number = 0u16;
        let mut uri_path = Vec::new();
        let mut payload = Vec::new();

        while idx < data.len() {
            let byte = data[idx];
            idx += 1;
            if byte == PAYLOAD_MARKER {
                // A marker followed by nothing is a format error
                if idx == data.len() {
                    return None;
                }
                payload = data[idx..].to_vec();
                break;
            }

            let delta = read_option_field(byte >> 4, data, &mut idx)?;
            let len = read_option_field(byte & 0x0F, data, &mut idx)?;
            let value = data.get(idx..idx + len)?;
            idx += len;

            option_number = option_number.checked_add(u16::try_from(delta).ok()?)?;
            if option_number == OPTION_URI_PATH {
                uri_path.push(String::from_utf8_lossy(value).into_owned());
            }
        }

        Some(CoapMessage {
            message_type,
            code,
            message_id,
            token,
            uri_path,
            payload,
        })
    }

    fn targets_data_resource(&self) -> bool {
        self.uri_path.len() == 1 && self.uri_path[0] == RESOURCE_PATH
    }
}

fn option_nibble(value: usize) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269).min(u16::MAX as usize) as u16).to_be_bytes().to_vec())
    }
}

fn encode_option(out: &mut Vec<u8>, delta: u16, value: &[u8]) {
    let (delta_nibble, delta_ext) = option_nibble(delta as usize);
    let (len_nibble, len_ext) = option_nibble(value.len());
    out.push((delta_nibble << 4) | len_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&len_ext);
    out.extend_from_slice(value);
}

fn read_option_field(nibble: u8, data: &[u8], idx: &mut usize) -> Option<usize> {
    match nibble {
        0..=12 => Some(nibble as usize),
        13 => {
            let b = *data.get(*idx)?;
            *idx += 1;
            Some(b as usize + 13)
        }
        14 => {
            let bytes = data.get(*idx..*idx + 2)?;
            *idx += 2;
            Some(u16::from_be_bytes([bytes[0], bytes[1]]) as usize + 269)
        }
        _ => None,
    }
}

pub fn message_id(sequence: u64) -> u16 {
    (sequence % 65_536) as u16
}

fn token_for(sequence: u64) -> Vec<u8> {
    (sequence as u32).to_be_bytes().to_vec()
}

pub struct CoapTransport {
    message_type: MessageType,
    socket: Option<UdpSocket>,
    ack_timeout: Duration,
    max_retransmit: u32,
}

impl CoapTransport {
    pub fn confirmable() -> Self {
        Self::with_type(MessageType::Confirmable)
    }

    pub fn non_confirmable() -> Self {
        Self::with_type(MessageType::NonConfirmable)
    }

    fn with_type(message_type: MessageType) -> Self {
        Self {
            message_type,
            socket: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retransmit: DEFAULT_MAX_RETRANSMIT,
        }
    }

    /// Override the initial ACK timeout and retransmission count
    pub fn with_retransmission(mut self, ack_timeout: Duration, max_retransmit: u32) -> Self {
        self.ack_timeout = ack_timeout;
        self.max_retransmit = max_retransmit;
        self
    }

    async fn await_ack(socket: &UdpSocket, message_id: u16, deadline: Instant) -> Result<bool, TransportError> {
        let mut buf = [0u8; 512];
        loop {
            match timeout_at(deadline, socket.recv(&mut buf)).await {
                Err(_) => return Ok(false),
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Ok(Ok(n)) => {
                    let Some(reply) = CoapMessage::decode(&buf[..n]) else {
                        continue;
                    };
                    if reply.message_id != message_id {
                        // Late ACK for an earlier message
                        continue;
                    }
                    match reply.message_type {
                        MessageType::Acknowledgement => return Ok(true),
                        MessageType::Reset => {
                            return Err(TransportError::Protocol(format!(
                                "Message {} was reset by the peer",
                                message_id
                            )))
                        }
                        _ => continue,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for CoapTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        let peer = endpoint.resolve().await?;
        let socket = UdpSocket::bind(super::any_local_for(&peer)).await?;
        socket
            .connect(peer)
            .await
            .with_context(|| format!("Failed to connect UDP socket to {}", peer))?;
        debug!("CoAP {:?} sender targeting {}", self.message_type, peer);
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, sequence: u64, payload: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        let mid = message_id(sequence);
        let request = CoapMessage::put(self.message_type, mid, token_for(sequence), payload).encode();

        socket.send(&request).await?;
        if self.message_type != MessageType::Confirmable {
            return Ok(());
        }

        let mut wait = self.ack_timeout;
        for attempt in 0..=self.max_retransmit {
            if attempt > 0 {
                debug!("Retransmitting CoAP message {} (attempt {})", mid, attempt);
                socket.send(&request).await?;
            }
            if Self::await_ack(socket, mid, Instant::now() + wait).await? {
                return Ok(());
            }
            wait *= 2;
        }
        Err(TransportError::Timeout)
    }

    async fn bind(&mut self, endpoint: &Endpoint) -> Result<()> {
        let addr = endpoint.resolve().await?;
        let socket = super::bind_udp(addr)?;
        debug!("CoAP receiver listening on {}", socket.local_addr()?);
        self.socket = Some(socket);
        Ok(())
    }

    async fn serve(&mut self, collector: Arc<MetricsCollector>, mut shutdown: Shutdown) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| anyhow!("CoAP receiver is not bound"))?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (n, peer) = tokio::select! {
                _ = shutdown.triggered() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("CoAP receive error: {}", e);
                        continue;
                    }
                },
            };

            let Some(request) = CoapMessage::decode(&buf[..n]) else {
                debug!("Ignoring malformed {} byte datagram from {}", n, peer);
                continue;
            };
            if !matches!(request.message_type, MessageType::Confirmable | MessageType::NonConfirmable) {
                continue;
            }

            let code = if request.code == CODE_PUT && request.targets_data_resource() {
                collector.record_payload(&request.payload);
                CODE_CHANGED
            } else {
                CODE_NOT_FOUND
            };

            if request.message_type == MessageType::Confirmable {
                let ack = CoapMessage::ack_for(&request, code).encode();
                if let Err(e) = socket.send_to(&ack, peer).await {
                    debug!("Failed to acknowledge CoAP message {}: {}", request.message_id, e);
                }
            }
        }

        debug!("CoAP receiver stopped");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        match self.message_type {
            MessageType::Confirmable => "CoAP CON",
            _ => "CoAP NON",
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}
