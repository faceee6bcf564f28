//! # Measurement Envelope Codec
//!
//! Every payload carried by a transport starts with a small JSON metadata
//! object `{"s":<sequence>,"t":<send timestamp>}` followed by padding up to
//! the requested size. Padding is drawn from ASCII letters so it can never
//! contain the closing brace that terminates the metadata.
//!
//! Decoding locates the first `}` and parses only the bytes up to it, so
//! corrupted or truncated padding (including invalid UTF-8) does not matter.
//! A malformed prefix yields `None` rather than an error.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Decoded measurement metadata
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "s")]
    pub sequence: u64,
    /// Seconds since the Unix epoch
    #[serde(rename = "t")]
    pub send_timestamp: f64,
}

impl Envelope {
    pub fn new(sequence: u64, send_timestamp: f64) -> Self {
        Self {
            sequence,
            send_timestamp,
        }
    }

    /// Stamp a new envelope with the current wall-clock time
    pub fn now(sequence: u64) -> Self {
        Self::new(sequence, crate::utils::unix_time_secs())
    }

    /// Length of the encoded metadata prefix
    pub fn metadata_len(&self) -> usize {
        self.metadata().len()
    }

    fn metadata(&self) -> Vec<u8> {
        // Serializing two plain numbers cannot fail; fall back to an
        // explicit rendering rather than panicking.
        serde_json::to_vec(self).unwrap_or_else(|_| {
            format!("{{\"s\":{},\"t\":{}}}", self.sequence, self.send_timestamp).into_bytes()
        })
    }

    /// Encode into a payload of `size` bytes
    ///
    /// When `size` is smaller than the metadata the payload is exactly the
    /// metadata and therefore longer than requested.
    pub fn encode(&self, size: usize) -> Vec<u8> {
        let mut payload = self.metadata();
        if payload.len() < size {
            let padding = size - payload.len();
            payload.reserve_exact(padding);
            payload.extend(
                rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .filter(u8::is_ascii_alphabetic)
                    .take(padding),
            );
        }
        payload
    }

    /// Decode the metadata prefix of a payload
    pub fn decode(data: &[u8]) -> Option<Envelope> {
        let end = data.iter().position(|&b| b == b'}')?;
        let envelope: Envelope = serde_json::from_slice(&data[..=end]).ok()?;
        if !envelope.send_timestamp.is_finite() {
            return None;
        }
        Some(envelope)
    }
}

/// Encode a fresh envelope for `sequence` padded to `size` bytes
pub fn generate_payload(sequence: u64, size: usize) -> Vec<u8> {
    Envelope::now(sequence).encode(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: f64 = 1_718_000_000.123_456_7;

    #[test]
    fn test_round_trip_across_sizes() {
        let envelope = Envelope::new(42, T);
        let min = envelope.metadata_len();
        for size in [min, min + 1, 128, 1024, 64 * 1024] {
            let payload = envelope.encode(size);
            assert_eq!(payload.len(), size);
            assert_eq!(Envelope::decode(&payload), Some(envelope));
        }
    }

    #[test]
    fn test_small_size_yields_metadata_only() {
        let envelope = Envelope::new(7, T);
        let payload = envelope.encode(4);
        assert_eq!(payload.len(), envelope.metadata_len());
        assert_eq!(Envelope::decode(&payload), Some(envelope));
    }

    #[test]
    fn test_padding_is_never_interpreted() {
        let envelope = Envelope::new(9, T);
        let payload = envelope.encode(512);
        let meta_len = envelope.metadata_len();
        assert!(payload[meta_len..].iter().all(u8::is_ascii_alphabetic));
    }

    #[test]
    fn test_decode_tolerates_truncated_padding() {
        let envelope = Envelope::new(1000, T);
        let payload = envelope.encode(256);
        let truncated = &payload[..envelope.metadata_len() + 3];
        assert_eq!(Envelope::decode(truncated), Some(envelope));
    }

    #[test]
    fn test_decode_tolerates_corrupted_padding() {
        let envelope = Envelope::new(3, T);
        let mut payload = envelope.encode(128);
        let meta_len = envelope.metadata_len();
        for byte in payload[meta_len..].iter_mut() {
            *byte = 0xFF;
        }
        payload.push(0xC3);
        assert_eq!(Envelope::decode(&payload), Some(envelope));
    }

    #[test]
    fn test_decode_rejects_malformed_prefix() {
        let envelope = Envelope::new(5, T);
        let mut payload = envelope.encode(128);
        payload[1] = b'#';
        assert_eq!(Envelope::decode(&payload), None);

        assert_eq!(Envelope::decode(b""), None);
        assert_eq!(Envelope::decode(b"no metadata here"), None);
        assert_eq!(Envelope::decode(b"{\"s\":1}"), None);
        assert_eq!(Envelope::decode(b"{\"s\":\"x\",\"t\":1.0}"), None);
        assert_eq!(Envelope::decode(&[0xFF, 0xFE, b'}']), None);
    }

    #[test]
    fn test_decode_rejects_cut_metadata() {
        let envelope = Envelope::new(77, T);
        let payload = envelope.encode(64);
        let cut = &payload[..envelope.metadata_len() - 1];
        assert_eq!(Envelope::decode(cut), None);
    }

    #[test]
    fn test_generate_payload_is_recent() {
        let before = crate::utils::unix_time_secs();
        let payload = generate_payload(11, 128);
        let decoded = Envelope::decode(&payload).unwrap();
        assert_eq!(decoded.sequence, 11);
        assert!(decoded.send_timestamp >= before);
    }
}
