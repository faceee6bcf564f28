use anyhow::{Context, Result};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

use crate::payload::Envelope;

/// One accepted arrival
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    #[serde(rename = "s")]
    pub sequence: u64,
    #[serde(rename = "t")]
    pub send_timestamp: f64,
    /// Receive time minus send time, in milliseconds
    #[serde(rename = "l")]
    pub latency_ms: f64,
}

/// Everything a collector gathered during one trial
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub count: usize,
    pub samples: Vec<LatencySample>,
}

impl MetricsSnapshot {
    pub fn from_samples(samples: Vec<LatencySample>) -> Self {
        // Raw files written by other tools may repeat a sequence; keep the
        // first arrival only, exactly as the collector would have.
        let mut seen = HashSet::with_capacity(samples.len());
        let samples: Vec<LatencySample> = samples
            .into_iter()
            .filter(|s| seen.insert(s.sequence))
            .collect();
        Self {
            count: samples.len(),
            samples,
        }
    }

    pub fn latencies_ms(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.latency_ms).collect()
    }

    pub fn latency_summary(&self) -> LatencySummary {
        LatencySummary::from_latencies(&self.latencies_ms())
    }
}

/// Latency statistics derived from a snapshot, all in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub average_ms: f64,
    /// Sample standard deviation of the latencies (0 with fewer than 2 samples)
    pub jitter_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    pub fn from_latencies(latencies_ms: &[f64]) -> Self {
        if latencies_ms.is_empty() {
            return Self::default();
        }

        let (average_ms, _min, max_ms, jitter_ms) = crate::utils::calculate_stats(latencies_ms);
        let (p50_ms, p95_ms, p99_ms) = percentiles_ms(latencies_ms);

        Self {
            average_ms,
            jitter_ms,
            p50_ms,
            p95_ms,
            p99_ms,
            max_ms,
        }
    }
}

/// Percentiles via an HDR histogram at microsecond resolution
///
/// Negative latencies (clock skew between hosts) are clamped to zero for the
/// histogram only; the mean and deviation use the raw values.
fn percentiles_ms(latencies_ms: &[f64]) -> (f64, f64, f64) {
    let mut histogram = match Histogram::<u64>::new(3) {
        Ok(h) => h,
        Err(e) => {
            warn!("Failed to create latency histogram: {}", e);
            return (0.0, 0.0, 0.0);
        }
    };

    for &latency in latencies_ms {
        let micros = (latency.max(0.0) * 1_000.0).round() as u64;
        if let Err(e) = histogram.record(micros) {
            debug!("Dropping latency {}ms from histogram: {}", latency, e);
        }
    }

    if histogram.len() == 0 {
        return (0.0, 0.0, 0.0);
    }

    let at = |p: f64| histogram.value_at_percentile(p) as f64 / 1_000.0;
    (at(50.0), at(95.0), at(99.0))
}

#[derive(Default)]
struct CollectorState {
    seen: HashSet<u64>,
    samples: Vec<LatencySample>,
}

/// Per-trial arrival recorder
///
/// Safe to share between the receiver's I/O tasks (`record` takes `&self`).
/// A sequence number is accepted once; later arrivals of the same sequence
/// within the trial are dropped so retransmissions cannot inflate delivery.
#[derive(Default)]
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arrival using the current wall-clock time
    ///
    /// Returns `false` when the sequence was already recorded.
    pub fn record(&self, send_timestamp: f64, sequence: u64) -> bool {
        self.record_at(send_timestamp, sequence, crate::utils::unix_time_secs())
    }

    /// Record an arrival observed at `recv_timestamp` (seconds since epoch)
    pub fn record_at(&self, send_timestamp: f64, sequence: u64, recv_timestamp: f64) -> bool {
        let mut state = self.state.lock();
        if !state.seen.insert(sequence) {
            return false;
        }
        state.samples.push(LatencySample {
            sequence,
            send_timestamp,
            latency_ms: (recv_timestamp - send_timestamp) * 1_000.0,
        });
        true
    }

    /// Decode an envelope from a received payload and record it
    ///
    /// Payloads whose metadata cannot be decoded are ignored.
    pub fn record_payload(&self, payload: &[u8]) -> bool {
        match Envelope::decode(payload) {
            Some(envelope) => self.record(envelope.send_timestamp, envelope.sequence),
            None => {
                debug!("Ignoring payload without decodable metadata ({} bytes)", payload.len());
                false
            }
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            count: state.samples.len(),
            samples: state.samples.clone(),
        }
    }

    /// Persist the collected samples as the trial's raw sample file
    ///
    /// Nothing is written when no sample was accepted; readers treat a
    /// missing file as zero samples.
    pub fn save_raw_samples(&self, path: &Path) -> Result<usize> {
        let snapshot = self.snapshot();
        if snapshot.samples.is_empty() {
            debug!("No samples collected, skipping raw sample file {:?}", path);
            return Ok(0);
        }
        write_raw_samples(path, &snapshot.samples)?;
        Ok(snapshot.count)
    }
}

/// Write samples as a JSON array, replacing the target atomically
pub fn write_raw_samples(path: &Path, samples: &[LatencySample]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec(samples)?;
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", tmp))?;
    Ok(())
}

/// Load a raw sample file written at receiver shutdown
///
/// A missing, unreadable or malformed file counts as zero samples for the
/// trial; it never fails the sweep.
pub fn load_raw_samples(path: &Path) -> MetricsSnapshot {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            warn!("Raw sample file {:?} unavailable ({}), counting zero samples", path, e);
            return MetricsSnapshot::default();
        }
    };

    match serde_json::from_slice::<Vec<LatencySample>>(&data) {
        Ok(samples) => MetricsSnapshot::from_samples(samples),
        Err(e) => {
            warn!("Raw sample file {:?} is malformed ({}), counting zero samples", path, e);
            MetricsSnapshot::default()
        }
    }
}
