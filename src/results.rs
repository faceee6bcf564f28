use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::cli::Protocol;
use crate::experiment::{Bandwidth, ConfigKey, ExperimentConfiguration, LossPercent};
use crate::metrics::MetricsSnapshot;

/// One completed trial, as stored in the protocol's result table
///
/// Field order is the column order of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub protocol: Protocol,
    pub payload_size: usize,
    pub rate: f64,
    pub bandwidth: Bandwidth,
    pub loss_pct: f64,
    pub delay_ms: u64,
    pub duration_s: f64,
    /// Expected count: floor(rate * duration)
    pub sent: u64,
    /// Distinct sequences that arrived
    pub received: u64,
    pub delivery_ratio: f64,
    pub latency_avg_ms: f64,
    pub jitter_ms: f64,
    pub throughput_bps: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_max_ms: f64,
    pub completed_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Derive the table row for a finished trial
    pub fn from_trial(config: &ExperimentConfiguration, snapshot: &MetricsSnapshot) -> Self {
        let sent = config.expected_messages();
        let received = snapshot.count as u64;
        let duration_s = config.duration.as_secs_f64();
        let summary = snapshot.latency_summary();

        Self {
            protocol: config.protocol,
            payload_size: config.payload_size,
            rate: config.rate,
            bandwidth: config.bandwidth,
            loss_pct: config.loss.value(),
            delay_ms: config.delay_ms,
            duration_s,
            sent,
            received,
            delivery_ratio: delivery_ratio(sent, received),
            latency_avg_ms: summary.average_ms,
            jitter_ms: summary.jitter_ms,
            throughput_bps: throughput_bps(received, config.payload_size, duration_s),
            latency_p50_ms: summary.p50_ms,
            latency_p95_ms: summary.p95_ms,
            latency_p99_ms: summary.p99_ms,
            latency_max_ms: summary.max_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> Option<ConfigKey> {
        let loss = LossPercent::new(self.loss_pct).ok()?;
        Some(ConfigKey::new(
            self.protocol,
            self.payload_size,
            self.rate,
            self.bandwidth,
            loss,
            self.delay_ms,
        ))
    }

    /// Whether the ledger accepts this row as a finished trial
    pub fn is_done(&self) -> bool {
        is_done(self.delivery_ratio, self.loss_pct)
    }
}

/// received / sent * 100 (0 when nothing was expected)
pub fn delivery_ratio(sent: u64, received: u64) -> f64 {
    if sent == 0 {
        return 0.0;
    }
    received as f64 / sent as f64 * 100.0
}

/// received * size * 8 / duration, in bits per second
pub fn throughput_bps(received: u64, payload_size: usize, duration_s: f64) -> f64 {
    if duration_s <= 0.0 {
        return 0.0;
    }
    received as f64 * payload_size as f64 * 8.0 / duration_s
}

/// Completion policy
///
/// Zero delivery under partial loss is inconclusive and re-run on resume;
/// zero delivery under total loss is a valid terminal result.
pub fn is_done(delivery_ratio: f64, loss_pct: f64) -> bool {
    delivery_ratio > 0.0 || loss_pct >= 100.0
}

/// Lenient view of a table row used to rebuild the ledger
///
/// Missing or unparseable fields become `None`, which makes the row
/// not-done rather than failing the load.
#[derive(Debug, Deserialize)]
struct LedgerRow {
    #[serde(default, deserialize_with = "csv::invalid_option")]
    protocol: Option<Protocol>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    payload_size: Option<usize>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    rate: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    bandwidth: Option<Bandwidth>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    loss_pct: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    delay_ms: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    delivery_ratio: Option<f64>,
}

impl LedgerRow {
    fn done_key(&self, table_protocol: Protocol) -> Option<ConfigKey> {
        let protocol = self.protocol?;
        if protocol != table_protocol {
            return None;
        }
        let loss_pct = self.loss_pct?;
        if !is_done(self.delivery_ratio?, loss_pct) {
            return None;
        }
        Some(ConfigKey::new(
            protocol,
            self.payload_size?,
            self.rate?,
            self.bandwidth?,
            LossPercent::new(loss_pct).ok()?,
            self.delay_ms?,
        ))
    }
}

/// Index of configurations already completed for one protocol
#[derive(Debug, Default, Clone)]
pub struct CompletionLedger {
    done: HashSet<ConfigKey>,
}

impl CompletionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self, config: &ExperimentConfiguration) -> bool {
        self.done.contains(&config.key())
    }

    /// Account for a freshly appended row; rows failing the policy are ignored
    pub fn record(&mut self, record: &ResultRecord) {
        if !record.is_done() {
            return;
        }
        if let Some(key) = record.key() {
            self.done.insert(key);
        }
    }

    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }
}

/// Per-protocol append-only result tables under one directory
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_path(&self, protocol: Protocol) -> PathBuf {
        self.dir
            .join(format!("results_{}.csv", protocol.table_name()))
    }

    /// Append one row and flush it to stable storage before returning
    ///
    /// The row is rendered in memory and written with a single `write_all`.
    /// A partial row left by an earlier crash is closed off first, so it
    /// is skipped on load and never swallows the new row.
    pub fn append(&self, record: &ResultRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create results directory {:?}", self.dir))?;

        let path = self.table_path(record.protocol);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open result table {:?}", path))?;
        let len = file.metadata()?.len();
        let is_new = len == 0;

        // A crash mid-append can leave a row without its newline; terminate
        // it so the new row starts on a line of its own
        let mut buffer = Vec::new();
        if !is_new {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                warn!("{:?} ends with a partial row, starting a new line", path);
                buffer.push(b'\n');
            }
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(buffer);
        writer.serialize(record)?;
        let row = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to render result row: {}", e.error()))?;

        file.write_all(&row)
            .with_context(|| format!("Failed to append to {:?}", path))?;
        file.sync_data()?;

        debug!("Appended {} result row to {:?}", record.protocol, path);
        Ok(())
    }

    /// Every well-formed row of the protocol's table
    ///
    /// A missing table yields no rows; malformed rows are skipped.
    pub fn load(&self, protocol: Protocol) -> Result<Vec<ResultRecord>> {
        let Some(mut reader) = self.reader(protocol)? else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for (index, row) in reader.deserialize::<ResultRecord>().enumerate() {
            match row {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping malformed {} result row {}: {}", protocol, index + 1, e),
            }
        }
        Ok(records)
    }

    /// Rebuild the completion ledger from the protocol's table
    pub fn load_ledger(&self, protocol: Protocol) -> Result<CompletionLedger> {
        let mut ledger = CompletionLedger::new();
        let Some(mut reader) = self.reader(protocol)? else {
            return Ok(ledger);
        };

        let mut incomplete = 0usize;
        for row in reader.deserialize::<LedgerRow>() {
            match row.ok().and_then(|r| r.done_key(protocol)) {
                Some(key) => {
                    ledger.done.insert(key);
                }
                None => incomplete += 1,
            }
        }

        if incomplete > 0 {
            debug!(
                "{} row(s) in the {} table do not count as done",
                incomplete, protocol
            );
        }
        Ok(ledger)
    }

    fn reader(&self, protocol: Protocol) -> Result<Option<csv::Reader<std::fs::File>>> {
        let path = self.table_path(protocol);
        if !path.exists() {
            return Ok(None);
        }
        let reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&path)
            .with_context(|| format!("Failed to open result table {:?}", path))?;
        Ok(Some(reader))
    }
}

/// Completion status of one protocol's sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolProgress {
    pub protocol: Protocol,
    pub completed: usize,
    pub total: usize,
}

impl ProtocolProgress {
    pub fn percent(&self) -> f64 {
        percent(self.completed, self.total)
    }
}

/// Share of `total` that is complete; an empty sweep counts as finished
fn percent(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    completed as f64 / total as f64 * 100.0
}

/// Read-only progress view over all result tables
#[derive(Debug, Clone, Default)]
pub struct ProgressReport {
    pub protocols: Vec<ProtocolProgress>,
}

impl ProgressReport {
    pub fn completed(&self) -> usize {
        self.protocols.iter().map(|p| p.completed).sum()
    }

    pub fn total(&self) -> usize {
        self.protocols.iter().map(|p| p.total).sum()
    }

    pub fn percent(&self) -> f64 {
        percent(self.completed(), self.total())
    }

    pub fn print(&self) {
        use crate::utils::{create_progress_indicator, print_table_row, print_table_separator};

        let widths = [10, 10, 10, 8, 20];
        print_table_separator(&widths);
        print_table_row(&["Protocol", "Completed", "Total", "Percent", "Progress"], &widths);
        print_table_separator(&widths);

        let mut rows: Vec<(String, usize, usize, f64)> = self
            .protocols
            .iter()
            .map(|p| (p.protocol.to_string(), p.completed, p.total, p.percent()))
            .collect();
        rows.push(("overall".to_string(), self.completed(), self.total(), self.percent()));

        for (i, (name, completed, total, percent)) in rows.iter().enumerate() {
            if i == rows.len() - 1 {
                print_table_separator(&widths);
            }
            print_table_row(
                &[
                    name.as_str(),
                    completed.to_string().as_str(),
                    total.to_string().as_str(),
                    format!("{:.1}%", percent).as_str(),
                    create_progress_indicator(*completed, *total, 20).as_str(),
                ],
                &widths,
            );
        }
        print_table_separator(&widths);
    }
}
