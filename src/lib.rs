//! # LPWAN Bench Library
//!
//! Sweeps messaging protocols through a grid of degraded network conditions
//! (bandwidth cap, delay, jitter, packet loss) and records delivery ratio,
//! latency, jitter and throughput for every configuration.
//!
//! ## Supported Protocols
//!
//! - **TCP**: Length-prefixed frames over a stream
//! - **MQTT-SN**: QoS 0 PUBLISH datagrams over UDP
//! - **CoAP CON**: Confirmable PUT, acknowledged and retransmitted
//! - **CoAP NON**: Non-confirmable PUT, fire-and-forget
//!
//! ## Architecture Overview
//!
//! - `sweep`: Enumerates the parameter space and skips completed trials
//! - `coordinator`: One concurrent sweep worker per protocol, failures isolated
//! - `executor`: Drives one trial through profile, receiver, sender, drain
//! - `network`: Serialized application of shaping profiles (`tc netem`)
//! - `agent`: Sender and receiver roles over a protocol transport
//! - `transport`: Wire implementations of each protocol
//! - `metrics`: Per-trial arrival collection, deduplication and statistics
//! - `results`: Per-protocol result tables and the completion ledger
//! - `payload`: The measurement envelope carried by every message
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use lpwan_bench::{
//!     Coordinator, ExecutorSettings, NetworkController, Protocol, ResultStore, RunExecutor,
//!     SweepDriver, SweepPlan,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let executor = RunExecutor::new(
//!         ExecutorSettings::default(),
//!         Arc::new(NetworkController::noop()),
//!     );
//!     let driver = Arc::new(SweepDriver::new(
//!         SweepPlan::default(),
//!         Arc::new(executor),
//!         ResultStore::new("results"),
//!     ));
//!
//!     let outcomes = Coordinator::run_all(driver, &[Protocol::MqttSn, Protocol::CoapCon]).await;
//!     for outcome in outcomes {
//!         println!("{}: {:?}", outcome.protocol, outcome.result.is_ok());
//!     }
//!     Ok(())
//! }
//! ```

/// Sender and receiver roles with the per-role lifecycle and paced send loop
pub mod agent;

/// Command-line interface and configuration
///
/// Argument parsing using clap: the `sweep`, `agent` and `status`
/// subcommands, human-readable durations and the closed protocol set.
pub mod cli;

pub mod coordinator;

/// Trial execution
///
/// Contains the `TrialRunner` seam and the `RunExecutor` that runs a trial
/// with the receiver either in-process or as a child process.
pub mod executor;

pub mod experiment;

pub mod logging;

/// Per-trial measurement
///
/// Thread-safe arrival recording with sequence deduplication, latency
/// statistics (HDR histogram percentiles) and the raw sample file format.
pub mod metrics;

pub mod network;

pub mod payload;

/// Result tables and resume support
///
/// One append-only CSV table per protocol, the completion ledger rebuilt
/// from it, and the progress report used by `status`.
pub mod results;

pub mod shutdown;

pub mod sweep;

/// Protocol transports
///
/// The `Transport` trait and one implementation per protocol, created
/// through `TransportFactory`.
pub mod transport;

pub mod utils;

pub use agent::{AgentState, ProtocolAgent, SendPlan, SendReport};
pub use cli::{Args, Protocol};
pub use coordinator::{Coordinator, ProtocolOutcome};
pub use executor::{ExecutorSettings, RunExecutor, TrialRunner};
pub use experiment::{Bandwidth, ExperimentConfiguration, LossPercent, NetworkProfile};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use network::{LinkShaper, NetworkController, NoopShaper, TcNetemShaper};
pub use payload::Envelope;
pub use results::{CompletionLedger, ResultRecord, ResultStore};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use sweep::{SweepDriver, SweepPlan, SweepSummary};
pub use transport::{Transport, TransportError, TransportFactory};

/// The current version, populated from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// The default sweep covers the constrained-link range the tool targets:
/// a few payload sizes and send rates against narrowband links with
/// realistic loss and delay.
pub mod defaults {
    use std::time::Duration;

    /// Payload sizes in bytes
    pub const PAYLOAD_SIZES: [usize; 3] = [16, 128, 1024];

    /// Send rates in messages per second
    pub const RATES: [f64; 3] = [1.0, 10.0, 100.0];

    /// Link capacities; `0` means unlimited (shaping cleared)
    pub const BANDWIDTHS: &[&str] = &["50kbit", "100kbit", "250kbit", "1mbit", "0"];

    pub const LOSSES: &[&str] = &["0%", "1%", "5%", "10%"];

    /// One-way delays in milliseconds
    pub const DELAYS: [u64; 4] = [0, 20, 100, 500];

    /// Duration of each trial
    pub const DURATION: Duration = Duration::from_secs(10);

    pub const RESULTS_DIR: &str = "results";

    /// Largest payload accepted
    ///
    /// Leaves room for protocol headers inside a single UDP datagram.
    pub const MAX_PAYLOAD_SIZE: usize = 60 * 1024;

    /// Wait between starting the receiver and starting the sender
    pub const RECEIVER_GRACE: Duration = Duration::from_secs(2);

    /// Wait after a profile change before traffic starts
    pub const SETTLE: Duration = Duration::from_secs(1);

    /// Wait after stopping the receiver
    pub const DRAIN: Duration = Duration::from_secs(1);

    /// Time a stopped receiver gets to flush before it is killed
    pub const STOP_GRACE: Duration = Duration::from_secs(5);
}
