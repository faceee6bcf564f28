//! # Run Executor
//!
//! Drives one trial end to end:
//!
//! 1. apply the network profile (serialized across workers)
//! 2. start the receiver with a fresh collector
//! 3. wait the receiver grace period
//! 4. run the paced sender to completion
//! 5. stop the receiver and wait the drain period
//! 6. turn the collected samples into a `ResultRecord`
//!
//! Setup failures degrade the trial (typically to zero delivery) instead of
//! failing it; the only errors returned are ones that make the trial
//! meaningless to record, such as an unusable protocol.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::agent::{ProtocolAgent, SendPlan, SendReport};
use crate::cli::{Protocol, ReceiverMode};
use crate::experiment::ExperimentConfiguration;
use crate::metrics::{load_raw_samples, MetricsCollector, MetricsSnapshot};
use crate::network::NetworkController;
use crate::results::ResultRecord;
use crate::shutdown::Shutdown;
use crate::transport::Endpoint;

/// Runs a single trial; the seam the sweep driver is tested through
#[async_trait]
pub trait TrialRunner: Send + Sync {
    async fn run_trial(&self, config: &ExperimentConfiguration) -> Result<ResultRecord>;
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub target_host: String,
    pub bind_host: String,
    /// Use this port for every protocol instead of its well-known port
    pub port_override: Option<u16>,
    pub receiver_grace: Duration,
    pub drain: Duration,
    /// How long a stopped receiver may take to flush before it is killed
    pub stop_grace: Duration,
    pub placement: ReceiverMode,
    /// Where subprocess receivers write their raw sample files
    pub raw_dir: PathBuf,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            target_host: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
            port_override: None,
            receiver_grace: crate::defaults::RECEIVER_GRACE,
            drain: crate::defaults::DRAIN,
            stop_grace: crate::defaults::STOP_GRACE,
            placement: ReceiverMode::InProcess,
            raw_dir: PathBuf::from(crate::defaults::RESULTS_DIR).join("raw"),
        }
    }
}

pub struct RunExecutor {
    settings: ExecutorSettings,
    network: Arc<NetworkController>,
}

impl RunExecutor {
    pub fn new(settings: ExecutorSettings, network: Arc<NetworkController>) -> Self {
        Self { settings, network }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    fn port_for(&self, protocol: Protocol) -> u16 {
        self.settings
            .port_override
            .unwrap_or_else(|| protocol.default_port())
    }

    async fn run_sender(&self, config: &ExperimentConfiguration, port: u16) -> SendReport {
        let plan = SendPlan {
            payload_size: config.payload_size,
            rate: config.rate,
            duration: config.duration,
        };
        let endpoint = Endpoint::new(self.settings.target_host.clone(), port);

        let outcome = async {
            let mut agent = ProtocolAgent::new(config.protocol, endpoint)?;
            agent.run_sender(&plan, Shutdown::never()).await
        }
        .await;

        match outcome {
            Ok(report) => report,
            Err(e) => {
                warn!("{} sender could not start: {:#}", config.protocol, e);
                SendReport::default()
            }
        }
    }

    /// Receiver as a task in this process, sharing the collector directly
    async fn collect_in_process(&self, config: &ExperimentConfiguration) -> Result<MetricsSnapshot> {
        let collector = Arc::new(MetricsCollector::new());
        let (trigger, shutdown) = Shutdown::channel();
        let port = self.port_for(config.protocol);

        let mut receiver =
            ProtocolAgent::new(config.protocol, Endpoint::new(self.settings.bind_host.clone(), port))?;

        let (receiver_task, sender_port) = match receiver.bind_receiver().await {
            Ok(()) => {
                // Port 0 binds an ephemeral port; the sender must follow it
                let bound = receiver.local_addr().map(|a| a.port()).unwrap_or(port);
                let task_collector = collector.clone();
                let task = tokio::spawn(async move {
                    receiver.run_receiver(task_collector, shutdown, None).await
                });
                (Some(task), bound)
            }
            Err(e) => {
                warn!(
                    "{} receiver failed to bind on port {}: {:#}; trial will record what arrives",
                    config.protocol, port, e
                );
                (None, port)
            }
        };

        tokio::time::sleep(self.settings.receiver_grace).await;
        let report = self.run_sender(config, sender_port).await;
        debug!(
            "{} sender done: {} attempted, {} failed",
            config.protocol, report.attempted, report.failed
        );

        trigger.trigger();
        if let Some(task) = receiver_task {
            match tokio::time::timeout(self.settings.stop_grace, task).await {
                Ok(Ok(Ok(count))) => debug!("{} receiver collected {}", config.protocol, count),
                Ok(Ok(Err(e))) => warn!("{} receiver failed: {:#}", config.protocol, e),
                Ok(Err(e)) => warn!("{} receiver task aborted: {}", config.protocol, e),
                Err(_) => warn!("{} receiver did not stop within the grace period", config.protocol),
            }
        }

        tokio::time::sleep(self.settings.drain).await;
        Ok(collector.snapshot())
    }

    /// Receiver as a child `agent --role receiver` process
    async fn collect_subprocess(&self, config: &ExperimentConfiguration) -> Result<MetricsSnapshot> {
        let port = self.port_for(config.protocol);
        if let Err(e) = std::fs::create_dir_all(&self.settings.raw_dir) {
            // The receiver's flush will fail too and the trial records zero samples
            warn!(
                "Failed to create raw sample directory {:?}: {}",
                self.settings.raw_dir, e
            );
        }
        let samples_file = self.settings.raw_dir.join(format!(
            "{}-{}.json",
            config.protocol.table_name(),
            crate::utils::generate_trial_id()
        ));

        let child = match self.spawn_receiver(config.protocol, port, &samples_file) {
            Ok(child) => Some(child),
            Err(e) => {
                warn!("{} receiver process failed to start: {:#}", config.protocol, e);
                None
            }
        };

        tokio::time::sleep(self.settings.receiver_grace).await;
        let report = self.run_sender(config, port).await;
        debug!(
            "{} sender done: {} attempted, {} failed",
            config.protocol, report.attempted, report.failed
        );

        if let Some(child) = child {
            stop_child(child, self.settings.stop_grace).await;
        }

        tokio::time::sleep(self.settings.drain).await;
        Ok(load_raw_samples(&samples_file))
    }

    fn spawn_receiver(&self, protocol: Protocol, port: u16, samples_file: &std::path::Path) -> Result<Child> {
        let exe_path = resolve_binary()?;
        debug!("Spawning receiver binary: {}", exe_path.display());

        let mut cmd = Command::new(&exe_path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd.arg("agent")
            .arg("--role")
            .arg("receiver")
            .arg("--protocol")
            .arg(protocol.as_str())
            .arg("--host")
            .arg(&self.settings.bind_host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--samples-file")
            .arg(samples_file);

        cmd.spawn()
            .with_context(|| format!("Failed to spawn {}", exe_path.display()))
    }
}

#[async_trait]
impl TrialRunner for RunExecutor {
    async fn run_trial(&self, config: &ExperimentConfiguration) -> Result<ResultRecord> {
        info!("Running trial {}", config);
        self.network.apply_profile(&config.network_profile()).await;

        let snapshot = match self.settings.placement {
            ReceiverMode::InProcess => self.collect_in_process(config).await?,
            ReceiverMode::Subprocess => self.collect_subprocess(config).await?,
        };

        let record = ResultRecord::from_trial(config, &snapshot);
        info!(
            "Trial finished: {}/{} received ({:.1}%), avg latency {:.2}ms, jitter {:.2}ms, {}",
            record.received,
            record.sent,
            record.delivery_ratio,
            record.latency_avg_ms,
            record.jitter_ms,
            crate::utils::format_bitrate(record.throughput_bps)
        );
        Ok(record)
    }
}

/// Ask the receiver to flush and exit, killing it after `grace`
async fn stop_child(mut child: Child, grace: Duration) {
    interrupt(&child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Receiver process exited with {}", status),
        Ok(Err(e)) => warn!("Failed to wait for receiver process: {}", e),
        Err(_) => {
            warn!("Receiver process ignored SIGINT for {:?}, killing it", grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill receiver process: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!("Failed to send SIGINT to receiver {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn interrupt(child: &Child) {
    debug!("SIGINT unavailable; receiver {:?} will be killed after the grace period", child.id());
}

/// Locate the `lpwan-bench` binary
///
/// Under `cargo test` the current executable is the test harness, so fall
/// back to Cargo's binary path and finally to `target/debug`.
fn resolve_binary() -> Result<PathBuf> {
    let exe_name = if cfg!(windows) { "lpwan-bench.exe" } else { "lpwan-bench" };

    let current_exe = std::env::current_exe().context("Failed to get current executable path")?;
    if current_exe.file_name().and_then(|n| n.to_str()) == Some(exe_name) {
        return Ok(current_exe);
    }

    if let Ok(p) = std::env::var("CARGO_BIN_EXE_lpwan-bench") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Ok(path);
        }
    }

    let fallback = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target")
        .join("debug")
        .join(exe_name);
    if fallback.exists() {
        return Ok(fallback);
    }

    Err(anyhow::anyhow!(
        "Could not resolve '{}' binary for the receiver process. Build it with \
         `cargo build --bin lpwan-bench` first.",
        exe_name
    ))
}
