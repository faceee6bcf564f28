//! # Network Profile Controller
//!
//! Applies bandwidth/delay/jitter/loss profiles to the shaped hosts.
//!
//! The shaped path is shared by every protocol worker, so all profile
//! changes go through one `NetworkController` holding a single lock. The
//! settle delay is taken while the lock is held; nothing else is.
//!
//! Shaping failures are logged and never abort a trial: the trial then
//! runs under whatever conditions the path currently has.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::experiment::{Bandwidth, NetworkProfile};

#[derive(Error, Debug)]
pub enum ShaperError {
    #[error("`{command}` failed with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("Failed to spawn shaping command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Installs and removes shaping rules on one named host
///
/// `apply` replaces any rule already present (never stacks) and reduces to
/// `clear` for unlimited bandwidth.
#[async_trait]
pub trait LinkShaper: Send + Sync {
    async fn apply(&self, endpoint: &str, profile: &NetworkProfile) -> Result<(), ShaperError>;

    async fn clear(&self, endpoint: &str) -> Result<(), ShaperError>;

    fn name(&self) -> &'static str;
}

/// `tc qdisc ... netem` executed through each endpoint's command prefix
///
/// An endpoint such as `docker exec node1` runs `docker exec node1 tc ...`;
/// an empty endpoint runs `tc` on this host.
pub struct TcNetemShaper {
    interface: String,
}

impl TcNetemShaper {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    async fn run_tc(&self, endpoint: &str, tc_args: &[String]) -> Result<(), ShaperError> {
        let (program, args) = command_for(endpoint, tc_args);
        let rendered = format!("{} {}", program, args.join(" "));
        debug!("Running {}", rendered);

        let output = Command::new(&program).args(&args).output().await?;
        if !output.status.success() {
            return Err(ShaperError::Command {
                command: rendered,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LinkShaper for TcNetemShaper {
    async fn apply(&self, endpoint: &str, profile: &NetworkProfile) -> Result<(), ShaperError> {
        self.clear(endpoint).await?;
        if profile.bandwidth.is_unlimited() {
            return Ok(());
        }
        self.run_tc(endpoint, &build_netem_args(&self.interface, profile))
            .await
    }

    async fn clear(&self, endpoint: &str) -> Result<(), ShaperError> {
        let args = build_clear_args(&self.interface);
        match self.run_tc(endpoint, &args).await {
            // No root qdisc installed yet
            Err(ShaperError::Command { stderr, .. }) => {
                debug!("Ignoring qdisc removal failure on '{}': {}", endpoint, stderr);
                Ok(())
            }
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        "tc-netem"
    }
}

/// Logs profile changes without touching the network
#[derive(Debug, Default)]
pub struct NoopShaper;

#[async_trait]
impl LinkShaper for NoopShaper {
    async fn apply(&self, endpoint: &str, profile: &NetworkProfile) -> Result<(), ShaperError> {
        debug!("[noop] apply {} on '{}'", profile, endpoint);
        Ok(())
    }

    async fn clear(&self, endpoint: &str) -> Result<(), ShaperError> {
        debug!("[noop] clear '{}'", endpoint);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// `tc` arguments installing `profile` as the root qdisc
pub fn build_netem_args(interface: &str, profile: &NetworkProfile) -> Vec<String> {
    let mut args: Vec<String> = ["qdisc", "add", "dev", interface, "root", "netem"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    args.push("delay".into());
    args.push(format!("{}ms", profile.delay_ms));
    if profile.jitter_ms > 0 {
        args.push(format!("{}ms", profile.jitter_ms));
    }

    args.push("loss".into());
    args.push(format!("{}%", profile.loss.value()));

    if let Bandwidth::Kbit(kbit) = profile.bandwidth {
        args.push("rate".into());
        args.push(format!("{}kbit", kbit));
    }
    args
}

pub fn build_clear_args(interface: &str) -> Vec<String> {
    ["qdisc", "del", "dev", interface, "root"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Split an endpoint command prefix and append the `tc` invocation
fn command_for(endpoint: &str, tc_args: &[String]) -> (String, Vec<String>) {
    let mut parts = endpoint.split_whitespace().map(str::to_string);
    match parts.next() {
        Some(program) => {
            let mut args: Vec<String> = parts.collect();
            args.push("tc".into());
            args.extend(tc_args.iter().cloned());
            (program, args)
        }
        None => ("tc".into(), tc_args.to_vec()),
    }
}

/// Serializes profile changes across all protocol workers
pub struct NetworkController {
    shaper: Arc<dyn LinkShaper>,
    endpoints: Vec<String>,
    lock: Mutex<()>,
    settle: Duration,
}

impl NetworkController {
    /// An empty endpoint list shapes the local host
    pub fn new(shaper: Arc<dyn LinkShaper>, endpoints: Vec<String>, settle: Duration) -> Self {
        let endpoints = if endpoints.is_empty() {
            vec![String::new()]
        } else {
            endpoints
        };
        Self {
            shaper,
            endpoints,
            lock: Mutex::new(()),
            settle,
        }
    }

    /// Controller that never touches the network and never waits
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopShaper), Vec::new(), Duration::ZERO)
    }

    /// Apply `profile` on every endpoint, then settle
    ///
    /// Returns `false` when any endpoint could not be shaped.
    pub async fn apply_profile(&self, profile: &NetworkProfile) -> bool {
        let _guard = self.lock.lock().await;
        debug!("Applying network profile {} via {}", profile, self.shaper.name());

        let mut all_applied = true;
        for endpoint in &self.endpoints {
            if let Err(e) = self.shaper.apply(endpoint, profile).await {
                warn!(
                    "Failed to apply {} on '{}': {}; continuing under current conditions",
                    profile, endpoint, e
                );
                all_applied = false;
            }
        }

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        all_applied
    }

    /// Remove shaping from every endpoint
    pub async fn clear_all(&self) {
        let _guard = self.lock.lock().await;
        for endpoint in &self.endpoints {
            if let Err(e) = self.shaper.clear(endpoint).await {
                warn!("Failed to clear shaping on '{}': {}", endpoint, e);
            }
        }
        info!("Cleared network shaping on {} endpoint(s)", self.endpoints.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::LossPercent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn profile(bandwidth: Bandwidth, delay_ms: u64, loss: f64) -> NetworkProfile {
        NetworkProfile::new(bandwidth, delay_ms, LossPercent::new(loss).unwrap())
    }

    #[test]
    fn test_netem_args() {
        let args = build_netem_args("eth0", &profile(Bandwidth::Kbit(50), 100, 5.0));
        assert_eq!(
            args.join(" "),
            "qdisc add dev eth0 root netem delay 100ms 10ms loss 5% rate 50kbit"
        );

        let args = build_netem_args("veth0", &profile(Bandwidth::Kbit(1000), 0, 0.5));
        assert_eq!(
            args.join(" "),
            "qdisc add dev veth0 root netem delay 0ms loss 0.5% rate 1000kbit"
        );
    }

    #[test]
    fn test_command_prefix() {
        let tc = build_clear_args("eth0");
        let (program, args) = command_for("docker exec node1", &tc);
        assert_eq!(program, "docker");
        assert_eq!(args.join(" "), "exec node1 tc qdisc del dev eth0 root");

        let (program, args) = command_for("  ", &tc);
        assert_eq!(program, "tc");
        assert_eq!(args, tc);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tc_shaper_runs_through_prefix() {
        let shaper = TcNetemShaper::new("eth0");
        let p = profile(Bandwidth::Kbit(50), 20, 1.0);
        // `true tc ...` succeeds regardless of its arguments
        assert!(shaper.apply("true", &p).await.is_ok());

        // `false` fails both commands; only the add failure is reported
        match shaper.apply("false", &p).await {
            Err(ShaperError::Command { command, .. }) => assert!(command.contains("netem")),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        // Clearing tolerates a failing removal
        assert!(shaper.clear("false").await.is_ok());
        // Unlimited only clears
        assert!(shaper.apply("false", &profile(Bandwidth::Unlimited, 0, 0.0)).await.is_ok());

        assert!(matches!(
            shaper.apply("/nonexistent/lpwan-prefix", &p).await,
            Err(ShaperError::Spawn(_))
        ));
    }

    /// Fails every call and tracks concurrent entries
    #[derive(Default)]
    struct ContendedShaper {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LinkShaper for ContendedShaper {
        async fn apply(&self, _endpoint: &str, _profile: &NetworkProfile) -> Result<(), ShaperError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Err(ShaperError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no tc",
            )))
        }

        async fn clear(&self, _endpoint: &str) -> Result<(), ShaperError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "contended"
        }
    }

    #[tokio::test]
    async fn test_profile_changes_are_serialized_and_non_fatal() {
        let shaper = Arc::new(ContendedShaper::default());
        let controller = Arc::new(NetworkController::new(
            shaper.clone(),
            vec!["node1".into(), "node2".into()],
            Duration::from_millis(2),
        ));

        let mut handles = Vec::new();
        for delay in [0, 20, 100, 500] {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                controller
                    .apply_profile(&profile(Bandwidth::Kbit(50), delay, 1.0))
                    .await
            }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap());
        }

        assert_eq!(shaper.calls.load(Ordering::SeqCst), 8);
        assert_eq!(shaper.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_noop_controller() {
        let controller = NetworkController::noop();
        assert!(controller.apply_profile(&profile(Bandwidth::Unlimited, 0, 0.0)).await);
        controller.clear_all().await;
    }
}
