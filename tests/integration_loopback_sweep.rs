use anyhow::Result;
use async_trait::async_trait;
use lpwan_bench::{
    cli::ReceiverMode,
    network::ShaperError,
    Bandwidth, Coordinator, ExecutorSettings, ExperimentConfiguration, LinkShaper, LossPercent,
    NetworkController, NetworkProfile, Protocol, ResultStore, RunExecutor, SweepDriver, SweepPlan,
    TrialRunner,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Records profiles and the peak number of concurrent `apply` calls
#[derive(Default)]
struct RecordingShaper {
    active: AtomicUsize,
    max_active: AtomicUsize,
    applied: Mutex<Vec<NetworkProfile>>,
    cleared: AtomicUsize,
}

#[async_trait]
impl LinkShaper for RecordingShaper {
    async fn apply(&self, _endpoint: &str, profile: &NetworkProfile) -> Result<(), ShaperError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.applied.lock().push(*profile);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self, _endpoint: &str) -> Result<(), ShaperError> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

fn loopback_settings(raw_dir: &std::path::Path) -> ExecutorSettings {
    ExecutorSettings {
        target_host: "127.0.0.1".to_string(),
        bind_host: "127.0.0.1".to_string(),
        // Ephemeral ports let every protocol run at once without clashing
        port_override: Some(0),
        receiver_grace: Duration::from_millis(100),
        drain: Duration::from_millis(50),
        stop_grace: Duration::from_secs(2),
        placement: ReceiverMode::InProcess,
        raw_dir: raw_dir.to_path_buf(),
    }
}

fn config(protocol: Protocol, payload_size: usize) -> ExperimentConfiguration {
    ExperimentConfiguration {
        protocol,
        payload_size,
        rate: 20.0,
        bandwidth: Bandwidth::Unlimited,
        loss: LossPercent::new(0.0).unwrap(),
        delay_ms: 0,
        duration: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn every_protocol_delivers_over_loopback() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let executor = RunExecutor::new(
        loopback_settings(dir.path()),
        Arc::new(NetworkController::noop()),
    );

    for protocol in Protocol::expand_all(vec![Protocol::All]) {
        let record = executor.run_trial(&config(protocol, 128)).await?;
        assert_eq!(record.sent, 20, "{}", protocol);
        assert!(record.received >= 18, "{}: received {}", protocol, record.received);
        assert!(record.received <= record.sent);
        assert!(record.is_done());
        assert!(record.latency_avg_ms >= 0.0);
        assert!(record.latency_max_ms >= record.latency_p50_ms);
        let expected_bps = record.received as f64 * 128.0 * 8.0;
        assert!((record.throughput_bps - expected_bps).abs() < 1e-6);
    }
    Ok(())
}

#[tokio::test]
async fn large_payloads_survive_every_framing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let executor = RunExecutor::new(
        loopback_settings(dir.path()),
        Arc::new(NetworkController::noop()),
    );

    // Above the MQTT-SN short-form length and the CoAP extended option range
    for protocol in [Protocol::Tcp, Protocol::MqttSn, Protocol::CoapNon] {
        let record = executor.run_trial(&config(protocol, 4096)).await?;
        assert!(record.received > 0, "{} delivered nothing", protocol);
    }
    Ok(())
}

#[tokio::test]
async fn concurrent_sweeps_share_one_serialized_shaper() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let shaper = Arc::new(RecordingShaper::default());
    let network = Arc::new(NetworkController::new(
        shaper.clone(),
        Vec::new(),
        Duration::from_millis(5),
    ));
    let executor = Arc::new(RunExecutor::new(
        loopback_settings(&dir.path().join("raw")),
        network.clone(),
    ));

    let plan = SweepPlan {
        payload_sizes: vec![32],
        rates: vec![20.0],
        bandwidths: vec![Bandwidth::Kbit(1000)],
        losses: vec![LossPercent::new(0.0).unwrap()],
        delays: vec![0, 20],
        duration: Duration::from_secs(1),
    };
    let driver = Arc::new(SweepDriver::new(plan, executor, ResultStore::new(dir.path())));

    let protocols = Protocol::expand_all(vec![Protocol::All]);
    let outcomes = Coordinator::run_all(driver, &protocols).await;
    assert!(outcomes.iter().all(|o| o.is_success()));

    // One apply per trial, never two at once
    assert_eq!(shaper.applied.lock().len(), protocols.len() * 2);
    assert_eq!(shaper.max_active.load(Ordering::SeqCst), 1);
    assert!(shaper
        .applied
        .lock()
        .iter()
        .all(|p| p.bandwidth == Bandwidth::Kbit(1000) && p.jitter_ms == p.delay_ms / 10));

    let store = ResultStore::new(dir.path());
    for protocol in protocols {
        let rows = store.load(protocol)?;
        assert_eq!(rows.len(), 2, "{}", protocol);
        assert!(rows.iter().all(|r| r.received > 0), "{}", protocol);
    }

    network.clear_all().await;
    assert_eq!(shaper.cleared.load(Ordering::SeqCst), 1);
    Ok(())
}
