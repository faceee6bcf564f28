use anyhow::{bail, Result};
use async_trait::async_trait;
use lpwan_bench::{
    experiment::ConfigKey,
    metrics::{LatencySample, MetricsSnapshot},
    Bandwidth, ExperimentConfiguration, LossPercent, Protocol, ResultRecord, ResultStore,
    SweepDriver, SweepPlan, TrialRunner,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Runner that fabricates results without touching the network
///
/// Partial-loss trials deliver nothing on the first attempt, total-loss
/// trials never deliver, and everything else delivers every message.
#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<HashMap<ConfigKey, usize>>,
    fail_after: Option<usize>,
}

impl ScriptedRunner {
    fn failing_after(trials: usize) -> Self {
        Self {
            fail_after: Some(trials),
            ..Default::default()
        }
    }

    fn calls_for(&self, config: &ExperimentConfiguration) -> usize {
        self.calls.lock().get(&config.key()).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl TrialRunner for ScriptedRunner {
    async fn run_trial(&self, config: &ExperimentConfiguration) -> Result<ResultRecord> {
        let attempt = {
            let mut calls = self.calls.lock();
            if let Some(limit) = self.fail_after {
                if calls.values().sum::<usize>() >= limit {
                    bail!("simulated crash");
                }
            }
            let entry = calls.entry(config.key()).or_insert(0);
            *entry += 1;
            *entry
        };

        let delivered = if config.loss.is_total() {
            0
        } else if config.loss.value() > 0.0 && attempt == 1 {
            0
        } else {
            config.expected_messages()
        };

        let snapshot = MetricsSnapshot::from_samples(
            (0..delivered)
                .map(|sequence| LatencySample {
                    sequence,
                    send_timestamp: sequence as f64,
                    latency_ms: 2.0 + (sequence % 3) as f64,
                })
                .collect(),
        );
        Ok(ResultRecord::from_trial(config, &snapshot))
    }
}

fn plan() -> SweepPlan {
    SweepPlan {
        payload_sizes: vec![16],
        rates: vec![10.0],
        bandwidths: vec![Bandwidth::Unlimited],
        losses: vec![
            "0%".parse().unwrap(),
            "5%".parse().unwrap(),
            LossPercent::new(100.0).unwrap(),
        ],
        delays: vec![0, 20],
        duration: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn resume_reruns_only_inconclusive_trials() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Arc::new(ScriptedRunner::default());

    let first = SweepDriver::new(plan(), runner.clone(), ResultStore::new(dir.path()));
    let summary = first.run(Protocol::MqttSn).await?;
    assert_eq!(summary.total, 6);
    assert_eq!(summary.executed, 6);
    assert_eq!(summary.skipped, 0);

    let store = ResultStore::new(dir.path());
    assert_eq!(store.load(Protocol::MqttSn)?.len(), 6);
    // 0% and 100% loss are done; 5% delivered nothing and is retried
    assert_eq!(store.load_ledger(Protocol::MqttSn)?.len(), 4);

    // A fresh driver over the same directory, as after a restart
    let second = SweepDriver::new(plan(), runner.clone(), ResultStore::new(dir.path()));
    let summary = second.run(Protocol::MqttSn).await?;
    assert_eq!(summary.executed, 2);
    assert_eq!(summary.skipped, 4);

    for config in plan().configurations(Protocol::MqttSn) {
        let expected = if config.loss.value() == 5.0 { 2 } else { 1 };
        assert_eq!(runner.calls_for(&config), expected, "{}", config);
    }

    // Retried rows are appended, the original zero-delivery rows stay
    let rows = store.load(Protocol::MqttSn)?;
    assert_eq!(rows.len(), 8);
    assert_eq!(rows.iter().filter(|r| r.received == 0).count(), 4);

    let progress = plan().progress(&store, Protocol::MqttSn)?;
    assert_eq!(progress.completed, progress.total);

    // Nothing left to do
    let third = SweepDriver::new(plan(), runner.clone(), ResultStore::new(dir.path()));
    assert_eq!(third.run(Protocol::MqttSn).await?.executed, 0);
    assert_eq!(runner.total_calls(), 8);
    Ok(())
}

#[tokio::test]
async fn crashed_sweep_keeps_finished_trials() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let crashing = Arc::new(ScriptedRunner::failing_after(3));
    let driver = SweepDriver::new(plan(), crashing, ResultStore::new(dir.path()));
    let err = driver.run(Protocol::Tcp).await.unwrap_err();
    assert!(format!("{:#}", err).contains("simulated crash"));

    let store = ResultStore::new(dir.path());
    assert_eq!(store.load(Protocol::Tcp)?.len(), 3);

    let runner = Arc::new(ScriptedRunner::default());
    let driver = SweepDriver::new(plan(), runner.clone(), ResultStore::new(dir.path()));
    let summary = driver.run(Protocol::Tcp).await?;

    // First three: 0%/0ms, 0%/20ms (done), 5%/0ms (zero delivery, retried)
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.executed, 4);
    assert_eq!(runner.total_calls(), 4);
    Ok(())
}

#[tokio::test]
async fn tables_are_kept_per_protocol() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Arc::new(ScriptedRunner::default());
    let driver = SweepDriver::new(plan(), runner.clone(), ResultStore::new(dir.path()));

    driver.run(Protocol::CoapCon).await?;
    let summary = driver.run(Protocol::CoapNon).await?;

    // CoAP CON rows never mark CoAP NON configurations done
    assert_eq!(summary.executed, 6);
    assert!(dir.path().join("results_coap_con.csv").exists());
    assert!(dir.path().join("results_coap_non.csv").exists());
    assert!(!dir.path().join("results_tcp.csv").exists());
    Ok(())
}
