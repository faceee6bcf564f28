use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lpwan_bench::{
    metrics::{LatencySample, MetricsSnapshot},
    Bandwidth, Coordinator, ExperimentConfiguration, LossPercent, Protocol, ResultRecord,
    ResultStore, SweepDriver, SweepPlan, TrialRunner,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails every MQTT-SN trial and panics on the second CoAP CON trial
#[derive(Default)]
struct FlakyRunner {
    coap_con_trials: AtomicUsize,
    trials: AtomicUsize,
}

#[async_trait]
impl TrialRunner for FlakyRunner {
    async fn run_trial(&self, config: &ExperimentConfiguration) -> Result<ResultRecord> {
        self.trials.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;

        match config.protocol {
            Protocol::MqttSn => return Err(anyhow!("gateway unreachable")),
            Protocol::CoapCon => {
                if self.coap_con_trials.fetch_add(1, Ordering::SeqCst) == 1 {
                    panic!("receiver state corrupted");
                }
            }
            _ => {}
        }

        let snapshot = MetricsSnapshot::from_samples(vec![LatencySample {
            sequence: 0,
            send_timestamp: 0.0,
            latency_ms: 1.5,
        }]);
        Ok(ResultRecord::from_trial(config, &snapshot))
    }
}

fn plan() -> SweepPlan {
    SweepPlan {
        payload_sizes: vec![16, 128],
        rates: vec![1.0],
        bandwidths: vec![Bandwidth::Kbit(50)],
        losses: vec![LossPercent::new(0.0).unwrap()],
        delays: vec![0, 100],
        duration: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn failing_protocols_do_not_stop_the_others() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Arc::new(FlakyRunner::default());
    let driver = Arc::new(SweepDriver::new(plan(), runner, ResultStore::new(dir.path())));

    let outcomes = Coordinator::run_all(driver, &Protocol::expand_all(vec![Protocol::All])).await;
    assert_eq!(outcomes.len(), 4);

    for outcome in &outcomes {
        match outcome.protocol {
            Protocol::Tcp | Protocol::CoapNon => {
                let summary = outcome.result.as_ref().map_err(|e| anyhow!("{:#}", e))?;
                assert_eq!(summary.executed, 4);
            }
            Protocol::MqttSn => {
                let err = outcome.result.as_ref().unwrap_err();
                assert!(format!("{:#}", err).contains("gateway unreachable"));
            }
            Protocol::CoapCon => {
                let err = outcome.result.as_ref().unwrap_err();
                assert!(err.to_string().contains("panicked"));
            }
            Protocol::All => unreachable!(),
        }
    }

    let store = ResultStore::new(dir.path());
    assert_eq!(store.load(Protocol::Tcp)?.len(), 4);
    assert_eq!(store.load(Protocol::CoapNon)?.len(), 4);
    assert!(store.load(Protocol::MqttSn)?.is_empty());
    // The trial finished before the panic is kept
    assert_eq!(store.load(Protocol::CoapCon)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn sequential_run_reports_every_protocol() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Arc::new(FlakyRunner::default());
    let driver = Arc::new(SweepDriver::new(plan(), runner.clone(), ResultStore::new(dir.path())));

    let outcomes =
        Coordinator::run_sequential(driver, &[Protocol::MqttSn, Protocol::Tcp, Protocol::MqttSn])
            .await;

    let protocols: Vec<_> = outcomes.iter().map(|o| o.protocol).collect();
    assert_eq!(protocols, vec![Protocol::MqttSn, Protocol::Tcp]);
    assert!(!outcomes[0].is_success());
    assert!(outcomes[1].is_success());
    // MQTT-SN stops at its first failing trial
    assert_eq!(runner.trials.load(Ordering::SeqCst), 1 + 4);
    Ok(())
}

#[tokio::test]
async fn sequential_run_survives_a_panicking_protocol() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Arc::new(FlakyRunner::default());
    let driver = Arc::new(SweepDriver::new(plan(), runner, ResultStore::new(dir.path())));

    let outcomes = Coordinator::run_sequential(driver, &[Protocol::CoapCon, Protocol::Tcp]).await;

    assert_eq!(outcomes.len(), 2);
    let err = outcomes[0].result.as_ref().unwrap_err();
    assert!(err.to_string().contains("panicked"));
    assert_eq!(outcomes[1].result.as_ref().map(|s| s.executed).ok(), Some(4));

    let store = ResultStore::new(dir.path());
    assert_eq!(store.load(Protocol::CoapCon)?.len(), 1);
    assert_eq!(store.load(Protocol::Tcp)?.len(), 4);
    Ok(())
}
