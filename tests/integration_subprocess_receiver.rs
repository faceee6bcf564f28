#![cfg(unix)]

use anyhow::Result;
use lpwan_bench::{
    cli::ReceiverMode, Bandwidth, ExecutorSettings, ExperimentConfiguration, LossPercent,
    NetworkController, Protocol, RunExecutor, TrialRunner,
};
use std::sync::Arc;
use std::time::Duration;

fn free_udp_port() -> Result<u16> {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
    Ok(socket.local_addr()?.port())
}

/// Run a CoAP NON trial against a spawned `agent --role receiver` process.
///
/// The child is stopped with SIGINT, writes its raw samples file and the
/// executor rebuilds the metrics from it.
#[tokio::test]
async fn subprocess_receiver_flushes_samples_on_sigint() -> Result<()> {
    std::env::set_var("CARGO_BIN_EXE_lpwan-bench", env!("CARGO_BIN_EXE_lpwan-bench"));

    let dir = tempfile::tempdir()?;
    let raw_dir = dir.path().join("raw");
    let settings = ExecutorSettings {
        target_host: "127.0.0.1".to_string(),
        bind_host: "127.0.0.1".to_string(),
        port_override: Some(free_udp_port()?),
        // Leave time for the child to start and bind
        receiver_grace: Duration::from_millis(750),
        drain: Duration::from_millis(50),
        stop_grace: Duration::from_secs(5),
        placement: ReceiverMode::Subprocess,
        raw_dir: raw_dir.clone(),
    };
    let executor = RunExecutor::new(settings, Arc::new(NetworkController::noop()));

    let config = ExperimentConfiguration {
        protocol: Protocol::CoapNon,
        payload_size: 64,
        rate: 20.0,
        bandwidth: Bandwidth::Unlimited,
        loss: LossPercent::new(0.0).unwrap(),
        delay_ms: 0,
        duration: Duration::from_secs(1),
    };
    let record = executor.run_trial(&config).await?;

    assert_eq!(record.sent, 20);
    assert!(record.received >= 18, "received {}", record.received);

    let files: Vec<_> = std::fs::read_dir(&raw_dir)?.collect::<Result<_, _>>()?;
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().to_string_lossy().into_owned();
    assert!(name.starts_with("coap_non-") && name.ends_with(".json"), "{}", name);
    Ok(())
}
