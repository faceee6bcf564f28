//! # Parallel Coordinator
//!
//! One sweep worker per protocol, all running concurrently. A failing or
//! panicking worker is reported against its protocol and never cancels the
//! others; `run_all` returns once every worker has finished.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cli::Protocol;
use crate::executor::TrialRunner;
use crate::sweep::{SweepDriver, SweepSummary};

/// Terminal state of one protocol's sweep
#[derive(Debug)]
pub struct ProtocolOutcome {
    pub protocol: Protocol,
    pub result: Result<SweepSummary>,
}

impl ProtocolOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct Coordinator;

impl Coordinator {
    /// Run every protocol's sweep concurrently and wait for all of them
    pub async fn run_all<R>(driver: Arc<SweepDriver<R>>, protocols: &[Protocol]) -> Vec<ProtocolOutcome>
    where
        R: TrialRunner + ?Sized + 'static,
    {
        let protocols = unique(protocols);
        info!("Starting {} protocol worker(s)", protocols.len());

        let handles: Vec<_> = protocols
            .iter()
            .map(|&protocol| {
                let driver = driver.clone();
                (protocol, tokio::spawn(async move { driver.run(protocol).await }))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (protocol, handle) in handles {
            outcomes.push(Self::join(protocol, handle).await);
        }
        outcomes
    }

    /// Run the protocols one after another, still isolating failures
    pub async fn run_sequential<R>(
        driver: Arc<SweepDriver<R>>,
        protocols: &[Protocol],
    ) -> Vec<ProtocolOutcome>
    where
        R: TrialRunner + ?Sized + 'static,
    {
        let mut outcomes = Vec::new();
        for protocol in unique(protocols) {
            let driver = driver.clone();
            let handle = tokio::spawn(async move { driver.run(protocol).await });
            outcomes.push(Self::join(protocol, handle).await);
        }
        outcomes
    }

    async fn join(protocol: Protocol, handle: JoinHandle<Result<SweepSummary>>) -> ProtocolOutcome {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow!("{} worker panicked", protocol)),
            Err(e) => Err(anyhow!("{} worker was cancelled: {}", protocol, e)),
        };
        Self::report(protocol, result)
    }

    fn report(protocol: Protocol, result: Result<SweepSummary>) -> ProtocolOutcome {
        match &result {
            Ok(summary) => info!(
                "[{}] Worker finished ({} executed, {} skipped of {})",
                protocol, summary.executed, summary.skipped, summary.total
            ),
            Err(e) => error!("[{}] Worker failed: {:#}", protocol, e),
        }
        ProtocolOutcome { protocol, result }
    }
}

fn unique(protocols: &[Protocol]) -> Vec<Protocol> {
    let mut seen = Vec::with_capacity(protocols.len());
    for &p in protocols {
        if p != Protocol::All && !seen.contains(&p) {
            seen.push(p);
        }
    }
    seen
}
