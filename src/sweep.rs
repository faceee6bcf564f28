use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cli::{GridArgs, Protocol};
use crate::executor::TrialRunner;
use crate::experiment::{Bandwidth, ExperimentConfiguration, LossPercent};
use crate::results::{ProtocolProgress, ResultStore};

/// Cartesian parameter space swept for every protocol
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub payload_sizes: Vec<usize>,
    pub rates: Vec<f64>,
    pub bandwidths: Vec<Bandwidth>,
    pub losses: Vec<LossPercent>,
    pub delays: Vec<u64>,
    pub duration: Duration,
}

impl SweepPlan {
    pub fn from_args(args: &GridArgs) -> Result<Self> {
        let plan = Self {
            payload_sizes: args.sizes.clone(),
            rates: args.rates.clone(),
            bandwidths: args.bandwidths.clone(),
            losses: args.losses.clone(),
            delays: args.delays.clone(),
            duration: args.duration,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        for &size in &self.payload_sizes {
            crate::utils::validate_payload_size(size)?;
        }
        for &rate in &self.rates {
            crate::utils::validate_rate(rate)?;
        }
        crate::utils::validate_duration(self.duration)?;
        if self.total() == 0 {
            anyhow::bail!("Sweep is empty: every parameter list needs at least one value");
        }
        Ok(())
    }

    /// Every configuration for `protocol`, nested size > rate > bandwidth > loss > delay
    pub fn configurations(&self, protocol: Protocol) -> Vec<ExperimentConfiguration> {
        let mut configs = Vec::with_capacity(self.total());
        for &payload_size in &self.payload_sizes {
            for &rate in &self.rates {
                for &bandwidth in &self.bandwidths {
                    for &loss in &self.losses {
                        for &delay_ms in &self.delays {
                            configs.push(ExperimentConfiguration {
                                protocol,
                                payload_size,
                                rate,
                                bandwidth,
                                loss,
                                delay_ms,
                                duration: self.duration,
                            });
                        }
                    }
                }
            }
        }
        configs
    }

    pub fn total(&self) -> usize {
        self.payload_sizes.len()
            * self.rates.len()
            * self.bandwidths.len()
            * self.losses.len()
            * self.delays.len()
    }

    /// How much of this plan the protocol's table already covers
    pub fn progress(&self, store: &ResultStore, protocol: Protocol) -> Result<ProtocolProgress> {
        let ledger = store.load_ledger(protocol)?;
        let completed = self
            .configurations(protocol)
            .iter()
            .filter(|c| ledger.is_done(c))
            .count();
        Ok(ProtocolProgress {
            protocol,
            completed,
            total: self.total(),
        })
    }
}

impl Default for SweepPlan {
    fn default() -> Self {
        use crate::defaults;

        Self {
            payload_sizes: defaults::PAYLOAD_SIZES.to_vec(),
            rates: defaults::RATES.to_vec(),
            bandwidths: defaults::BANDWIDTHS
                .iter()
                .filter_map(|b| b.parse().ok())
                .collect(),
            losses: defaults::LOSSES.iter().filter_map(|l| l.parse().ok()).collect(),
            delays: defaults::DELAYS.to_vec(),
            duration: defaults::DURATION,
        }
    }
}

/// What one protocol's sweep did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub protocol: Protocol,
    pub total: usize,
    pub executed: usize,
    pub skipped: usize,
}

/// Walks the plan for one protocol, one trial at a time
///
/// The protocol's table is loaded before enumeration starts, so a restarted
/// sweep resumes at the first configuration that is not done.
pub struct SweepDriver<R: TrialRunner + ?Sized> {
    plan: SweepPlan,
    runner: Arc<R>,
    store: ResultStore,
}

impl<R: TrialRunner + ?Sized> SweepDriver<R> {
    pub fn new(plan: SweepPlan, runner: Arc<R>, store: ResultStore) -> Self {
        Self {
            plan,
            runner,
            store,
        }
    }

    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub async fn run(&self, protocol: Protocol) -> Result<SweepSummary> {
        let mut ledger = self
            .store
            .load_ledger(protocol)
            .with_context(|| format!("Failed to load the {} result table", protocol))?;

        let configs = self.plan.configurations(protocol);
        let total = configs.len();
        info!(
            "[{}] Sweep of {} configurations, {} already complete",
            protocol,
            total,
            ledger.len()
        );

        let mut summary = SweepSummary {
            protocol,
            total,
            executed: 0,
            skipped: 0,
        };

        for (index, config) in configs.iter().enumerate() {
            if ledger.is_done(config) {
                summary.skipped += 1;
                debug!("[{}] Skipping completed {}", protocol, config);
                continue;
            }

            info!(
                "[{}] {} {}/{} {}",
                protocol,
                crate::utils::create_progress_indicator(index, total, 20),
                index + 1,
                total,
                config
            );

            let record = self
                .runner
                .run_trial(config)
                .await
                .with_context(|| format!("Trial failed: {}", config))?;
            self.store
                .append(&record)
                .with_context(|| format!("Failed to record trial: {}", config))?;
            ledger.record(&record);
            summary.executed += 1;
        }

        info!(
            "[{}] Sweep finished: {} executed, {} skipped",
            protocol, summary.executed, summary.skipped
        );
        Ok(summary)
    }
}
