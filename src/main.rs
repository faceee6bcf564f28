//! # LPWAN Bench - Main Entry Point
//!
//! Dispatches the three subcommands:
//!
//! - `sweep`: run the parameter sweep for one or more protocols, one
//!   concurrent worker per protocol, resuming from the result tables
//! - `agent`: run a single sender or receiver (the receiver side is what
//!   `sweep --receiver-mode subprocess` spawns)
//! - `status`: report how much of a sweep the result tables already cover
//!
//! ## Error Handling
//!
//! A failing protocol worker never stops the others. The process exits
//! with an error only when every requested protocol failed.

use anyhow::{bail, Result};
use clap::Parser;
use lpwan_bench::{
    cli::{AgentArgs, AgentRole, Args, Command, ShaperKind, StatusArgs, SweepArgs},
    coordinator::Coordinator,
    executor::{ExecutorSettings, RunExecutor},
    logging::init_logging,
    metrics::MetricsCollector,
    network::{LinkShaper, NetworkController, NoopShaper, TcNetemShaper},
    results::{ProgressReport, ResultStore},
    shutdown::Shutdown,
    sweep::{SweepDriver, SweepPlan},
    transport::Endpoint,
    utils, ProtocolAgent, Protocol, SendPlan,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Buffered file output is flushed when the guard drops
    let _log_guard = init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;

    match args.command {
        Command::Sweep(sweep) => run_sweep(sweep).await,
        Command::Agent(agent) => run_agent(agent).await,
        Command::Status(status) => run_status(status),
    }
}

/// Run the sweep for every requested protocol
///
/// Completed trials are appended to the tables as they finish, so an
/// interrupted sweep loses at most the trial in flight. On Ctrl-C the
/// shaping rules are cleared before exiting.
async fn run_sweep(args: SweepArgs) -> Result<()> {
    let protocols = Protocol::expand_all(args.protocols.clone());
    let plan = SweepPlan::from_args(&args.grid)?;

    info!("Starting LPWAN Bench v{}", lpwan_bench::VERSION);
    info!(
        "Sweeping {} configuration(s) per protocol across {} protocol(s), {} per trial",
        plan.total(),
        protocols.len(),
        utils::format_duration(plan.duration)
    );

    let shaper: Arc<dyn LinkShaper> = match args.shaper {
        ShaperKind::None => Arc::new(NoopShaper),
        ShaperKind::Tc => Arc::new(TcNetemShaper::new(args.interface.clone())),
    };
    let network = Arc::new(NetworkController::new(
        shaper,
        args.shaper_endpoints.clone(),
        args.settle,
    ));

    let settings = ExecutorSettings {
        target_host: args.target_host.clone(),
        bind_host: args.bind_host.clone(),
        port_override: None,
        receiver_grace: args.receiver_grace,
        drain: args.drain,
        stop_grace: lpwan_bench::defaults::STOP_GRACE,
        placement: args.receiver_mode,
        raw_dir: args.results_dir.join("raw"),
    };
    let executor = Arc::new(RunExecutor::new(settings, network.clone()));
    let driver = Arc::new(SweepDriver::new(
        plan,
        executor,
        ResultStore::new(&args.results_dir),
    ));

    let sweep = async {
        if args.sequential {
            Coordinator::run_sequential(driver.clone(), &protocols).await
        } else {
            Coordinator::run_all(driver.clone(), &protocols).await
        }
    };

    let outcomes = tokio::select! {
        outcomes = sweep => outcomes,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; completed trials are saved and will be skipped on the next run");
            network.clear_all().await;
            return Ok(());
        }
    };

    network.clear_all().await;

    let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_success()).collect();
    for outcome in &outcomes {
        match &outcome.result {
            Ok(summary) => info!(
                "{}: {} executed, {} skipped, {} total",
                outcome.protocol, summary.executed, summary.skipped, summary.total
            ),
            Err(e) => error!("{}: failed: {:#}", outcome.protocol, e),
        }
    }

    if !outcomes.is_empty() && failed.len() == outcomes.len() {
        bail!("Every protocol sweep failed");
    }

    info!("Results written to {:?}", args.results_dir);
    Ok(())
}

/// Run one side of a protocol exchange until done or interrupted
async fn run_agent(args: AgentArgs) -> Result<()> {
    if args.protocol == Protocol::All {
        bail!("The agent speaks a single protocol; `all` is only valid for sweeps");
    }
    let port = args.port.unwrap_or_else(|| args.protocol.default_port());
    let endpoint = Endpoint::new(args.host.clone(), port);
    let mut agent = ProtocolAgent::new(args.protocol, endpoint.clone())?;

    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        trigger.trigger();
    });

    match args.role {
        AgentRole::Receiver => {
            info!("{} receiver listening on {}", args.protocol, endpoint);
            let collector = Arc::new(MetricsCollector::new());
            let received = agent
                .run_receiver(collector, shutdown, Some(&args.samples_file))
                .await?;
            info!("{} receiver stopped after {} message(s)", args.protocol, received);
        }
        AgentRole::Sender => {
            utils::validate_payload_size(args.size)?;
            utils::validate_rate(args.rate)?;
            utils::validate_duration(args.duration)?;

            let plan = SendPlan {
                payload_size: args.size,
                rate: args.rate,
                duration: args.duration,
            };
            info!(
                "{} sender to {}: {} message(s) of {} bytes at {}/s",
                args.protocol,
                endpoint,
                plan.message_count(),
                plan.payload_size,
                plan.rate
            );
            let report = agent.run_sender(&plan, shutdown).await?;
            info!(
                "{} sender finished: {} attempted, {} failed",
                args.protocol, report.attempted, report.failed
            );
        }
    }
    Ok(())
}

fn run_status(args: StatusArgs) -> Result<()> {
    let plan = SweepPlan::from_args(&args.grid)?;
    let store = ResultStore::new(&args.results_dir);

    let protocols = Protocol::expand_all(args.protocols.clone())
        .into_iter()
        .map(|protocol| plan.progress(&store, protocol))
        .collect::<Result<Vec<_>>>()?;

    ProgressReport { protocols }.print();
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM where available
async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
