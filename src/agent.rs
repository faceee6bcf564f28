//! # Protocol Agent
//!
//! Runs one role (sender or receiver) of one protocol for one trial.
//!
//! Each role walks the same lifecycle:
//!
//! ```text
//! Init -> Connected -> Running -> (shutdown) -> Stopping -> Done
//! ```
//!
//! The receiver persists whatever it collected while `Stopping`; an
//! interrupted sender simply stops sending and reports the partial count.
//!
//! ## Pacing
//!
//! The sender is a best-effort fixed-rate loop: after each send it sleeps
//! for `max(0, interval - elapsed)`. Per-iteration overrun is compensated,
//! cumulative drift and bursts are not.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cli::Protocol;
use crate::experiment::expected_messages;
use crate::metrics::MetricsCollector;
use crate::payload::generate_payload;
use crate::shutdown::Shutdown;
use crate::transport::{Endpoint, Transport, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Init,
    Connected,
    Running,
    Stopping,
    Done,
}

/// What the sender is asked to emit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendPlan {
    pub payload_size: usize,
    pub rate: f64,
    pub duration: Duration,
}

impl SendPlan {
    pub fn message_count(&self) -> u64 {
        expected_messages(self.rate, self.duration)
    }

    /// Target loop period (1 / rate)
    pub fn interval(&self) -> Duration {
        if self.rate > 0.0 && self.rate.is_finite() {
            Duration::from_secs_f64(1.0 / self.rate)
        } else {
            Duration::ZERO
        }
    }
}

/// Outcome of a sender run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub attempted: u64,
    pub failed: u64,
}

pub struct ProtocolAgent {
    protocol: Protocol,
    endpoint: Endpoint,
    transport: Box<dyn Transport>,
    state: AgentState,
}

impl ProtocolAgent {
    /// Agent speaking `protocol` against (sender) or on (receiver) `endpoint`
    pub fn new(protocol: Protocol, endpoint: Endpoint) -> Result<Self> {
        let transport = TransportFactory::create(protocol)?;
        Ok(Self::with_transport(protocol, endpoint, transport))
    }

    pub fn with_transport(protocol: Protocol, endpoint: Endpoint, transport: Box<dyn Transport>) -> Self {
        Self {
            protocol,
            endpoint,
            transport,
            state: AgentState::Init,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn transition(&mut self, next: AgentState) {
        debug!(
            "{} agent on {}: {:?} -> {:?}",
            self.transport.name(),
            self.endpoint,
            self.state,
            next
        );
        self.state = next;
    }

    /// Bind the receiving socket (Init -> Connected)
    ///
    /// Split from `run_receiver` so callers can report bind failures before
    /// the sender starts and learn the bound address.
    pub async fn bind_receiver(&mut self) -> Result<()> {
        self.transport.bind(&self.endpoint).await?;
        self.transition(AgentState::Connected);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// Receive until `shutdown` fires, then flush
    ///
    /// When `samples_file` is given the collected samples are written there
    /// on the way out. Returns the number of distinct sequences collected.
    pub async fn run_receiver(
        &mut self,
        collector: Arc<MetricsCollector>,
        shutdown: Shutdown,
        samples_file: Option<&Path>,
    ) -> Result<usize> {
        if self.state == AgentState::Init {
            self.bind_receiver().await?;
        }

        self.transition(AgentState::Running);
        let served = self.transport.serve(collector.clone(), shutdown).await;
        self.transition(AgentState::Stopping);

        if let Err(e) = &served {
            warn!("{} receiver stopped with an error: {:#}", self.protocol, e);
        }

        let count = collector.count();
        if let Some(path) = samples_file {
            match collector.save_raw_samples(path) {
                Ok(written) if written > 0 => {
                    info!("Saved {} samples to {:?}", written, path)
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to save raw samples to {:?}: {:#}", path, e),
            }
        }

        self.transport.close().await?;
        self.transition(AgentState::Done);
        served.map(|_| count)
    }

    /// Send `floor(rate * duration)` envelopes paced at `1 / rate`
    ///
    /// Only a failure to set up the session is returned as an error; every
    /// per-message failure is counted and swallowed.
    pub async fn run_sender(&mut self, plan: &SendPlan, mut shutdown: Shutdown) -> Result<SendReport> {
        self.transport.connect(&self.endpoint).await?;
        self.transition(AgentState::Connected);

        let total = plan.message_count();
        let interval = plan.interval();
        let mut report = SendReport::default();

        self.transition(AgentState::Running);
        for sequence in 0..total {
            if shutdown.is_triggered() {
                break;
            }

            let started = Instant::now();
            let payload = generate_payload(sequence, plan.payload_size);
            if let Err(e) = self.transport.send(sequence, &payload).await {
                report.failed += 1;
                debug!("{} send of message {} failed: {}", self.protocol, sequence, e);
            }
            report.attempted += 1;

            let elapsed = started.elapsed();
            if elapsed < interval {
                tokio::select! {
                    _ = tokio::time::sleep(interval - elapsed) => {}
                    _ = shutdown.triggered() => break,
                }
            }
        }

        self.transition(AgentState::Stopping);
        if report.attempted < total {
            info!(
                "{} sender interrupted after {}/{} messages",
                self.protocol, report.attempted, total
            );
        }
        if let Err(e) = self.transport.close().await {
            debug!("Failed to close {} sender: {:#}", self.protocol, e);
        }
        self.transition(AgentState::Done);

        debug!(
            "{} sender finished: {} attempted, {} failed",
            self.protocol, report.attempted, report.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every send; fails every `fail_every`-th one
    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(u64, Instant)>>>,
        fail_every: u64,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&mut self, _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }

        async fn send(&mut self, sequence: u64, _payload: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().push((sequence, Instant::now()));
            if self.fail_every > 0 && sequence % self.fail_every == 0 {
                return Err(TransportError::Timeout);
            }
            Ok(())
        }

        async fn bind(&mut self, _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }

        async fn serve(&mut self, _collector: Arc<MetricsCollector>, mut shutdown: Shutdown) -> Result<()> {
            shutdown.triggered().await;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn agent(transport: RecordingTransport) -> ProtocolAgent {
        ProtocolAgent::with_transport(
            Protocol::Tcp,
            Endpoint::new("127.0.0.1", 0),
            Box::new(transport),
        )
    }

    #[test]
    fn test_send_plan() {
        let plan = SendPlan {
            payload_size: 16,
            rate: 10.0,
            duration: Duration::from_secs(10),
        };
        assert_eq!(plan.message_count(), 100);
        assert_eq!(plan.interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_sender_paces_and_never_runs_fast() {
        let transport = RecordingTransport::default();
        let sent = transport.sent.clone();
        let mut agent = agent(transport);

        let plan = SendPlan {
            payload_size: 64,
            rate: 50.0,
            duration: Duration::from_secs(1),
        };
        let started = Instant::now();
        let report = agent.run_sender(&plan, Shutdown::never()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.attempted, 50);
        assert_eq!(sent.lock().len(), 50);
        assert!(elapsed >= Duration::from_millis(990), "finished in {:?}", elapsed);
        assert_eq!(agent.state(), AgentState::Done);

        let sent = sent.lock();
        let sequences: Vec<u64> = sent.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, (0..50).collect::<Vec<_>>());
        let gaps_ok = sent
            .windows(2)
            .all(|w| w[1].1.duration_since(w[0].1) >= Duration::from_millis(19));
        assert!(gaps_ok);
    }

    #[tokio::test]
    async fn test_sender_swallows_send_failures() {
        let transport = RecordingTransport {
            fail_every: 3,
            ..Default::default()
        };
        let mut agent = agent(transport);
        let plan = SendPlan {
            payload_size: 16,
            rate: 1000.0,
            duration: Duration::from_millis(30),
        };
        let report = agent.run_sender(&plan, Shutdown::never()).await.unwrap();
        assert_eq!(report.attempted, 30);
        assert_eq!(report.failed, 10);
    }

    #[tokio::test]
    async fn test_interrupted_sender_reports_partial_count() {
        let transport = RecordingTransport::default();
        let mut agent = agent(transport);
        let plan = SendPlan {
            payload_size: 16,
            rate: 10.0,
            duration: Duration::from_secs(60),
        };

        let (trigger, shutdown) = Shutdown::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.trigger();
        });

        let report = agent.run_sender(&plan, shutdown).await.unwrap();
        assert!(report.attempted > 0 && report.attempted < 600);
        assert_eq!(agent.state(), AgentState::Done);
    }

    #[tokio::test]
    async fn test_receiver_flushes_on_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("samples.json");
        let mut agent = agent(RecordingTransport::default());

        let collector = Arc::new(MetricsCollector::new());
        collector.record(crate::utils::unix_time_secs(), 1);
        collector.record(crate::utils::unix_time_secs(), 2);

        let (trigger, shutdown) = Shutdown::channel();
        trigger.trigger();
        let count = agent
            .run_receiver(collector, shutdown, Some(&path))
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(agent.state(), AgentState::Done);
        assert_eq!(crate::metrics::load_raw_samples(&path).count, 2);
    }
}
