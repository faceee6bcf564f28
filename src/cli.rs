use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::experiment::{Bandwidth, LossPercent};

/// LPWAN Bench - messaging protocol sweeps under emulated degraded networks
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false, global = true)]
    pub quiet: bool,

    /// Also write logs (uncolored) to this file
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the full parameter sweep for one or more protocols
    Sweep(SweepArgs),
    /// Run a single sender or receiver agent
    Agent(AgentArgs),
    /// Report sweep progress from the result tables
    Status(StatusArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SweepArgs {
    /// Protocols to benchmark (space-separated: tcp, mqtt-sn, coap-con, coap-non, or all)
    #[clap(short = 'p', long, value_enum, default_values_t = vec![Protocol::All], help_heading = "Core Options", num_args = 1..)]
    pub protocols: Vec<Protocol>,

    #[clap(flatten)]
    pub grid: GridArgs,

    /// Directory holding the per-protocol result tables
    #[clap(short = 'o', long, default_value = crate::defaults::RESULTS_DIR)]
    pub results_dir: PathBuf,

    /// Host the sender targets
    #[clap(long, default_value = "127.0.0.1", help_heading = "Placement")]
    pub target_host: String,

    /// Address the receiver binds to
    #[clap(long, default_value = "0.0.0.0", help_heading = "Placement")]
    pub bind_host: String,

    /// Where the receiver runs
    #[clap(long, value_enum, default_value_t = ReceiverMode::InProcess, help_heading = "Placement")]
    pub receiver_mode: ReceiverMode,

    /// Grace period between receiver start and sender start
    #[clap(long, value_parser = parse_duration, default_value = "2s", help_heading = "Timing")]
    pub receiver_grace: Duration,

    /// Settling period after a network profile change
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Timing")]
    pub settle: Duration,

    /// Drain period after the receiver has been stopped
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Timing")]
    pub drain: Duration,

    /// Traffic shaping backend
    #[clap(long, value_enum, default_value_t = ShaperKind::None, help_heading = "Network Emulation")]
    pub shaper: ShaperKind,

    /// Command prefix for each shaped host (e.g. "docker exec node1"); repeat per host
    #[clap(long = "shaper-endpoint", help_heading = "Network Emulation")]
    pub shaper_endpoints: Vec<String>,

    /// Interface the shaping rules are installed on
    #[clap(long, default_value = "eth0", help_heading = "Network Emulation")]
    pub interface: String,

    /// Run protocols one after another instead of concurrently
    #[clap(long, default_value_t = false)]
    pub sequential: bool,
}

/// The parameter grid swept for every protocol
#[derive(ClapArgs, Debug, Clone)]
pub struct GridArgs {
    /// Payload sizes in bytes
    #[clap(long, value_delimiter = ',', default_values_t = crate::defaults::PAYLOAD_SIZES.to_vec())]
    pub sizes: Vec<usize>,

    /// Send rates in messages per second
    #[clap(long, value_delimiter = ',', default_values_t = crate::defaults::RATES.to_vec())]
    pub rates: Vec<f64>,

    /// Bandwidth caps (e.g. 50kbit, 1mbit, 0 or unlimited)
    #[clap(long, value_delimiter = ',', default_values = crate::defaults::BANDWIDTHS)]
    pub bandwidths: Vec<Bandwidth>,

    /// Packet loss percentages (e.g. 0%, 5, 10%)
    #[clap(long, value_delimiter = ',', default_values = crate::defaults::LOSSES)]
    pub losses: Vec<LossPercent>,

    /// One-way delays in milliseconds (jitter is derived as 10% of delay)
    #[clap(long, value_delimiter = ',', default_values_t = crate::defaults::DELAYS.to_vec())]
    pub delays: Vec<u64>,

    /// Duration of each trial
    #[clap(short = 'd', long, value_parser = parse_duration, default_value = "10s")]
    pub duration: Duration,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct AgentArgs {
    /// Role this agent plays
    #[clap(long, value_enum)]
    pub role: AgentRole,

    /// Protocol to speak
    #[clap(short = 'p', long, value_enum)]
    pub protocol: Protocol,

    /// Target host (sender) or bind address (receiver)
    #[clap(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port override; defaults to the protocol's well-known port
    #[clap(long)]
    pub port: Option<u16>,

    /// Payload size in bytes
    #[clap(short = 's', long, default_value_t = 128)]
    pub size: usize,

    /// Send rate in messages per second
    #[clap(short = 'r', long, default_value_t = 1.0)]
    pub rate: f64,

    /// Send duration
    #[clap(short = 'd', long, value_parser = parse_duration, default_value = "10s")]
    pub duration: Duration,

    /// Raw sample file the receiver writes on shutdown
    #[clap(long, default_value = "results.json")]
    pub samples_file: PathBuf,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct StatusArgs {
    /// Directory holding the per-protocol result tables
    #[clap(short = 'o', long, default_value = crate::defaults::RESULTS_DIR)]
    pub results_dir: PathBuf,

    /// Protocols to report on
    #[clap(short = 'p', long, value_enum, default_values_t = vec![Protocol::All], num_args = 1..)]
    pub protocols: Vec<Protocol>,

    #[clap(flatten)]
    pub grid: GridArgs,
}

/// Messaging protocols that can be benchmarked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Length-prefixed frames over a TCP stream
    #[clap(name = "tcp")]
    Tcp,

    /// MQTT-SN QoS 0 PUBLISH datagrams over UDP
    #[clap(name = "mqtt-sn")]
    MqttSn,

    /// Confirmable CoAP PUT (acknowledged request/response)
    #[clap(name = "coap-con")]
    CoapCon,

    /// Non-confirmable CoAP PUT
    #[clap(name = "coap-non")]
    CoapNon,

    /// All available protocols
    #[clap(name = "all")]
    #[serde(skip)]
    All,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Protocol {
    /// Expand the "All" variant to all available protocols
    pub fn expand_all(protocols: Vec<Protocol>) -> Vec<Protocol> {
        if protocols.contains(&Protocol::All) {
            vec![
                Protocol::Tcp,
                Protocol::MqttSn,
                Protocol::CoapCon,
                Protocol::CoapNon,
            ]
        } else {
            let mut unique = protocols;
            unique.sort();
            unique.dedup();
            unique
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::MqttSn => "mqtt-sn",
            Protocol::CoapCon => "coap-con",
            Protocol::CoapNon => "coap-non",
            Protocol::All => "all",
        }
    }

    /// File-system friendly name used for the result table
    pub fn table_name(&self) -> String {
        self.as_str().replace('-', "_")
    }

    /// Well-known port the receiver listens on
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Tcp => 9000,
            Protocol::MqttSn => 1884,
            Protocol::CoapCon => 5683,
            Protocol::CoapNon => 5684,
            Protocol::All => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AgentRole {
    Sender,
    Receiver,
}

/// Where the trial's receiver runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReceiverMode {
    /// A task inside the sweep process
    #[clap(name = "in-process")]
    InProcess,
    /// A child `agent --role receiver` process stopped with SIGINT
    #[clap(name = "subprocess")]
    Subprocess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ShaperKind {
    /// Log profile changes without touching the network
    None,
    /// `tc qdisc ... netem` through each endpoint's command prefix
    Tc,
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if num < 0.0 {
        return Err(format!("Duration cannot be negative: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}
