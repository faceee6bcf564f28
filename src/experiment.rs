//! # Experiment Model
//!
//! Value types describing one trial: the protocol and traffic parameters
//! (`ExperimentConfiguration`) and the network conditions it runs under
//! (`NetworkProfile`). Configurations are immutable once built; their
//! identity for resume purposes is `ConfigKey`.

use crate::cli::Protocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Bandwidth cap applied to a shaped link
///
/// `Unlimited` is distinct from every numeric cap and always translates to a
/// full clear of the shaping rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Bandwidth {
    Unlimited,
    Kbit(u64),
}

impl Bandwidth {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Bandwidth::Unlimited)
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Bandwidth::Unlimited => write!(f, "unlimited"),
            Bandwidth::Kbit(k) if k >= 1_000_000 && k % 1_000_000 == 0 => {
                write!(f, "{}gbit", k / 1_000_000)
            }
            Bandwidth::Kbit(k) if k >= 1_000 && k % 1_000 == 0 => write!(f, "{}mbit", k / 1_000),
            Bandwidth::Kbit(k) => write!(f, "{}kbit", k),
        }
    }
}

impl FromStr for Bandwidth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "0" || s == "unlimited" || s == "none" {
            return Ok(Bandwidth::Unlimited);
        }

        let (num_str, multiplier) = if let Some(n) = s.strip_suffix("gbit") {
            (n, 1_000_000)
        } else if let Some(n) = s.strip_suffix("mbit") {
            (n, 1_000)
        } else if let Some(n) = s.strip_suffix("kbit") {
            (n, 1)
        } else {
            return Err(format!(
                "Invalid bandwidth '{}': expected <n>kbit, <n>mbit, <n>gbit, 0 or unlimited",
                s
            ));
        };

        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number in bandwidth: {}", num_str))?;
        if num == 0 {
            return Ok(Bandwidth::Unlimited);
        }
        num.checked_mul(multiplier)
            .map(Bandwidth::Kbit)
            .ok_or_else(|| format!("Bandwidth '{}' is out of range", s))
    }
}

impl TryFrom<String> for Bandwidth {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Bandwidth> for String {
    fn from(value: Bandwidth) -> Self {
        value.to_string()
    }
}

/// Packet loss probability in percent (0..=100)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LossPercent(f64);

impl LossPercent {
    pub fn new(percent: f64) -> Result<Self, String> {
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(format!("Loss must be within 0..=100 percent, got {}", percent));
        }
        Ok(Self(percent))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Every packet is dropped
    pub fn is_total(&self) -> bool {
        self.0 >= 100.0
    }
}

impl fmt::Display for LossPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

impl FromStr for LossPercent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let num_str = trimmed.strip_suffix('%').unwrap_or(trimmed);
        let percent: f64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid loss percentage: {}", s))?;
        Self::new(percent)
    }
}

/// Shaping rule set for one network path
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub bandwidth: Bandwidth,
    pub delay_ms: u64,
    pub jitter_ms: u64,
    pub loss: LossPercent,
}

impl NetworkProfile {
    /// Build a profile whose jitter is derived as 10% of the delay
    pub fn new(bandwidth: Bandwidth, delay_ms: u64, loss: LossPercent) -> Self {
        Self {
            bandwidth,
            delay_ms,
            jitter_ms: delay_ms / 10,
            loss,
        }
    }
}

impl fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bw={} delay={}ms jitter={}ms loss={}",
            self.bandwidth, self.delay_ms, self.jitter_ms, self.loss
        )
    }
}

/// Everything needed to run one trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    pub protocol: Protocol,
    pub payload_size: usize,
    pub rate: f64,
    pub bandwidth: Bandwidth,
    pub loss: LossPercent,
    pub delay_ms: u64,
    pub duration: Duration,
}

impl ExperimentConfiguration {
    pub fn key(&self) -> ConfigKey {
        ConfigKey::new(
            self.protocol,
            self.payload_size,
            self.rate,
            self.bandwidth,
            self.loss,
            self.delay_ms,
        )
    }

    pub fn network_profile(&self) -> NetworkProfile {
        NetworkProfile::new(self.bandwidth, self.delay_ms, self.loss)
    }

    /// Number of envelopes the sender is asked to emit: floor(rate * duration)
    pub fn expected_messages(&self) -> u64 {
        expected_messages(self.rate, self.duration)
    }
}

impl fmt::Display for ExperimentConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proto={} size={} rate={} bw={} loss={} delay={}ms",
            self.protocol, self.payload_size, self.rate, self.bandwidth, self.loss, self.delay_ms
        )
    }
}

pub fn expected_messages(rate: f64, duration: Duration) -> u64 {
    if rate <= 0.0 || !rate.is_finite() {
        return 0;
    }
    (rate * duration.as_secs_f64()).floor() as u64
}

/// Identity of a configuration in the completion ledger
///
/// Floats are compared by bit pattern; values that round-trip through the
/// result table keep their exact representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    protocol: Protocol,
    payload_size: usize,
    rate_bits: u64,
    bandwidth: Bandwidth,
    loss_bits: u64,
    delay_ms: u64,
}

impl ConfigKey {
    pub fn new(
        protocol: Protocol,
        payload_size: usize,
        rate: f64,
        bandwidth: Bandwidth,
        loss: LossPercent,
        delay_ms: u64,
    ) -> Self {
        Self {
            protocol,
            payload_size,
            rate_bits: normalize(rate).to_bits(),
            bandwidth,
            loss_bits: normalize(loss.value()).to_bits(),
            delay_ms,
        }
    }
}

// -0.0 and 0.0 must hash alike
fn normalize(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}
