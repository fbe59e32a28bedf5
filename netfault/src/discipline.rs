//! The fault behaviours, and their translation into leaf qdiscs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use netfault_tc::tc::netem::NetemOptions;
use netfault_tc::tc::object::QdiscKind;
use netfault_tc::tc::tbf::TbfOptions;
use serde::{Deserialize, Serialize};

use crate::config::{self, ConfigError, FaultConfig};
use crate::error::{Error, Result};

/// Share of the delay used as jitter when jitter is requested, in percent.
const JITTER_PERCENT: u32 = 30;

/// The kinds of fault, in the order their scopes are composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisciplineKind {
    Blackhole,
    Corrupt,
    Delay,
    Loss,
    BandwidthLimit,
}

impl DisciplineKind {
    pub const ALL: [Self; 5] =
        [Self::Blackhole, Self::Corrupt, Self::Delay, Self::Loss, Self::BandwidthLimit];

    /// The bit of this kind in a fault mask. Masks name the tc classes of fault combinations.
    pub const fn bit(self) -> u8 {
        match self {
            Self::Blackhole => 1,
            Self::Corrupt => 1 << 1,
            Self::Delay => 1 << 2,
            Self::Loss => 1 << 3,
            Self::BandwidthLimit => 1 << 4,
        }
    }

    /// The kinds whose bit is set in `mask`.
    pub fn in_mask(mask: u8) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |kind| mask & kind.bit() != 0)
    }

    /// Exclusive kinds tolerate no other discipline on the same interface.
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Blackhole)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blackhole => "blackhole",
            Self::Corrupt => "corrupt",
            Self::Delay => "delay",
            Self::Loss => "loss",
            Self::BandwidthLimit => "bandwidth_limit",
        }
    }
}

impl fmt::Display for DisciplineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisciplineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidDiscipline(format!("unknown discipline {s:?}")))
    }
}

/// A single fault behaviour with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discipline {
    /// Drop every matched packet.
    Blackhole,
    /// Flip a random bit in `percentage` percent of the matched packets.
    Corrupt { percentage: u8 },
    /// Hold matched packets back for `delay`, varied by up to `jitter`.
    Delay { delay: Duration, jitter: Duration },
    /// Drop `percentage` percent of the matched packets.
    Loss { percentage: u8 },
    /// Shape matched traffic to `rate`.
    BandwidthLimit { rate: Rate },
}

impl Discipline {
    pub const fn kind(&self) -> DisciplineKind {
        match self {
            Self::Blackhole => DisciplineKind::Blackhole,
            Self::Corrupt { .. } => DisciplineKind::Corrupt,
            Self::Delay { .. } => DisciplineKind::Delay,
            Self::Loss { .. } => DisciplineKind::Loss,
            Self::BandwidthLimit { .. } => DisciplineKind::BandwidthLimit,
        }
    }

    /// Decode the parameters of `kind` from the orchestrator configuration.
    pub fn from_config(kind: DisciplineKind, config: &FaultConfig) -> Result<Self> {
        let discipline = match kind {
            DisciplineKind::Blackhole => Self::Blackhole,
            DisciplineKind::Corrupt => {
                Self::Corrupt { percentage: percentage(config, config::NETWORK_CORRUPTION)? }
            }
            DisciplineKind::Loss => Self::Loss { percentage: percentage(config, config::NETWORK_LOSS)? },
            DisciplineKind::Delay => {
                let millis = required(config.integer(config::NETWORK_DELAY), config::NETWORK_DELAY)?;
                let millis = u64::try_from(millis).map_err(|_| {
                    Error::InvalidDiscipline(format!("{}: must not be negative", config::NETWORK_DELAY))
                })?;
                let delay = Duration::from_millis(millis);
                let jitter = match config.boolean(config::NETWORK_DELAY_JITTER).map_err(invalid)? {
                    Some(true) => delay * JITTER_PERCENT / 100,
                    _ => Duration::ZERO,
                };
                Self::Delay { delay, jitter }
            }
            DisciplineKind::BandwidthLimit => {
                let rate = required(config.string(config::BANDWIDTH), config::BANDWIDTH)?;
                Self::BandwidthLimit { rate: rate.parse()? }
            }
        };
        discipline.validate()?;
        Ok(discipline)
    }

    /// Check the parameters are representable in the kernel.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Corrupt { percentage } | Self::Loss { percentage } if percentage > 100 => Err(
                Error::InvalidDiscipline(format!("percentage {percentage} is not within 0..=100")),
            ),
            Self::Delay { delay, jitter } => {
                for value in [delay, jitter] {
                    if u32::try_from(value.as_micros()).is_err() {
                        return Err(Error::InvalidDiscipline(format!("delay {value:?} is too large")));
                    }
                }
                Ok(())
            }
            Self::BandwidthLimit { rate } if rate.bits_per_sec() < 8 => {
                Err(Error::InvalidDiscipline(format!("rate {rate} is below one byte per second")))
            }
            _ => Ok(()),
        }
    }

    /// The leaf qdisc implementing this discipline below its class.
    pub fn leaf(&self) -> QdiscKind {
        match *self {
            // A zero length fifo refuses every packet.
            Self::Blackhole => QdiscKind::Pfifo { limit: 0 },
            Self::Corrupt { percentage } => {
                QdiscKind::Netem(NetemOptions { corrupt: percentage as f64, ..Default::default() })
            }
            Self::Delay { delay, jitter } => QdiscKind::Netem(NetemOptions {
                latency_us: micros(delay),
                jitter_us: micros(jitter),
                ..Default::default()
            }),
            Self::Loss { percentage } => {
                QdiscKind::Netem(NetemOptions { loss: percentage as f64, ..Default::default() })
            }
            Self::BandwidthLimit { rate } => QdiscKind::Tbf(TbfOptions::new(rate.bytes_per_sec())),
        }
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blackhole => write!(f, "blackhole"),
            Self::Corrupt { percentage } => write!(f, "corrupt {percentage}%"),
            Self::Delay { delay, jitter } if jitter.is_zero() => write!(f, "delay {delay:?}"),
            Self::Delay { delay, jitter } => write!(f, "delay {delay:?} ± {jitter:?}"),
            Self::Loss { percentage } => write!(f, "loss {percentage}%"),
            Self::BandwidthLimit { rate } => write!(f, "bandwidth {rate}"),
        }
    }
}

fn micros(duration: Duration) -> u32 {
    duration.as_micros().min(u32::MAX as u128) as u32
}

fn invalid(e: ConfigError) -> Error {
    Error::InvalidDiscipline(e.to_string())
}

fn required<T>(value: std::result::Result<Option<T>, ConfigError>, key: &str) -> Result<T> {
    value.map_err(invalid)?.ok_or_else(|| Error::InvalidDiscipline(format!("{key}: missing")))
}

fn percentage(config: &FaultConfig, key: &str) -> Result<u8> {
    let value = required(config.integer(key), key)?;
    u8::try_from(value)
        .ok()
        .filter(|p| *p <= 100)
        .ok_or_else(|| Error::InvalidDiscipline(format!("{key}: {value} is not within 0..=100")))
}

/// A data rate, stored in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(u64);

/// tc rate units and their size in bits per second.
const RATE_UNITS: [(&str, u64); 8] = [
    ("gbit", 1_000_000_000),
    ("mbit", 1_000_000),
    ("kbit", 1_000),
    ("bit", 1),
    ("gbps", 8_000_000_000),
    ("mbps", 8_000_000),
    ("kbps", 8_000),
    ("bps", 8),
];

impl Rate {
    pub const fn from_bits_per_sec(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits_per_sec(self) -> u64 {
        self.0
    }

    pub const fn bytes_per_sec(self) -> u64 {
        self.0 / 8
    }
}

impl FromStr for Rate {
    type Err = Error;

    /// Parse a rate with tc units, e.g. `100kbit` or `1mbps`. Units are case insensitive.
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let bad = || Error::InvalidDiscipline(format!("{}: invalid rate {s:?}", config::BANDWIDTH));

        let split = lower.find(|c: char| !(c.is_ascii_digit() || c == '.')).ok_or_else(bad)?;
        let (number, unit) = lower.split_at(split);
        let (_, multiplier) = RATE_UNITS.iter().find(|(name, _)| *name == unit).ok_or_else(bad)?;
        let number: f64 = number.parse().map_err(|_| bad())?;

        let bits = number * *multiplier as f64;
        if !bits.is_finite() || bits < 1.0 || bits > u64::MAX as f64 {
            return Err(bad());
        }
        Ok(Self(bits as u64))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (unit, multiplier) in RATE_UNITS.iter().take(4) {
            if self.0 >= *multiplier && self.0 % multiplier == 0 {
                return write!(f, "{}{unit}", self.0 / multiplier);
            }
        }
        write!(f, "{}bit", self.0)
    }
}
