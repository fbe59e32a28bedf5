//! Engine options and the flat key/value configuration handed over by the orchestrator.

use std::time::Duration;

use netfault_tc::tc::handle::MAX_FILTERS_PER_GROUP;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Corruption percentage, `0..=100`.
pub const NETWORK_CORRUPTION: &str = "networkCorruption";
/// Loss percentage, `0..=100`.
pub const NETWORK_LOSS: &str = "networkLoss";
/// Added latency in milliseconds.
pub const NETWORK_DELAY: &str = "networkDelay";
/// Whether to add 30% jitter to the latency.
pub const NETWORK_DELAY_JITTER: &str = "networkDelayJitter";
/// Rate limit with tc units, e.g. `1mbit`.
pub const BANDWIDTH: &str = "bandwidth";
/// Interfaces to fault. All non-loopback interfaces when empty.
pub const NETWORK_INTERFACE: &str = "networkInterface";
pub const IP: &str = "ip";
pub const HOSTNAME: &str = "hostname";
pub const EXCLUDE_IP: &str = "excludeIp";
pub const EXCLUDE_HOSTNAME: &str = "excludeHostname";
pub const PORT: &str = "port";
pub const PROTOCOL: &str = "protocol";
/// Whether the loopback interface may be enumerated.
pub const INCLUDE_LOOPBACK: &str = "includeLoopback";

/// Default deadline of a single runtime or kernel operation.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Options of an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Deadline of every runtime call and every kernel operation.
    pub(crate) deadline: Duration,
    /// Whether loopback interfaces are enumerated when a fault names no interface.
    pub(crate) include_loopback: bool,
    /// Maximum number of classifiers per group (exclusions or inclusions) of one fault.
    pub(crate) max_classifiers: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            include_loopback: false,
            max_classifiers: MAX_FILTERS_PER_GROUP,
        }
    }
}

impl EngineOptions {
    /// Sets the deadline of each runtime call and kernel operation. An operation running into the
    /// deadline fails, and whatever it left behind is reverted.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sets whether loopback interfaces are enumerated by default.
    pub fn include_loopback(mut self, include_loopback: bool) -> Self {
        self.include_loopback = include_loopback;
        self
    }

    /// Sets the classifier budget per group. Values above [`MAX_FILTERS_PER_GROUP`] are capped.
    pub fn max_classifiers(mut self, max_classifiers: usize) -> Self {
        self.max_classifiers = max_classifiers.min(MAX_FILTERS_PER_GROUP);
        self
    }

    pub fn get_deadline(&self) -> Duration {
        self.deadline
    }
}

/// A configuration value had the wrong type or range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{key}: expected {expected}")]
pub struct ConfigError {
    pub key: String,
    pub expected: &'static str,
}

impl ConfigError {
    fn new(key: &str, expected: &'static str) -> Self {
        Self { key: key.to_string(), expected }
    }
}

/// Flat orchestrator configuration, `parameter name -> value`.
///
/// Values are accepted in the loose shapes orchestrators send them in: numbers may arrive as
/// numeric strings, lists as a single string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaultConfig(Map<String, Value>);

impl FaultConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// An integer value.
    pub fn integer(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| ConfigError::new(key, "an integer")),
            Some(Value::String(s)) => {
                s.trim().parse().map(Some).map_err(|_| ConfigError::new(key, "an integer"))
            }
            Some(_) => Err(ConfigError::new(key, "an integer")),
        }
    }

    /// A boolean value. Accepts `"true"` and `"false"` strings.
    pub fn boolean(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(ConfigError::new(key, "a boolean")),
            },
            Some(_) => Err(ConfigError::new(key, "a boolean")),
        }
    }

    /// A string value. Numbers are rendered as strings.
    pub fn string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(ConfigError::new(key, "a string")),
        }
    }

    /// A list of strings. A single string counts as a one element list, blank entries are
    /// skipped.
    pub fn strings(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        let values = match self.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::Array(values)) => values.iter().collect::<Vec<_>>(),
            Some(value) => vec![value],
        };

        let mut out = Vec::with_capacity(values.len());
        for value in values {
            let s = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return Err(ConfigError::new(key, "a list of strings")),
            };
            if !s.is_empty() {
                out.push(s);
            }
        }
        Ok(out)
    }
}

impl From<Map<String, Value>> for FaultConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
