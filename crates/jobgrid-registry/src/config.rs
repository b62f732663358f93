//! Registry and dispatcher configuration.
//!
//! Plain value objects, deserializable from TOML. Durations are written as
//! strings (`"100ms"`, `"10s"`, `"5m"`, `"24h"`) and parsed on access.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for the [`ServiceRegistry`](crate::ServiceRegistry).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Host key under which local producers are registered.
    pub hostname: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
        }
    }
}

/// Settings for the background [`JobDispatcher`](crate::JobDispatcher).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Delay between the end of one dispatch cycle and the start of the next.
    /// Zero disables dispatching.
    pub interval: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: "100ms".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval: format!("{}ms", interval.as_millis()),
        }
    }

    /// The parsed interval, or `None` when dispatching is disabled.
    ///
    /// An unparsable value falls back to the default of 100ms.
    pub fn interval(&self) -> Option<Duration> {
        let interval = parse_duration(&self.interval).unwrap_or(Duration::from_millis(100));
        (!interval.is_zero()).then_some(interval)
    }
}

/// Parse a duration string like "500ms", "5s", "2m", "24h".
///
/// A bare number is read as seconds. Values too large to represent are
/// rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
