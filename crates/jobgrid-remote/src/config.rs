//! Remote client configuration.

use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};

use jobgrid_registry::parse_duration;

/// Settings for [`RemoteClient`](crate::RemoteClient).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Wait between resolution attempts and between retry rounds.
    pub poll_interval: String,
    /// Ceiling on the whole call, measured from its start.
    pub max_wait: String,
    /// Timeout for a single HTTP exchange.
    pub request_timeout: String,
    /// Statuses a peer uses to decline deliberately. A round in which every
    /// peer answers with one of these ends the call without retrying.
    pub known_bad_statuses: Vec<u16>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            poll_interval: "10s".to_string(),
            max_wait: "24h".to_string(),
            request_timeout: "30s".to_string(),
            known_bad_statuses: vec![StatusCode::SERVICE_UNAVAILABLE.as_u16()],
        }
    }
}

impl RemoteConfig {
    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn max_wait(&self) -> Duration {
        parse_duration(&self.max_wait).unwrap_or(Duration::from_secs(24 * 3600))
    }

    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn is_known_bad(&self, status: StatusCode) -> bool {
        self.known_bad_statuses.contains(&status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = RemoteConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(10));
        assert_eq!(cfg.max_wait(), Duration::from_secs(86_400));
        assert!(cfg.is_known_bad(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!cfg.is_known_bad(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn parse_from_toml() {
        let cfg: RemoteConfig = toml::from_str(
            r#"
            poll_interval = "500ms"
            known_bad_statuses = [503, 429]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
        assert!(cfg.is_known_bad(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn unparsable_values_fall_back() {
        let cfg = RemoteConfig {
            max_wait: "forever".to_string(),
            ..RemoteConfig::default()
        };
        assert_eq!(cfg.max_wait(), Duration::from_secs(86_400));
    }
}
