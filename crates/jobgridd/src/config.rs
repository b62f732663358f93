//! jobgrid.toml daemon configuration.
//!
//! ```toml
//! data_dir = "/var/lib/jobgrid"     # omit for an in-memory job store
//!
//! [registry]
//! hostname = "http://10.0.0.1:8080"
//!
//! [host]
//! address = "10.0.0.1"
//! cores = 8
//! max_load = 6.0
//!
//! [dispatcher]
//! interval = "2s"
//!
//! [remote]
//! poll_interval = "10s"
//!
//! [[peer]]
//! base_url = "http://10.0.0.2:8080"
//! max_load = 4.0
//! services = [{ service_type = "ingest", path = "/ingest" }]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use jobgrid_registry::{DispatcherConfig, RegistryConfig};
use jobgrid_remote::RemoteConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for the on-disk job store.
    pub data_dir: Option<PathBuf>,
    pub registry: RegistryConfig,
    pub host: HostConfig,
    pub dispatcher: DispatcherConfig,
    pub remote: RemoteConfig,
    /// Other nodes known up front.
    #[serde(rename = "peer")]
    pub peers: Vec<PeerConfig>,
}

/// Capacity of this node. Registered under the registry hostname.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    pub address: String,
    pub node_name: String,
    pub cores: u32,
    /// Memory in bytes.
    pub memory: u64,
    /// Defaults to the number of cores.
    pub max_load: Option<f64>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            node_name: "localhost".to_string(),
            cores: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            memory: 0,
            max_load: None,
        }
    }
}

impl HostConfig {
    pub fn max_load(&self) -> f64 {
        self.max_load.unwrap_or(self.cores as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    pub base_url: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default = "default_peer_cores")]
    pub cores: u32,
    #[serde(default)]
    pub memory: u64,
    pub max_load: Option<f64>,
    #[serde(default)]
    pub services: Vec<PeerServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerServiceConfig {
    pub service_type: String,
    pub path: String,
    #[serde(default = "default_true")]
    pub job_producer: bool,
}

fn default_peer_cores() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Read `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_file_uses_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.data_dir, None);
        assert_eq!(config.registry.hostname, "localhost");
        assert_eq!(config.dispatcher.interval(), Some(Duration::from_millis(100)));
        assert_eq!(config.remote.poll_interval(), Duration::from_secs(10));
        assert!(config.peers.is_empty());
        assert_eq!(config.host.max_load(), config.host.cores as f64);
    }

    #[test]
    fn full_file_parses() {
        let config: DaemonConfig = toml::from_str(
            r#"
            data_dir = "/var/lib/jobgrid"

            [registry]
            hostname = "http://10.0.0.1:8080"

            [host]
            cores = 8
            max_load = 6.0

            [dispatcher]
            interval = "2s"

            [remote]
            max_wait = "1h"

            [[peer]]
            base_url = "http://10.0.0.2:8080"
            max_load = 4.0
            services = [
                { service_type = "ingest", path = "/ingest" },
                { service_type = "search", path = "/search", job_producer = false },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/jobgrid")));
        assert_eq!(config.host.max_load(), 6.0);
        assert_eq!(config.dispatcher.interval(), Some(Duration::from_secs(2)));
        assert_eq!(config.remote.max_wait(), Duration::from_secs(3600));
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].cores, 1);
        assert!(config.peers[0].services[0].job_producer);
        assert!(!config.peers[0].services[1].job_producer);
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobgrid.toml");
        std::fs::write(&path, "[dispatcher]\ninterval = \"0\"\n").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.dispatcher.interval(), None);
        assert!(DaemonConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
