//! Node assembly — job store, registry, and the static cluster view.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use jobgrid_registry::ServiceRegistry;
use jobgrid_state::JobStore;

use crate::config::DaemonConfig;

/// Open the job store named by the configuration.
pub fn open_store(config: &DaemonConfig) -> anyhow::Result<JobStore> {
    match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating data directory {}", dir.display()))?;
            let path = dir.join("jobs.redb");
            let store = JobStore::open(&path)
                .with_context(|| format!("opening job store {}", path.display()))?;
            info!(path = ?path, "job store opened");
            Ok(store)
        }
        None => {
            info!("no data_dir configured, jobs are kept in memory");
            Ok(JobStore::open_in_memory()?)
        }
    }
}

/// Build the registry and register this node plus all configured peers.
pub fn build_registry(config: &DaemonConfig, store: JobStore) -> anyhow::Result<Arc<ServiceRegistry>> {
    let registry = ServiceRegistry::new(config.registry.clone(), store)?;

    let host = &config.host;
    registry.register_host(
        registry.registry_hostname(),
        &host.address,
        &host.node_name,
        host.cores,
        host.memory,
        host.max_load(),
    )?;

    for peer in &config.peers {
        registry
            .register_host(
                &peer.base_url,
                &peer.address,
                &peer.node_name,
                peer.cores,
                peer.memory,
                peer.max_load.unwrap_or(peer.cores as f64),
            )
            .with_context(|| format!("registering peer {}", peer.base_url))?;
        for service in &peer.services {
            registry.register_service(
                &service.service_type,
                &peer.base_url,
                &service.path,
                service.job_producer,
            )?;
        }
    }
    info!(
        hostname = %registry.registry_hostname(),
        peers = config.peers.len(),
        "cluster view registered"
    );
    Ok(Arc::new(registry))
}
