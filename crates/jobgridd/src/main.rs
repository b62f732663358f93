//! jobgridd — the jobgrid node daemon.
//!
//! Assembles a node from the jobgrid crates:
//! - Job store (redb, or in memory)
//! - Service registry with this node and any statically configured peers
//! - Background job dispatcher
//! - Remote client for calling a capability on whichever peer offers it
//!
//! # Usage
//!
//! ```text
//! jobgridd run --config /etc/jobgrid/jobgrid.toml
//! jobgridd call --config /etc/jobgrid/jobgrid.toml ingest /encode --accept 200
//! ```

mod config;
mod node;

use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::{Parser, Subcommand};
use http::{Method, StatusCode};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobgrid_registry::{DispatcherHandle, JobDispatcher};
use jobgrid_remote::{HyperExecutor, RemoteClient, RemoteRequest};

use crate::config::DaemonConfig;

const DEFAULT_LOG_FILTER: &str = "info,jobgridd=debug,jobgrid_registry=debug,jobgrid_remote=debug";

#[derive(Parser)]
#[command(name = "jobgridd", about = "jobgrid node daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node: register it, dispatch queued jobs until interrupted.
    Run {
        /// Path to jobgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Overrides `data_dir` from the configuration file.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Call a capability on one of the configured peers and print the reply.
    Call {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Service type to call.
        service_type: String,

        /// Path appended to the service URL.
        #[arg(default_value = "")]
        path: String,

        #[arg(long, default_value = "GET")]
        method: String,

        /// Request body.
        #[arg(long)]
        data: Option<String>,

        /// Statuses that count as success.
        #[arg(long, value_delimiter = ',', default_value = "200")]
        accept: Vec<u16>,
    },
    /// Print the effective configuration.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config, data_dir } => {
            let mut daemon_config = DaemonConfig::load(config.as_deref())?;
            if data_dir.is_some() {
                daemon_config.data_dir = data_dir;
            }
            run_node(daemon_config, config).await
        }
        Command::Call {
            config,
            service_type,
            path,
            method,
            data,
            accept,
        } => {
            let daemon_config = DaemonConfig::load(config.as_deref())?;
            call(daemon_config, &service_type, &path, &method, data, &accept).await
        }
        Command::Config { config } => {
            let daemon_config = DaemonConfig::load(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&daemon_config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_node(config: DaemonConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("jobgrid node starting");

    let store = node::open_store(&config)?;
    let registry = node::build_registry(&config, store)?;

    let dispatcher = JobDispatcher::new(registry.clone()).spawn(config.dispatcher.clone());
    info!(interval = %config.dispatcher.interval, "dispatcher started");

    wait_for_shutdown(&dispatcher, config_path.as_deref()).await;
    info!("shutdown signal received");

    dispatcher.shutdown().await;
    info!("jobgrid node stopped");
    Ok(())
}

/// Wait for Ctrl-C. On unix, SIGHUP re-reads the dispatcher section of the
/// configuration file.
#[cfg(unix)]
async fn wait_for_shutdown(dispatcher: &DispatcherHandle, config_path: Option<&Path>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGHUP, reload disabled");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = hangup.recv() => reload(dispatcher, config_path),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_dispatcher: &DispatcherHandle, _config_path: Option<&Path>) {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg_attr(not(unix), allow(dead_code))]
fn reload(dispatcher: &DispatcherHandle, config_path: Option<&Path>) {
    let Some(path) = config_path else {
        info!("no configuration file to reload");
        return;
    };
    match DaemonConfig::from_file(path) {
        Ok(config) => {
            info!(path = ?path, interval = %config.dispatcher.interval, "configuration reloaded");
            dispatcher.reload(config.dispatcher);
        }
        Err(e) => warn!(path = ?path, error = %e, "configuration reload failed, keeping current"),
    }
}

async fn call(
    config: DaemonConfig,
    service_type: &str,
    path: &str,
    method: &str,
    data: Option<String>,
    accept: &[u16],
) -> anyhow::Result<()> {
    let method: Method = method.parse()?;
    let accepted = accept
        .iter()
        .map(|code| StatusCode::from_u16(*code))
        .collect::<Result<Vec<_>, _>>()?;

    let store = node::open_store(&DaemonConfig {
        data_dir: None,
        ..config.clone()
    })?;
    let registry = node::build_registry(&config, store)?;
    let http = HyperExecutor::new(config.remote.request_timeout());
    let client = RemoteClient::new(registry, http, config.remote.clone());

    let mut request = RemoteRequest::new(method, path);
    if let Some(data) = data {
        request = request.with_body(data);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    match client
        .call_with_shutdown(service_type, &request, &accepted, shutdown_rx)
        .await
    {
        Some(response) => {
            info!(status = %response.status(), "remote call succeeded");
            println!("{}", String::from_utf8_lossy(response.body()));
            Ok(())
        }
        None => bail!("no peer offering '{service_type}' accepted the request"),
    }
}
