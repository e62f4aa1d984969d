//! Service registry
//!
//! Listens for service announcements on the registration port, keeps the
//! directory of known services and rebroadcasts new entries on the announce port.
//!
//! # Usage
//!
//! ```bash
//! # IPv6 scope-local group on every interface
//! svc-registry
//!
//! # IPv4 group on one interface
//! svc-registry --bind 192.168.1.10 --multicast 239.0.0.1
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use svc_registry::{Config, Registry};

/// Multicast service registry
#[derive(Parser, Debug)]
#[command(name = "svc-registry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local address to bind and join the group on [default: 0::0]
    #[arg(short, long)]
    bind: Option<String>,

    /// Multicast group address [default: ff31::8000:1234]
    #[arg(short, long)]
    multicast: Option<String>,

    /// Port announcements arrive on [default: 30001]
    #[arg(long)]
    registration_port: Option<u16>,

    /// Port rebroadcasts are sent to [default: 30002]
    #[arg(long)]
    announce_port: Option<u16>,

    /// Rebroadcast interval in seconds [default: 1]
    #[arg(long)]
    interval: Option<f64>,

    /// Configuration file (JSON format); flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> svc_registry::Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading config from {:?}", path);
                Config::from_file(path)?
            }
            None => Config::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(multicast) = self.multicast {
            config.multicast_address = multicast;
        }
        if let Some(port) = self.registration_port {
            config.registration_port = port;
        }
        if let Some(port) = self.announce_port {
            config.announce_port = port;
        }
        if let Some(secs) = self.interval {
            config.announce_interval = Duration::try_from_secs_f64(secs)
                .map_err(|e| svc_registry::Error::config(format!("interval: {}", e)))?;
        }
        Ok(config)
    }
}

fn log_level(name: &str) -> Level {
    match name {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Resolves on Ctrl-C, or SIGTERM where available
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("SIGTERM handler unavailable: {}", e),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(&args.log_level))
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.into_config()?;
    info!("svc-registry v{}", svc_registry::VERSION);
    info!("  Bind:      {}", config.bind_address);
    info!("  Group:     {}", config.multicast_address);
    info!("  Intake:    {}", config.registration_port);
    info!("  Rebroadcast: {}", config.announce_port);

    let registry = Registry::new(&config).await;
    if !registry.is_valid() {
        return Err(format!("registry unusable: {}", registry.error()).into());
    }
    registry.start()?;

    shutdown_signal().await;
    info!("Shutdown signal received, stopping registry...");
    registry.shutdown().await;
    Ok(())
}
