//! Service announcer
//!
//! Registers one service with the registry, prints every announcement it hears
//! and signs the service off on Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! svc-announce --name echo --address 192.168.1.20 --port 9000 --brief "echo server"
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use svc_registry::{Announcer, Config, Protocol, ServiceAnnouncement, ServiceConfig};

/// Multicast service announcer
#[derive(Parser, Debug)]
#[command(name = "svc-announce")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service name
    #[arg(short, long)]
    name: String,

    /// Connectable address of the service
    #[arg(short, long)]
    address: String,

    /// Listening port of the service
    #[arg(short, long)]
    port: u16,

    /// Free text description
    #[arg(long, default_value = "")]
    brief: String,

    /// Messaging style (pub_sub, req_rep)
    #[arg(long, default_value = "pub_sub")]
    protocol: Protocol,

    /// Local address to bind and join the group on [default: 0::0]
    #[arg(short, long)]
    bind: Option<String>,

    /// Multicast group address [default: ff31::8000:1234]
    #[arg(short, long)]
    multicast: Option<String>,

    /// Configuration file (JSON format); flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn log_level(name: &str) -> Level {
    match name {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(&args.log_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(multicast) = args.multicast {
        config.multicast_address = multicast;
    }

    let service = ServiceConfig {
        name: args.name,
        address: args.address,
        port: args.port,
        brief: args.brief,
        protocol: args.protocol,
    };

    let announcer = Announcer::new(&config, &service).await;
    if !announcer.is_valid() {
        return Err(format!("announcer unusable: {}", announcer.error()).into());
    }
    announcer.set_announcement_callback(|announcement: &ServiceAnnouncement| {
        println!("{}", announcement);
    });
    announcer.start()?;
    if let Err(e) = announcer.request_directory().await {
        warn!("directory request failed: {}", e);
    }

    tokio::signal::ctrl_c().await?;
    info!("Signing off {}", announcer.name());
    announcer.shutdown().await;
    announcer.sign_off().await?;
    Ok(())
}
