//! Standalone service registry server.
//!
//! # Rust Learning Note
//!
//! The registry itself is synchronous: ZeroMQ sockets are driven by a
//! blocking update loop. tokio is only used to wait for Ctrl+C while that
//! loop runs on a blocking thread:
//!
//! ```text
//! main (tokio)
//!  ├── spawn_blocking ── bind → join pool → auto_update → shutdown
//!  └── select! { server finished | ctrl_c → stop.stop() }
//! ```
//!
//! Build with: `cargo build --bin hsu-registry`

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use hsu_common::{Address, StopHandle};
use hsu_service_registry::{JoinConfig, RegistryConfig, RegistryServer};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// HSU service registry server
#[derive(Parser, Debug)]
#[command(name = "hsu-registry")]
#[command(about = "Pooled service registry for HSU services", long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind both endpoints on
    #[arg(long)]
    host: Option<String>,

    /// RPC port; the publish port defaults to the next one
    #[arg(short = 'p', long)]
    rpc_port: Option<u16>,

    /// Publish port
    #[arg(long)]
    publish_port: Option<u16>,

    /// Host name clients and peers should use to reach this server
    #[arg(long)]
    advertise_host: Option<String>,

    /// RPC address of a pool member to join (e.g. tcp://10.0.0.4:5555)
    #[arg(long, value_parser = parse_address)]
    join: Option<Address>,

    /// Publish address of the pool member; defaults to its RPC port + 1
    #[arg(long, value_parser = parse_address, requires = "join")]
    join_publish: Option<Address>,

    /// Update loop tick in milliseconds
    #[arg(long, default_value = "20")]
    tick_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_address(s: &str) -> std::result::Result<Address, String> {
    Address::parse(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (logging)
    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = build_config(&args)?;
    let tick = Duration::from_millis(args.tick_ms.max(1));

    info!("HSU Service Registry starting...");
    info!("Press Ctrl+C to stop");

    let stop = StopHandle::new();
    let server_stop = stop.clone();
    let mut server_task = tokio::task::spawn_blocking(move || run_server(config, tick, server_stop));

    tokio::select! {
        finished = &mut server_task => {
            return finished.context("Registry thread panicked")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            stop.stop();
        }
    }

    server_task.await.context("Registry thread panicked")?
}

fn build_config(args: &Args) -> Result<RegistryConfig> {
    let mut config = match args.config {
        Some(ref path) => RegistryConfig::load_from_file(path)?,
        None => RegistryConfig::default(),
    };

    if let Some(ref host) = args.host {
        config.rpc_address = config.rpc_address.with_host(host);
        config.publish_address = config.publish_address.with_host(host);
    }
    if let Some(port) = args.rpc_port {
        config.rpc_address = config.rpc_address.with_port(port);
        config.publish_address = config.publish_address.with_port(port.saturating_add(1));
    }
    if let Some(port) = args.publish_port {
        config.publish_address = config.publish_address.with_port(port);
    }
    if args.advertise_host.is_some() {
        config.advertise_host = args.advertise_host.clone();
    }
    if let Some(ref member) = args.join {
        config.join = Some(match args.join_publish {
            Some(ref publish) => JoinConfig {
                rpc_address: member.clone(),
                publish_address: publish.clone(),
            },
            None => JoinConfig::from_rpc(member.clone()),
        });
    }

    config.validate()?;
    Ok(config)
}

fn run_server(config: RegistryConfig, tick: Duration, stop: StopHandle) -> Result<()> {
    let join = config.join.clone();
    let mut server = RegistryServer::bind(config)
        .map_err(|e| anyhow!("Failed to start registry: {}", e))?;

    if let Some(join) = join {
        if let Err(e) = server.join_pool(&join.rpc_address, &join.publish_address) {
            error!("Failed to join pool via {}: {}", join.rpc_address, e);
            return Err(anyhow!("Failed to join pool via {}: {}", join.rpc_address, e));
        }
    }

    server.auto_update(tick, &stop);
    server.shutdown();
    Ok(())
}
