//! Resonate Server - standalone headless reference server.
//!
//! Accepts Resonate clients over WebSocket, advertises itself via mDNS,
//! and dials clients that advertise themselves (server-initiated flow).
//! Audio comes from the built-in demo tone source; see `audio.rs` for the
//! seams a real media pipeline plugs into.

mod audio;
mod config;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use resonate_core::discovery::{spawn_browser, MdnsAdvertiser};
use resonate_core::protocol_constants::SERVICE_TYPE_CLIENT;
use resonate_core::{
    api, LoggingEventEmitter, ReconnectDriver, ResonateServer, ServerIdentity,
    ServerSessionFactory, WsDialer,
};

use crate::audio::{DemoMediaController, ToneStreamFactory};
use crate::config::ServerConfig;

/// Resonate Server - headless multi-room audio server.
#[derive(Parser, Debug)]
#[command(name = "resonate-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "RESONATE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "RESONATE_BIND_PORT")]
    port: Option<u16>,

    /// Advertise IP address (overrides config file).
    #[arg(short = 'a', long, env = "RESONATE_ADVERTISE_IP")]
    advertise_ip: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Resonate Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(ip) = args.advertise_ip {
        config.advertise_ip = Some(ip);
    }

    let server = ResonateServer::new(
        ServerIdentity::new(&config.server_name),
        Arc::new(DemoMediaController),
        ToneStreamFactory::new(config.tone_hz),
        Arc::new(LoggingEventEmitter),
    );

    // mDNS advertisement (best-effort).
    let advertiser = if config.advertise_mdns {
        let ip = resolve_advertise_ip(&config)?;
        match MdnsAdvertiser::server(&config.server_name, ip, config.bind_port, &config.ws_path) {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                log::warn!("mDNS advertisement unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    // Server-initiated flow: browse for advertising clients and dial them.
    let browse_cancel = CancellationToken::new();
    let dial_driver = if config.dial_clients {
        let driver = Arc::new(ReconnectDriver::new(
            Arc::new(WsDialer),
            ServerSessionFactory::new(Arc::clone(&server)),
        ));
        if let Err(e) = spawn_browser(SERVICE_TYPE_CLIENT, Arc::clone(&driver), browse_cancel.clone())
        {
            log::warn!("Client discovery unavailable: {}", e);
        }
        Some(driver)
    } else {
        None
    };

    // WebSocket listener for the client-initiated flow.
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.bind_port);
    let serve_server = Arc::clone(&server);
    let ws_path = config.ws_path.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(addr, serve_server, &ws_path).await {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    browse_cancel.cancel();
    if let Some(driver) = dial_driver {
        driver.shutdown();
    }
    if let Some(advertiser) = advertiser {
        advertiser.shutdown();
    }
    server.shutdown();
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Resolves the IP to advertise: explicit config, or local autodetection.
fn resolve_advertise_ip(config: &ServerConfig) -> Result<IpAddr> {
    if let Some(ip) = config.advertise_ip {
        return Ok(ip);
    }
    local_ip_address::local_ip().context(
        "Failed to auto-detect local IP address. \
         Please specify --advertise-ip or set RESONATE_ADVERTISE_IP to the IP \
         address that Resonate clients can reach.",
    )
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
