//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use resonate_core::protocol_constants::{DEFAULT_PORT, DEFAULT_WS_PATH};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the WebSocket listener to.
    /// Override: `RESONATE_BIND_PORT`
    pub bind_port: u16,

    /// WebSocket upgrade path.
    pub ws_path: String,

    /// Human-readable server name sent in `server/hello` and advertised
    /// over mDNS.
    /// Override: `RESONATE_SERVER_NAME`
    pub server_name: String,

    /// IP address to advertise over mDNS. Auto-detected when absent.
    /// Override: `RESONATE_ADVERTISE_IP`
    pub advertise_ip: Option<IpAddr>,

    /// Advertise `_resonate-server._tcp.local.` for client-initiated
    /// connections.
    pub advertise_mdns: bool,

    /// Browse `_resonate._tcp.local.` and dial advertising clients
    /// (server-initiated flow).
    pub dial_clients: bool,

    /// Tone frequency of the built-in demo source, Hz.
    pub tone_hz: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            server_name: "Resonate Server".to_string(),
            advertise_ip: None,
            advertise_mdns: true,
            dial_clients: true,
            tone_hz: 440.0,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RESONATE_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("RESONATE_SERVER_NAME") {
            self.server_name = val;
        }

        if let Ok(val) = std::env::var("RESONATE_ADVERTISE_IP") {
            if let Ok(ip) = val.parse() {
                self.advertise_ip = Some(ip);
            }
        }
    }
}
