//! mDNS discovery glue.
//!
//! Advertisement and browsing are delegated to `mdns-sd`; this module only
//! adapts `{address, port, path}` records into WebSocket URLs and hands
//! them to the reconnect driver. Registration is best-effort: failure is
//! logged but never prevents the service from running.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mdns_sd::{ResolvedService, ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio_util::sync::CancellationToken;

use crate::endpoint::reconnect::ReconnectDriver;
use crate::error::ResonateError;
use crate::protocol_constants::{DEFAULT_WS_PATH, SERVICE_TYPE_CLIENT, SERVICE_TYPE_SERVER};

/// One discovered peer, as handed over by the mDNS layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub address: IpAddr,
    pub port: u16,
    pub path: String,
}

impl DiscoveryRecord {
    /// The WebSocket URL this record dials to.
    pub fn ws_url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        match self.address {
            IpAddr::V4(v4) => format!("ws://{}:{}{}", v4, self.port, path),
            IpAddr::V6(v6) => format!("ws://[{}]:{}{}", v6, self.port, path),
        }
    }

    /// Extracts a record from a resolved mDNS service. IPv4 preferred;
    /// the `path` TXT record defaults to the protocol path.
    pub fn from_resolved(info: &ResolvedService) -> Option<Self> {
        let address = info
            .addresses
            .iter()
            .map(|a| a.to_ip_addr())
            .find(IpAddr::is_ipv4)
            .or_else(|| info.addresses.iter().map(|a| a.to_ip_addr()).next())?;
        let path = info
            .txt_properties
            .get_property_val_str("path")
            .unwrap_or(DEFAULT_WS_PATH)
            .to_string();
        Some(Self {
            address,
            port: info.port,
            path,
        })
    }
}

/// Advertises a Resonate endpoint via mDNS/DNS-SD.
///
/// The service is registered on construction and unregistered when dropped.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    service_fullname: String,
    /// Tracks whether shutdown has been called to prevent double unregister.
    shutdown_called: AtomicBool,
}

impl MdnsAdvertiser {
    /// Advertises a server (`_resonate-server._tcp.local.`).
    pub fn server(
        instance_name: &str,
        advertise_ip: IpAddr,
        port: u16,
        path: &str,
    ) -> Result<Self, ResonateError> {
        Self::register(SERVICE_TYPE_SERVER, instance_name, advertise_ip, port, path)
    }

    /// Advertises a client (`_resonate._tcp.local.`) for the
    /// server-initiated flow.
    pub fn client(
        instance_name: &str,
        advertise_ip: IpAddr,
        port: u16,
        path: &str,
    ) -> Result<Self, ResonateError> {
        Self::register(SERVICE_TYPE_CLIENT, instance_name, advertise_ip, port, path)
    }

    fn register(
        service_type: &str,
        instance_name: &str,
        advertise_ip: IpAddr,
        port: u16,
        path: &str,
    ) -> Result<Self, ResonateError> {
        let daemon = ServiceDaemon::new().map_err(|e| ResonateError::Discovery(e.to_string()))?;

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let dns_hostname = hostname
            .to_lowercase()
            .replace(' ', "-")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect::<String>();

        let mut txt = HashMap::new();
        txt.insert("path".to_string(), path.to_string());
        txt.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let service = ServiceInfo::new(
            service_type,
            instance_name,
            &format!("{}.local.", dns_hostname),
            advertise_ip,
            port,
            Some(txt),
        )
        .map_err(|e| ResonateError::Discovery(e.to_string()))?;

        let fullname = service.get_fullname().to_string();
        daemon
            .register(service)
            .map_err(|e| ResonateError::Discovery(e.to_string()))?;

        log::info!(
            "[mDNS] Advertising '{}' ({}) at {}:{}",
            instance_name,
            service_type,
            advertise_ip,
            port
        );

        Ok(Self {
            daemon,
            service_fullname: fullname,
            shutdown_called: AtomicBool::new(false),
        })
    }

    /// Unregisters the service. Safe to call multiple times.
    pub fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.daemon.unregister(&self.service_fullname) {
            log::warn!("[mDNS] Failed to unregister service: {:?}", e);
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Browses a service type and feeds every resolved record to the
/// reconnect driver. Runs until `cancel` fires.
///
/// A server browses [`SERVICE_TYPE_CLIENT`] to dial advertising clients; a
/// client browses [`SERVICE_TYPE_SERVER`] to find servers.
pub fn spawn_browser(
    service_type: &'static str,
    driver: Arc<ReconnectDriver>,
    cancel: CancellationToken,
) -> Result<(), ResonateError> {
    let daemon = ServiceDaemon::new().map_err(|e| ResonateError::Discovery(e.to_string()))?;
    let receiver = daemon
        .browse(service_type)
        .map_err(|e| ResonateError::Discovery(e.to_string()))?;

    tokio::spawn(async move {
        log::info!("[mDNS] Browsing {}", service_type);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.recv_async() => {
                    match event {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            let Some(record) = DiscoveryRecord::from_resolved(&info) else {
                                log::debug!("[mDNS] Unresolvable service {}", info.fullname);
                                continue;
                            };
                            let url = record.ws_url();
                            log::info!("[mDNS] Resolved {} -> {}", info.fullname, url);
                            driver.connect(&url);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::debug!("[mDNS] Browse channel closed: {:?}", e);
                            break;
                        }
                    }
                }
            }
        }
        if let Err(e) = daemon.stop_browse(service_type) {
            log::debug!("[mDNS] Failed to stop browse: {:?}", e);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_builds_ws_urls() {
        let record = DiscoveryRecord {
            address: "192.168.1.10".parse().unwrap(),
            port: 8927,
            path: "/resonate".into(),
        };
        assert_eq!(record.ws_url(), "ws://192.168.1.10:8927/resonate");

        let bare_path = DiscoveryRecord {
            address: "10.0.0.2".parse().unwrap(),
            port: 80,
            path: "ws".into(),
        };
        assert_eq!(bare_path.ws_url(), "ws://10.0.0.2:80/ws");

        let v6 = DiscoveryRecord {
            address: "::1".parse().unwrap(),
            port: 8927,
            path: "/resonate".into(),
        };
        assert_eq!(v6.ws_url(), "ws://[::1]:8927/resonate");
    }
}
