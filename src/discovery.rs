//! mDNS service discovery
//!
//! Advertises this client as `_sendspin._tcp.local.` so servers can find it,
//! and browses `_sendspin-server._tcp.local.` to surface servers the client
//! could connect to. Discovery never connects by itself.

use mdns_sd::{DaemonEvent, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::{ClientConfig, DiscoveryConfig};
use crate::constants::{CLIENT_SERVICE_TYPE, DEFAULT_SERVER_PATH, SERVER_SERVICE_TYPE};
use crate::error::DiscoveryError;

/// How long to wait for the daemon to confirm the announcement
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long to wait for the daemon on unregister and shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// A server found on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub name: String,
}

impl ConnectionRequest {
    /// WebSocket URL of the server
    pub fn url(&self) -> String {
        let host = match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]", self.host),
            _ => self.host.clone(),
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("ws://{}:{}{}", host, self.port, path)
    }
}

/// Build a request from a resolved service record
fn connection_request(
    fullname: &str,
    host: IpAddr,
    port: u16,
    path: Option<&str>,
    name: Option<&str>,
) -> ConnectionRequest {
    let instance = fullname
        .strip_suffix(SERVER_SERVICE_TYPE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname);
    ConnectionRequest {
        host: host.to_string(),
        port,
        path: path
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SERVER_PATH)
            .to_string(),
        name: name
            .filter(|n| !n.is_empty())
            .unwrap_or(instance)
            .to_string(),
    }
}

struct Running {
    daemon: ServiceDaemon,
    fullname: String,
}

/// Advertises the client and reports servers seen on the network
pub struct ServiceAdvertiser {
    instance: String,
    client_id: String,
    port: u16,
    path: String,
    running: Mutex<Option<Running>>,
    requests: Mutex<Option<broadcast::Sender<ConnectionRequest>>>,
}

impl ServiceAdvertiser {
    pub fn new(client: &ClientConfig, discovery: &DiscoveryConfig) -> Self {
        let (tx, _) = broadcast::channel(REQUEST_CHANNEL_CAPACITY);
        Self {
            instance: client.name.clone(),
            client_id: client.client_id.to_string(),
            port: discovery.port,
            path: discovery.path.clone(),
            running: Mutex::new(None),
            requests: Mutex::new(Some(tx)),
        }
    }

    /// Register the client and start browsing for servers.
    ///
    /// Returns once the daemon has announced the service.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        if self.running.lock().is_some() {
            return Err(DiscoveryError::AlreadyStarted);
        }
        let requests = self
            .requests
            .lock()
            .clone()
            .ok_or_else(|| DiscoveryError::Daemon("advertiser was stopped".to_string()))?;

        let instance = self.instance.clone();
        let client_id = self.client_id.clone();
        let path = self.path.clone();
        let port = self.port;

        let running = tokio::task::spawn_blocking(move || {
            register(&instance, &client_id, &path, port, requests)
        })
        .await
        .map_err(|e| DiscoveryError::Daemon(e.to_string()))??;

        let mut slot = self.running.lock();
        if slot.is_some() {
            shutdown(&running);
            return Err(DiscoveryError::AlreadyStarted);
        }
        *slot = Some(running);
        Ok(())
    }

    /// Unregister, stop the daemon and end `incoming_connections`. Safe to
    /// call repeatedly.
    pub fn stop(&self) {
        let running = self.running.lock().take();
        self.requests.lock().take();
        if let Some(running) = running {
            shutdown(&running);
            tracing::info!(fullname = %running.fullname, "mdns: advertisement withdrawn");
        }
    }

    /// Servers discovered from now on. Ends after [`stop`](Self::stop).
    pub fn incoming_connections(&self) -> broadcast::Receiver<ConnectionRequest> {
        match self.requests.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for ServiceAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

fn register(
    instance: &str,
    client_id: &str,
    path: &str,
    port: u16,
    requests: broadcast::Sender<ConnectionRequest>,
) -> Result<Running, DiscoveryError> {
    let daemon = ServiceDaemon::new()?;
    let monitor = daemon.monitor()?;

    let host_base = gethostname::gethostname().to_string_lossy().to_string();
    let host = if host_base.ends_with(".local.") {
        host_base
    } else {
        format!("{host_base}.local.")
    };
    let ip = local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let properties: HashMap<String, String> = [
        ("path".to_string(), path.to_string()),
        ("name".to_string(), instance.to_string()),
        ("id".to_string(), client_id.to_string()),
    ]
    .into_iter()
    .collect();

    let info = ServiceInfo::new(CLIENT_SERVICE_TYPE, instance, &host, ip, port, properties)
        .map_err(|e| DiscoveryError::Registration(e.to_string()))?;
    let fullname = info.get_fullname().to_string();

    daemon
        .register(info)
        .map_err(|e| DiscoveryError::Registration(e.to_string()))?;

    let deadline = std::time::Instant::now() + ANNOUNCE_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        match monitor.recv_timeout(remaining) {
            Ok(DaemonEvent::Announce(name, addrs)) if name == fullname => {
                tracing::debug!(fullname = %name, addrs = %addrs, "mdns: announced");
                break;
            }
            Ok(DaemonEvent::Error(e)) => return Err(DiscoveryError::Registration(e.to_string())),
            Ok(_) => continue,
            Err(_) => {
                // Registered but unconfirmed, e.g. no multicast interface up
                tracing::warn!(fullname = %fullname, "mdns: no announce confirmation");
                break;
            }
        }
    }
    tracing::info!(fullname = %fullname, addr = %ip, port, "mdns: advertised client");

    match daemon.browse(SERVER_SERVICE_TYPE) {
        Ok(receiver) => {
            std::thread::Builder::new()
                .name("sendspin-mdns-browse".to_string())
                .spawn(move || {
                    tracing::info!("mdns: browsing for {}", SERVER_SERVICE_TYPE);
                    for event in receiver {
                        handle_server_event(event, &requests);
                    }
                    tracing::debug!("mdns: browse ended");
                })
                .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        }
        Err(e) => tracing::warn!(error = %e, "mdns: browse failed"),
    }

    Ok(Running { daemon, fullname })
}

fn handle_server_event(event: ServiceEvent, requests: &broadcast::Sender<ConnectionRequest>) {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let addr = info.get_addresses().iter().find_map(|ip| match ip {
                mdns_sd::ScopedIp::V4(v4) => Some(IpAddr::V4(*v4.addr())),
                _ => None,
            });
            let Some(ip) = addr else {
                tracing::warn!(fullname = %info.get_fullname(), "mdns: resolved without IPv4");
                return;
            };
            let path = info.get_property("path").map(|p| p.val_str().to_string());
            let name = info.get_property("name").map(|p| p.val_str().to_string());
            let request = connection_request(
                info.get_fullname(),
                ip,
                info.get_port(),
                path.as_deref(),
                name.as_deref(),
            );
            tracing::info!(name = %request.name, url = %request.url(), "mdns: server found");
            // No subscribers is fine
            let _ = requests.send(request);
        }
        ServiceEvent::ServiceRemoved(service_type, fullname) => {
            tracing::info!(%service_type, %fullname, "mdns: server gone");
        }
        _ => {}
    }
}

fn shutdown(running: &Running) {
    if let Ok(rx) = running.daemon.unregister(&running.fullname) {
        let _ = rx.recv_timeout(SHUTDOWN_TIMEOUT);
    }
    if let Ok(rx) = running.daemon.shutdown() {
        let _ = rx.recv_timeout(SHUTDOWN_TIMEOUT);
    }
}

/// Best-effort local IP for the advertisement
fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    if socket.connect("8.8.8.8:80").is_err() && socket.connect("1.1.1.1:80").is_err() {
        return None;
    }
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url() {
        let request = ConnectionRequest {
            host: "192.168.1.20".to_string(),
            port: 8927,
            path: "sendspin".to_string(),
            name: "Living Room".to_string(),
        };
        assert_eq!(request.url(), "ws://192.168.1.20:8927/sendspin");

        let v6 = ConnectionRequest {
            host: "fe80::1".to_string(),
            ..request
        };
        assert_eq!(v6.url(), "ws://[fe80::1]:8927/sendspin");
    }

    #[test]
    fn test_request_defaults_from_record() {
        let request = connection_request(
            "Kitchen._sendspin-server._tcp.local.",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            8927,
            None,
            Some(""),
        );
        assert_eq!(request.name, "Kitchen");
        assert_eq!(request.path, DEFAULT_SERVER_PATH);
        assert_eq!(request.url(), "ws://10.0.0.5:8927/sendspin");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_ends_requests() {
        let advertiser = ServiceAdvertiser::new(&ClientConfig::default(), &DiscoveryConfig::default());
        let mut requests = advertiser.incoming_connections();

        advertiser.stop();
        advertiser.stop();
        assert!(!advertiser.is_running());
        assert!(matches!(
            requests.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            advertiser.incoming_connections().recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(advertiser.start().await.is_err());
    }
}
