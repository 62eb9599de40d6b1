use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    time::Duration,
};

use lanclip_core::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_PAIRING_PORT, DEFAULT_RECEIVE_BUFFER_SIZE, DEFAULT_RELAY_PORT,
    MAX_MESSAGE_BYTES, UNKNOWN_DEVICE_NAME,
};

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CLIPBOARD_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

const DATA_DIR_ENV: &str = "LANCLIP_DATA_DIR";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address every listener binds to.
    pub bind_ip: IpAddr,
    /// Address reported in outgoing messages and used to drop our own
    /// broadcasts. Detected from the default route when unset.
    pub advertise_ip: Option<IpAddr>,
    /// Destination of presence broadcasts.
    pub broadcast_ip: IpAddr,
    /// Name reported to peers. Falls back to the host name.
    pub device_name: Option<String>,
    pub discovery_port: u16,
    pub pairing_port: u16,
    pub relay_port: u16,
    pub broadcast_interval: Duration,
    pub liveness_timeout: Duration,
    pub timeout_check_interval: Duration,
    pub clipboard_poll_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Largest discovery datagram accepted.
    pub receive_buffer_size: usize,
    /// Largest pairing or clipboard message read from one connection.
    pub max_message_bytes: usize,
    pub data_dir: PathBuf,
    pub discovery_enabled: bool,
    pub sync_enabled: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ip: None,
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            device_name: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            pairing_port: DEFAULT_PAIRING_PORT,
            relay_port: DEFAULT_RELAY_PORT,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            timeout_check_interval: DEFAULT_TIMEOUT_CHECK_INTERVAL,
            clipboard_poll_interval: DEFAULT_CLIPBOARD_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            max_message_bytes: MAX_MESSAGE_BYTES,
            data_dir: default_data_dir(),
            discovery_enabled: true,
            sync_enabled: true,
        }
    }
}

impl NodeConfig {
    pub fn resolve_identity(&self) -> LocalIdentity {
        let ip = self
            .advertise_ip
            .or_else(|| (!self.bind_ip.is_unspecified()).then_some(self.bind_ip))
            .or_else(detect_local_ip)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let name = self
            .device_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(local_hostname);
        LocalIdentity { ip, name }
    }
}

/// How this host presents itself to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub ip: IpAddr,
    pub name: String,
}

pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(base) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(base).join("lanclip");
    }
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".lanclip"))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn local_hostname() -> String {
    std::env::var("COMPUTERNAME")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_owned())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_owned())
}

/// Address of the interface that carries the default route. Connecting a UDP
/// socket sends nothing; it only selects the source address.
pub fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).ok()?;
    socket
        .connect(SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 80)))
        .ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.relay_port, 65432);
        assert_eq!(config.discovery_port, 65433);
        assert_eq!(config.pairing_port, 65434);
        assert_eq!(config.broadcast_interval, Duration::from_secs(5));
        assert_eq!(config.liveness_timeout, Duration::from_secs(15));
        assert_eq!(config.receive_buffer_size, 4096);
    }

    #[test]
    fn explicit_identity_wins() {
        let config = NodeConfig {
            advertise_ip: Some("192.168.4.9".parse().unwrap()),
            device_name: Some("studio".to_owned()),
            ..NodeConfig::default()
        };
        let identity = config.resolve_identity();
        assert_eq!(identity.ip, "192.168.4.9".parse::<IpAddr>().unwrap());
        assert_eq!(identity.name, "studio");
    }

    #[test]
    fn specific_bind_ip_is_advertised() {
        let config = NodeConfig {
            bind_ip: "127.0.0.2".parse().unwrap(),
            device_name: Some("   ".to_owned()),
            ..NodeConfig::default()
        };
        let identity = config.resolve_identity();
        assert_eq!(identity.ip, "127.0.0.2".parse::<IpAddr>().unwrap());
        assert!(!identity.name.trim().is_empty());
    }
}
