//! Semantic configuration consumed by the core.
//!
//! The structs here mirror the nested option record; reading them from a
//! file (and the format used) is the embedding application's concern. Every
//! section defaults so a partial record deserializes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub listeners: Vec<ListenerConfig>,
    pub peers: Vec<PeerConfig>,
    pub socks5: Socks5Config,
    pub exit: ExitConfig,
    pub routing: RoutingConfig,
    pub connections: ConnectionsConfig,
    pub limits: LimitsConfig,
    pub udp: UdpConfig,
    pub icmp: IcmpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// `"auto"` generates and persists an id on first start.
    pub id: String,
    pub data_dir: PathBuf,
    pub display_name: String,
    pub log_level: String,
    pub log_format: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: "auto".into(),
            data_dir: PathBuf::from("."),
            display_name: String::new(),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub transport: TransportKind,
    pub address: String,
    /// URL path for h2/ws listeners.
    pub path: Option<String>,
    pub tls: TlsConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Quic,
            address: String::new(),
            path: None,
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub client_ca: Option<PathBuf>,
    /// Pinned peer certificate fingerprint (hex SHA-256).
    pub fingerprint: Option<String>,
    /// ws only: run without TLS behind a terminating reverse proxy.
    pub plaintext: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Expected remote agent id, 32 hex chars.
    pub id: Option<String>,
    pub transport: TransportKind,
    pub address: String,
    pub path: Option<String>,
    pub proxy: Option<String>,
    pub proxy_auth: Option<String>,
    pub tls: TlsConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: None,
            transport: TransportKind::Quic,
            address: String::new(),
            path: None,
            proxy: None,
            proxy_auth: None,
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Socks5Config {
    pub enabled: bool,
    pub address: String,
    pub auth: SocksAuthConfig,
    pub max_connections: usize,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:1080".into(),
            auth: SocksAuthConfig::default(),
            max_connections: 512,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksAuthConfig {
    pub enabled: bool,
    pub users: Vec<SocksUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksUser {
    pub username: String,
    /// bcrypt hash of the password.
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub enabled: bool,
    /// CIDR prefixes and domain patterns this agent advertises and serves.
    pub routes: Vec<String>,
    pub dns: DnsConfig,
    pub connect_timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            routes: Vec::new(),
            dns: DnsConfig::default(),
            connect_timeout_secs: 30,
            max_connections: 1024,
        }
    }
}

impl ExitConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub servers: Vec<SocketAddr>,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout_secs: 5,
            cache_ttl_secs: 30,
        }
    }
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub advertise_interval_secs: u64,
    pub route_ttl_secs: u64,
    pub max_hops: u8,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            advertise_interval_secs: 120,
            route_ttl_secs: 300,
            max_hops: 16,
        }
    }
}

impl RoutingConfig {
    pub fn advertise_interval(&self) -> Duration {
        Duration::from_secs(self.advertise_interval_secs)
    }

    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl_secs)
    }

    /// Expiry sweep cadence: a quarter of the route TTL.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs((self.route_ttl_secs / 4).max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Idle time before a keepalive probe is sent.
    pub idle_threshold_secs: u64,
    /// Time to wait for KEEPALIVE_ACK before declaring the peer dead.
    pub timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: 300,
            timeout_secs: 90,
            handshake_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ConnectionsConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub multiplier: f64,
    /// Fractional jitter applied both ways around the computed delay.
    pub jitter: f64,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 1,
            max_delay_secs: 60,
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given zero-based attempt, jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_secs as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_secs as f64);
        let jitter_span = capped * self.jitter;
        let offset = if jitter_span > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + offset).max(0.05))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_streams_per_peer: usize,
    pub max_streams_total: usize,
    pub max_pending_opens: usize,
    pub stream_open_timeout_secs: u64,
    pub idle_stream_timeout_secs: u64,
    /// Receive buffer depth per stream, in chunks.
    pub buffer_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_streams_per_peer: 1000,
            max_streams_total: 10_000,
            max_pending_opens: 100,
            stream_open_timeout_secs: 30,
            idle_stream_timeout_secs: 300,
            buffer_size: 64,
        }
    }
}

impl LimitsConfig {
    pub fn stream_open_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_open_timeout_secs)
    }

    pub fn idle_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_stream_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub enabled: bool,
    /// Destination ports the exit will relay to; empty allows all.
    pub allowed_ports: Vec<u16>,
    pub idle_timeout_secs: u64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_ports: Vec::new(),
            idle_timeout_secs: 120,
        }
    }
}

impl UdpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.is_empty() || self.allowed_ports.contains(&port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpConfig {
    pub enabled: bool,
    /// CIDR allow-list for echo targets; empty allows all.
    pub allowed_cidrs: Vec<String>,
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub echo_timeout_secs: u64,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_cidrs: Vec::new(),
            max_sessions: 64,
            idle_timeout_secs: 60,
            echo_timeout_secs: 5,
        }
    }
}

impl IcmpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_secs(self.echo_timeout_secs)
    }
}
