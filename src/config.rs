//! Configuration management
//!
//! Handles loading and validating server and client configuration from TOML
//! files. Tunables fall back to `QUICTUN_*` environment overrides before the
//! built-in defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::access::TargetPolicy;
use crate::reconnect::ReconnectPolicy;

/// Server configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub access: TargetPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Client configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Address to bind the QUIC listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Allow clients to request reverse listeners
    #[serde(default)]
    pub reverse: bool,
    /// Allow clients to use this server as a SOCKS5 egress
    #[serde(default)]
    pub socks5: bool,
    /// Maximum concurrent client sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            reverse: false,
            socks5: false,
            max_sessions: default_max_sessions(),
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    /// Path to private key file
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// Auto-generate self-signed cert if missing
    #[serde(default = "default_true")]
    pub auto_generate: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            auto_generate: true,
        }
    }
}

/// Client connection settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientSection {
    /// Server address (host:port)
    #[serde(default)]
    pub server: Option<String>,
    /// Server name for TLS SNI (defaults to host from address)
    #[serde(default)]
    pub server_name: Option<String>,
    /// Skip TLS certificate verification (insecure, dev only)
    #[serde(default)]
    pub insecure: bool,
    /// Extra CA certificate (PEM) to trust
    #[serde(default)]
    pub ca_path: Option<String>,
    /// Forwarding rules
    #[serde(default)]
    pub remotes: Vec<String>,
}

impl ClientSection {
    /// Get the server name for TLS SNI
    pub fn server_name_for(&self, address: &str) -> String {
        if let Some(name) = &self.server_name {
            return name.clone();
        }
        let host = address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(address);
        host.trim_start_matches('[').trim_end_matches(']').to_string()
    }
}

/// Tunnel tunables as written in the file
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    /// Liveness probe interval in seconds (0 = disabled)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// How long a forwarder waits for a session
    #[serde(default = "default_session_wait_secs")]
    pub session_wait_secs: u64,
    /// How long the server waits for the client's rule set
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Copy buffer size per direction
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Largest UDP payload relayed
    #[serde(default = "default_udp_max_payload")]
    pub udp_max_payload: usize,
    /// Idle deadline of a UDP virtual circuit
    #[serde(default = "default_udp_deadline_secs")]
    pub udp_deadline_secs: u64,
    /// Maximum concurrent UDP virtual circuits per channel
    #[serde(default = "default_udp_max_circuits")]
    pub udp_max_circuits: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            session_wait_secs: default_session_wait_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            buffer_size: default_buffer_size(),
            udp_max_payload: default_udp_max_payload(),
            udp_deadline_secs: default_udp_deadline_secs(),
            udp_max_circuits: default_udp_max_circuits(),
        }
    }
}

impl TunnelSection {
    /// Resolve into the values the tunnel fabric consumes
    pub fn resolve(&self) -> TunnelConfig {
        TunnelConfig {
            keepalive: (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs)),
            session_wait: Duration::from_secs(self.session_wait_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            buffer_size: self.buffer_size,
            udp: UdpConfig {
                max_payload: self.udp_max_payload,
                circuit_idle: Duration::from_secs(self.udp_deadline_secs),
                max_circuits: self.udp_max_circuits,
            },
        }
    }
}

/// Resolved tunnel tunables
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub keepalive: Option<Duration>,
    pub session_wait: Duration,
    pub handshake_timeout: Duration,
    pub buffer_size: usize,
    pub udp: UdpConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelSection::default().resolve()
    }
}

/// Resolved UDP multiplexer tunables
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub max_payload: usize,
    pub circuit_idle: Duration,
    pub max_circuits: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        TunnelConfig::default().udp
    }
}

/// Reconnect settings as written in the file
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Negative means unlimited
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// A session living at least this long resets the backoff
    #[serde(default = "default_sustained_secs")]
    pub sustained_secs: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            sustained_secs: default_sustained_secs(),
        }
    }
}

impl ReconnectSection {
    pub fn resolve(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
            sustained_after: Duration::from_secs(self.sustained_secs),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics endpoint
    #[serde(default)]
    pub enabled: bool,
    /// Metrics server bind address
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_metrics_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Environment overrides (`QUICTUN_<NAME>`)
pub mod env {
    /// Prefix of every override
    pub const PREFIX: &str = "QUICTUN_";

    pub fn var(name: &str) -> Option<String> {
        std::env::var(format!("{}{}", PREFIX, name)).ok()
    }

    /// Numeric override with a default fallback
    pub fn int(name: &str, default: u64) -> u64 {
        var(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// `1` or `true` (any case)
    pub fn flag(name: &str) -> bool {
        var(name)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

// Default value functions
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8443))
}
fn default_max_sessions() -> usize {
    1024
}
fn default_cert_path() -> String {
    "cert.pem".to_string()
}
fn default_key_path() -> String {
    "key.pem".to_string()
}
fn default_true() -> bool {
    true
}
fn default_keepalive_secs() -> u64 {
    env::int("KEEPALIVE_SECS", 25)
}
fn default_session_wait_secs() -> u64 {
    env::int("SESSION_WAIT_SECS", 35)
}
fn default_handshake_timeout_secs() -> u64 {
    env::int("HANDSHAKE_TIMEOUT_SECS", 10)
}
fn default_buffer_size() -> usize {
    env::int("BUFFER_SIZE", 16 * 1024) as usize
}
fn default_udp_max_payload() -> usize {
    env::int("UDP_MAX_PAYLOAD", 9012) as usize
}
fn default_udp_deadline_secs() -> u64 {
    env::int("UDP_DEADLINE_SECS", 15)
}
fn default_udp_max_circuits() -> usize {
    env::int("UDP_MAX_CIRCUITS", 100) as usize
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_secs() -> u64 {
    300
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> i64 {
    -1
}
fn default_sustained_secs() -> u64 {
    5
}
fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}
fn default_log_level() -> String {
    if env::flag("DEBUG") {
        "debug".to_string()
    } else {
        "info".to_string()
    }
}
fn default_log_format() -> String {
    "pretty".to_string()
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&contents).with_context(|| "Failed to parse config file")
}

fn validate_tunnel(tunnel: &TunnelSection) -> Result<()> {
    if tunnel.session_wait_secs == 0 {
        anyhow::bail!("tunnel.session_wait_secs must be > 0");
    }
    if tunnel.handshake_timeout_secs == 0 {
        anyhow::bail!("tunnel.handshake_timeout_secs must be > 0");
    }
    if tunnel.buffer_size == 0 {
        anyhow::bail!("tunnel.buffer_size must be > 0");
    }
    if tunnel.udp_max_payload == 0 || tunnel.udp_max_payload > u16::MAX as usize {
        anyhow::bail!("tunnel.udp_max_payload must be within 1..=65535");
    }
    if tunnel.udp_deadline_secs == 0 {
        anyhow::bail!("tunnel.udp_deadline_secs must be > 0");
    }
    if tunnel.udp_max_circuits == 0 {
        anyhow::bail!("tunnel.udp_max_circuits must be > 0");
    }
    Ok(())
}

impl ServerFileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.max_sessions == 0 {
            anyhow::bail!("server.max_sessions must be > 0");
        }
        validate_tunnel(&self.tunnel)
    }
}

impl ClientFileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.reconnect.multiplier < 1.0 {
            anyhow::bail!("reconnect.multiplier must be >= 1.0");
        }
        if self.reconnect.initial_backoff_ms == 0 {
            anyhow::bail!("reconnect.initial_backoff_ms must be > 0");
        }
        validate_tunnel(&self.tunnel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_extraction() {
        let section = ClientSection::default();
        assert_eq!(section.server_name_for("example.com:443"), "example.com");
        assert_eq!(section.server_name_for("[::1]:443"), "::1");

        let named = ClientSection {
            server_name: Some("custom.example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(named.server_name_for("example.com:443"), "custom.example.com");
    }

    #[test]
    fn test_tunnel_defaults() {
        let tunnel = TunnelSection::default().resolve();
        assert!(tunnel.udp.max_circuits > 0);
        assert!(tunnel.udp.max_payload > 0);
        assert!(tunnel.session_wait > Duration::ZERO);
    }

    #[test]
    fn test_keepalive_zero_disables_probe() {
        let tunnel = TunnelSection {
            keepalive_secs: 0,
            ..Default::default()
        };
        assert!(tunnel.resolve().keepalive.is_none());
    }

    #[test]
    fn test_parse_server_file() {
        let config: ServerFileConfig = toml::from_str(
            r#"
            [server]
            bind_addr = "127.0.0.1:9443"
            reverse = true

            [tunnel]
            udp_max_circuits = 8

            [access]
            blocked_ports = [25]
            "#,
        )
        .unwrap();
        assert!(config.server.reverse);
        assert!(!config.server.socks5);
        assert_eq!(config.tunnel.udp_max_circuits, 8);
        assert_eq!(config.access.blocked_ports, vec![25]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_client_file() {
        let config: ClientFileConfig = toml::from_str(
            r#"
            [client]
            server = "example.com:8443"
            remotes = ["3000", "R:2222:localhost:22"]

            [reconnect]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.client.remotes.len(), 2);
        let policy = config.reconnect.resolve();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.sustained_after, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_tunnel_rejected() {
        let config = ServerFileConfig {
            tunnel: TunnelSection {
                udp_max_circuits: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_int_override() {
        std::env::set_var("QUICTUN_CONFIG_TEST_ONLY", "42");
        assert_eq!(env::int("CONFIG_TEST_ONLY", 7), 42);
        assert_eq!(env::int("CONFIG_TEST_MISSING", 7), 7);
        std::env::remove_var("QUICTUN_CONFIG_TEST_ONLY");
    }
}
