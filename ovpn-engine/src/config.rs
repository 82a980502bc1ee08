//! Configuration types for the VPN engine

use rand::prelude::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ovpn_protocol::{
    CipherAlgorithm, CommunicationType, Credentials, DigestAlgorithm, EncryptionParameters,
    Handshake, SessionOptions, DEFAULT_LINK_MTU,
};

use crate::error::{Error, Result};

/// Main configuration structure
///
/// The configuration file uses TOML format. `[common]` holds engine-wide
/// settings, `[client]` describes the server to connect to.
///
/// # Example Configuration
///
/// ```toml
/// [common]
/// log_level = "info"
/// reconnect_delay = 5
///
/// [client]
/// remote = ["vpn1.example.com:1194", "vpn2.example.com:1194"]
/// proto = "udp"
/// cipher = "AES-128-GCM"
/// digest = "SHA1"
/// ca = "/etc/ovpn/ca.pem"
/// username = "user"
/// password = "pass"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine-wide settings
    #[serde(default)]
    pub common: CommonConfig,

    /// Client configuration
    pub client: Option<ClientConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.common.mtu < 100 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 100)",
                self.common.mtu
            )));
        }

        if let Some(ref client) = self.client {
            client.validate()?;
        }

        Ok(())
    }

    /// Get the client configuration, or error if not present
    pub fn client_config(&self) -> Result<&ClientConfig> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Config("client configuration is required".into()))
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# OpenVPN client configuration

[common]
# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

# Largest control channel payload per datagram (default: 1000)
mtu = 1000

# Seconds to wait before reconnecting (default: 5)
reconnect_delay = 5

# Maximum reconnect attempts (0 = unlimited)
max_reconnect_attempts = 0

# Seconds between statistics events (0 = disabled, default: 60)
stats_interval = 60

[client]
# Server address(es) as host:port; a random one is picked per attempt
remote = "vpn.example.com:1194"
# remote = ["vpn1.example.com:1194", "vpn2.example.com:1194"]

# Transport: "udp" or "tcp"
proto = "udp"

# Data channel algorithms
# cipher: AES-128-CBC, AES-192-CBC, AES-256-CBC, AES-128-GCM, AES-256-GCM
# digest: SHA1, SHA256, SHA512 (ignored for GCM)
cipher = "AES-128-CBC"
digest = "SHA1"

# CA certificate (PEM) used to verify the server
ca = "/etc/ovpn/ca.pem"

# Optional client certificate and key (PEM)
# cert = "/etc/ovpn/client.pem"
# key = "/etc/ovpn/client.key"

username = "user"
password = "pass"

# Server dialect: "vanilla" or "pia"
communication_type = "vanilla"

# Renegotiate data channel keys after this many seconds (optional)
# renegotiate_after = 3600

# Send keep-alive pings (default: true)
keep_alive = true

# Seconds to wait for the server's hard reset reply (default: 2 on UDP, 5 on TCP)
# hard_reset_timeout = 2

# Seconds allowed for the full negotiation (default: 10)
# negotiation_timeout = 10
"#
        .to_string()
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Largest control channel payload per datagram
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Reconnect delay in seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,

    /// Maximum reconnect attempts (0 = unlimited)
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    /// Seconds between statistics events (0 = disabled)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            mtu: default_mtu(),
            reconnect_delay: default_reconnect_delay(),
            max_reconnect_attempts: 0,
            stats_interval: default_stats_interval(),
        }
    }
}

impl CommonConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    /// Statistics period, `None` when disabled
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }
}

/// Remote server address(es)
///
/// Examples:
/// - Single: `remote = "vpn.example.com:1194"`
/// - Multiple: `remote = ["vpn1.example.com:1194", "10.1.2.3:1194"]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteAddress {
    Single(String),
    Multiple(Vec<String>),
}

impl RemoteAddress {
    /// Get all entries as a slice
    pub fn entries(&self) -> Vec<&str> {
        match self {
            RemoteAddress::Single(s) => vec![s.as_str()],
            RemoteAddress::Multiple(v) => v.iter().map(|s| s.as_str()).collect(),
        }
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        match self {
            RemoteAddress::Single(s) => s.is_empty(),
            RemoteAddress::Multiple(v) => v.is_empty() || v.iter().all(|s| s.is_empty()),
        }
    }
}

/// Link transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    #[default]
    Udp,
    Tcp,
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Proto::Udp => write!(f, "UDP"),
            Proto::Tcp => write!(f, "TCP"),
        }
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address(es) as `host:port`
    pub remote: RemoteAddress,

    /// Transport protocol
    #[serde(default)]
    pub proto: Proto,

    /// Data channel cipher, OpenSSL-style name
    #[serde(default = "default_cipher")]
    pub cipher: String,

    /// Data channel HMAC digest, ignored by AEAD ciphers
    #[serde(default = "default_digest")]
    pub digest: String,

    /// Path to the CA certificate (PEM)
    pub ca: String,

    /// Path to the client certificate (PEM)
    #[serde(default)]
    pub cert: Option<String>,

    /// Path to the client private key (PEM)
    #[serde(default)]
    pub key: Option<String>,

    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Server dialect: "vanilla" or "pia"
    #[serde(default = "default_communication_type")]
    pub communication_type: String,

    /// Soft reset the data channel keys after this many seconds
    #[serde(default)]
    pub renegotiate_after: Option<u64>,

    /// Send keep-alive pings
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Seconds to wait for the server's hard reset reply
    #[serde(default)]
    pub hard_reset_timeout: Option<u64>,

    /// Seconds allowed for the full negotiation
    #[serde(default)]
    pub negotiation_timeout: Option<u64>,
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Result<()> {
        if self.remote.is_empty() {
            return Err(Error::Config("remote address is required".into()));
        }

        for entry in self.remote.entries() {
            let port_ok = entry
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !port_ok {
                return Err(Error::Config(format!(
                    "remote '{}' must be host:port",
                    entry
                )));
            }
        }

        self.cipher_algorithm()?;
        self.digest_algorithm()?;
        self.communication_type()?;

        if self.ca.is_empty() {
            return Err(Error::Config("ca is required".into()));
        }

        if self.cert.is_some() != self.key.is_some() {
            return Err(Error::Config("cert and key must be set together".into()));
        }

        if self.username.is_empty() {
            return Err(Error::Config("username is required".into()));
        }

        if self.renegotiate_after == Some(0) {
            return Err(Error::Config("renegotiate_after cannot be 0".into()));
        }

        Ok(())
    }

    pub fn cipher_algorithm(&self) -> Result<CipherAlgorithm> {
        self.cipher.parse::<CipherAlgorithm>().map_err(|e| Error::Config(format!("cipher: {}", e)))
    }

    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm> {
        self.digest.parse::<DigestAlgorithm>().map_err(|e| Error::Config(format!("digest: {}", e)))
    }

    pub fn communication_type(&self) -> Result<CommunicationType> {
        self.communication_type
            .parse::<CommunicationType>()
            .map_err(|e| Error::Config(format!("communication type: {}", e)))
    }

    /// Read the certificate files and build the session's encryption parameters
    pub fn encryption(&self) -> Result<EncryptionParameters> {
        let ca_pem = read_pem(&self.ca, "ca")?;
        let handshake = match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Handshake::CaCertKey {
                ca_pem,
                cert_pem: read_pem(cert, "cert")?,
                key_pem: read_pem(key, "key")?.into(),
            },
            _ => Handshake::CaOnly { ca_pem },
        };
        Ok(EncryptionParameters::new(
            self.cipher_algorithm()?,
            self.digest_algorithm()?,
            handshake,
        )?)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            sends_keep_alive: self.keep_alive,
            renegotiates_after: self.renegotiate_after.map(Duration::from_secs),
            ..SessionOptions::default()
        }
    }

    pub fn hard_reset_timeout(&self) -> Duration {
        let default = match self.proto {
            Proto::Udp => 2,
            Proto::Tcp => 5,
        };
        Duration::from_secs(self.hard_reset_timeout.unwrap_or(default))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout.unwrap_or(10))
    }

    /// Resolve every configured remote
    ///
    /// Unresolvable entries are skipped with an error log.
    pub fn resolve_remotes(&self) -> Result<Vec<SocketAddr>> {
        let mut addrs = Vec::new();

        for entry in self.remote.entries() {
            match entry.to_socket_addrs() {
                Ok(resolved) => {
                    for addr in resolved {
                        if !addrs.contains(&addr) {
                            addrs.push(addr);
                        }
                    }
                }
                Err(e) => {
                    log::error!("Skipping invalid remote '{}': {}", entry, e);
                }
            }
        }

        if addrs.is_empty() {
            return Err(Error::Config("no remote addresses could be resolved".into()));
        }

        Ok(addrs)
    }

    /// Pick a random remote for the next connection attempt
    pub fn random_remote(&self, addrs: &[SocketAddr]) -> Option<SocketAddr> {
        addrs.choose(&mut rand::rng()).copied()
    }
}

fn read_pem(path: &str, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {} '{}': {}", what, path, e)))
}

// Default value functions
fn default_mtu() -> u16 {
    DEFAULT_LINK_MTU as u16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_stats_interval() -> u64 {
    60
}

fn default_cipher() -> String {
    "AES-128-CBC".to_string()
}

fn default_digest() -> String {
    "SHA1".to_string()
}

fn default_communication_type() -> String {
    "vanilla".to_string()
}

fn default_true() -> bool {
    true
}
