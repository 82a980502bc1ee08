//! VPN events and state management

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// VPN connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnState {
    /// VPN is not running
    Disconnected,
    /// Link open, negotiating with the server
    Connecting,
    /// Tunnel settings received, data channel up
    Connected,
    /// Waiting to retry after a connection loss
    Reconnecting,
    /// Disconnecting gracefully
    Disconnecting,
    /// Gave up after an unrecoverable error
    Error,
}

impl VpnState {
    /// Check if the VPN is in an active state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VpnState::Connecting | VpnState::Connected | VpnState::Reconnecting
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, VpnState::Connected)
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            VpnState::Disconnected => "Disconnected",
            VpnState::Connecting => "Connecting...",
            VpnState::Connected => "Connected",
            VpnState::Reconnecting => "Reconnecting...",
            VpnState::Disconnecting => "Disconnecting...",
            VpnState::Error => "Error",
        }
    }
}

impl std::fmt::Display for VpnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Statistics about the VPN connection
#[derive(Debug, Clone, Default)]
pub struct VpnStats {
    /// Decrypted bytes received from the server
    pub bytes_rx: u64,
    /// Plaintext bytes sent to the server
    pub bytes_tx: u64,
    /// Time since the current session connected
    pub uptime: Duration,
    /// Number of reconnects since start
    pub reconnects: u32,
    pub last_rx: Option<Instant>,
    pub last_tx: Option<Instant>,
}

impl VpnStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update with received bytes
    pub fn record_rx(&mut self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.bytes_rx += bytes;
        self.last_rx = Some(Instant::now());
    }

    /// Update with transmitted bytes
    pub fn record_tx(&mut self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.bytes_tx += bytes;
        self.last_tx = Some(Instant::now());
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_rx + self.bytes_tx
    }
}

/// Events emitted by the VPN engine
#[derive(Debug, Clone)]
pub enum VpnEvent {
    /// State changed
    StateChanged { old: VpnState, new: VpnState },

    /// Session established with the pushed tunnel settings
    Connected {
        /// Server the link is connected to
        remote: SocketAddr,
        /// Tunnel address assigned to the client
        address: String,
        /// Tunnel gateway
        gateway: String,
        dns_servers: Vec<String>,
    },

    /// Session ended
    Disconnected {
        /// Reason for disconnection
        reason: String,
    },

    /// Statistics update
    StatsUpdate(VpnStats),

    /// Error occurred
    Error {
        message: String,
        /// Whether the engine will retry
        recoverable: bool,
    },

    /// Log message
    Log { level: LogLevel, message: String },
}

/// Log levels for VPN events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Event handler trait for receiving VPN events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a VPN event
    async fn on_event(&self, event: VpnEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: VpnEvent) {
        match event {
            VpnEvent::StateChanged { old, new } => {
                log::info!("VPN state: {} -> {}", old, new);
            }
            VpnEvent::Connected {
                remote,
                address,
                gateway,
                dns_servers,
            } => {
                log::info!(
                    "Connected to {}: address={}, gateway={}, dns=[{}]",
                    remote,
                    address,
                    gateway,
                    dns_servers.join(", ")
                );
            }
            VpnEvent::Disconnected { reason } => {
                log::info!("Disconnected: {}", reason);
            }
            VpnEvent::StatsUpdate(stats) => {
                log::debug!(
                    "Stats: rx={} tx={} uptime={:?} reconnects={}",
                    stats.bytes_rx,
                    stats.bytes_tx,
                    stats.uptime,
                    stats.reconnects
                );
            }
            VpnEvent::Error {
                message,
                recoverable,
            } => {
                if recoverable {
                    log::warn!("Recoverable error: {}", message);
                } else {
                    log::error!("Error: {}", message);
                }
            }
            VpnEvent::Log { level, message } => match level {
                LogLevel::Debug => log::debug!("{}", message),
                LogLevel::Info => log::info!("{}", message),
                LogLevel::Warning => log::warn!("{}", message),
                LogLevel::Error => log::error!("{}", message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_flags() {
        assert!(VpnState::Connecting.is_active());
        assert!(VpnState::Reconnecting.is_active());
        assert!(!VpnState::Error.is_active());
        assert!(VpnState::Connected.is_connected());
        assert_eq!(VpnState::Reconnecting.to_string(), "Reconnecting...");
    }

    #[test]
    fn test_stats_ignore_empty_updates() {
        let mut stats = VpnStats::new();
        stats.record_rx(0);
        assert!(stats.last_rx.is_none());

        stats.record_rx(100);
        stats.record_tx(40);
        assert_eq!(stats.total_bytes(), 140);
        assert!(stats.last_rx.is_some());
        assert!(stats.last_tx.is_some());
    }
}
