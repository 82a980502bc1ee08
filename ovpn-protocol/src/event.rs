//! Session lifecycle notifications

use std::net::Ipv4Addr;

/// Events emitted by a [`crate::SessionProxy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server pushed its configuration and data can flow
    Started {
        /// Literal address of the server, if the link knows it
        remote_address: Option<String>,
        /// Tunnel address assigned to this client
        address: Ipv4Addr,
        gateway_address: Ipv4Addr,
        dns_servers: Vec<Ipv4Addr>,
    },

    /// The session stopped; the host should reconnect if asked to
    Stopped {
        should_reconnect: bool,
        /// Description of the error that stopped the session
        reason: Option<String>,
    },
}

/// Receiver of session events
///
/// Called synchronously from inside session entry points, so implementations
/// should hand the event off rather than re-enter the session.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

/// Event handler that only logs
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Started {
                remote_address,
                address,
                gateway_address,
                dns_servers,
            } => {
                log::info!(
                    "Session started: remote={}, address={}, gateway={}, dns={:?}",
                    remote_address.as_deref().unwrap_or("?"),
                    address,
                    gateway_address,
                    dns_servers
                );
            }
            SessionEvent::Stopped {
                should_reconnect,
                reason,
            } => {
                log::info!(
                    "Session stopped (reconnect: {}): {}",
                    should_reconnect,
                    reason.as_deref().unwrap_or("requested")
                );
            }
        }
    }
}
