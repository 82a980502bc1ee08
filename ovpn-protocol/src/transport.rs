//! Abstract I/O endpoints driven by the session
//!
//! The session never performs I/O on its own. It writes through two traits:
//! - [`Link`]: the physical connection to the server (UDP or TCP)
//! - [`Tunnel`]: the virtual interface receiving decrypted IP packets
//!
//! Reads happen in the host, which feeds packets back into the session.
//! Writes are fire-and-forget; a write that fails after returning is reported
//! to the session through `SessionProxy::link_write_failed`.
//!
//! The [`mock`] module provides in-memory implementations for testing.

pub mod mock;

use std::time::Duration;

use crate::error::Result;
use crate::settings::{CommunicationType, EncryptionParameters};

/// Maximum control payload per packet on datagram links
pub const DEFAULT_LINK_MTU: usize = 1000;

/// Connection to the VPN server
pub trait Link: Send {
    /// Whether the transport guarantees delivery and ordering (TCP)
    fn is_reliable(&self) -> bool;

    /// Largest control payload to put in one packet
    fn mtu(&self) -> usize;

    /// Literal address of the remote host, if known
    fn remote_address(&self) -> Option<String>;

    /// Number of packets the link buffers per read
    fn packet_buffer_size(&self) -> usize;

    fn negotiation_timeout(&self) -> Duration;

    fn hard_reset_timeout(&self) -> Duration;

    fn communication_type(&self) -> CommunicationType {
        CommunicationType::Vanilla
    }

    /// Payload to attach to the client hard reset
    fn hard_reset(&self, encryption: &EncryptionParameters) -> Result<Option<Vec<u8>>> {
        self.communication_type().hard_reset_payload(encryption)
    }

    fn write_packets(&self, packets: &[Vec<u8>]) -> Result<()>;

    fn write_packet(&self, packet: &[u8]) -> Result<()> {
        self.write_packets(&[packet.to_vec()])
    }
}

/// Virtual interface carrying plaintext IP packets
pub trait Tunnel: Send + Sync {
    /// Whether the tunnel survives a session reconnect
    fn is_persistent(&self) -> bool;

    fn write_packets(&self, packets: &[Vec<u8>]) -> Result<()>;
}
