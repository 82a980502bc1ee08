//! Channel-backed tunnel
//!
//! The engine has no TUN device of its own. The host owns the interface and
//! exchanges plaintext IP packets with the engine through a [`TunnelHandle`].

use tokio::sync::mpsc;

use ovpn_protocol::Tunnel;

/// Packets buffered in each direction
pub const TUNNEL_QUEUE_SIZE: usize = 1024;

/// Host side of the tunnel
#[derive(Debug)]
pub struct TunnelHandle {
    /// IP packets to encrypt and send to the server
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Decrypted IP packets received from the server
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// Session side of the tunnel
///
/// Writes never block; packets are dropped when the host falls behind.
#[derive(Debug)]
pub struct ChannelTunnel {
    persistent: bool,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelTunnel {
    /// Create a tunnel and its host handle, plus the receiver of the host's
    /// outbound packets for the engine to drain
    pub fn new(persistent: bool) -> (Self, TunnelHandle, mpsc::Receiver<Vec<u8>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(TUNNEL_QUEUE_SIZE);
        let (outbound_tx, outbound_rx) = mpsc::channel(TUNNEL_QUEUE_SIZE);
        (
            Self {
                persistent,
                tx: inbound_tx,
            },
            TunnelHandle {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            outbound_rx,
        )
    }
}

impl Tunnel for ChannelTunnel {
    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn write_packets(&self, packets: &[Vec<u8>]) -> ovpn_protocol::Result<()> {
        for packet in packets {
            match self.tx.try_send(packet.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("Tunnel queue full, dropping {} bytes", packet.len());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(ovpn_protocol::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "tunnel closed",
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_packets_reach_host() {
        let (tunnel, mut handle, mut outbound) = ChannelTunnel::new(true);
        assert!(tunnel.is_persistent());

        tunnel.write_packets(&[vec![0x45, 1], vec![0x45, 2]]).unwrap();
        assert_eq!(handle.inbound.recv().await, Some(vec![0x45, 1]));
        assert_eq!(handle.inbound.recv().await, Some(vec![0x45, 2]));

        handle.outbound.send(vec![0x45, 3]).await.unwrap();
        assert_eq!(outbound.recv().await, Some(vec![0x45, 3]));
    }

    #[tokio::test]
    async fn test_full_queue_drops_packets() {
        let (tunnel, mut handle, _outbound) = ChannelTunnel::new(false);
        let burst = vec![vec![0u8; 4]; TUNNEL_QUEUE_SIZE + 10];
        tunnel.write_packets(&burst).unwrap();

        let mut count = 0;
        while handle.inbound.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, TUNNEL_QUEUE_SIZE);
    }

    #[tokio::test]
    async fn test_closed_host_fails_writes() {
        let (tunnel, handle, _outbound) = ChannelTunnel::new(false);
        drop(handle);
        assert!(tunnel.write_packets(&[vec![1]]).is_err());
    }
}
