//! Tokio-backed links to the VPN server.
//!
//! Each link owns a reader task and a writer task. The session writes through
//! the synchronous [`Link`] trait, which only queues packets for the writer
//! task; the reader task reports everything it receives as [`LinkEvent`]s on
//! a channel the engine selects on.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ovpn_protocol::{stream, CommunicationType, Link, StreamBuffer, DEFAULT_LINK_MTU};

/// Packets the session reads per link event
const PACKET_BUFFER_SIZE: usize = 200;

/// Receive buffer for a single read
const RECV_BUFFER_SIZE: usize = 65536;

/// Queued link events before the reader waits on the engine
const EVENT_QUEUE_SIZE: usize = 1024;

/// Largest control payload on a stream link, leaving room for the headers
const TCP_MTU: usize = u16::MAX as usize - 64;

/// What a link reports back to the engine
#[derive(Debug)]
pub enum LinkEvent {
    /// Packets received from the server
    Packets(Vec<Vec<u8>>),
    /// A queued write could not be sent
    WriteFailed(String),
    /// The link stopped receiving
    Closed(String),
}

/// Session-facing parameters of a link
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub mtu: usize,
    pub hard_reset_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub communication_type: CommunicationType,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_LINK_MTU,
            hard_reset_timeout: Duration::from_secs(2),
            negotiation_timeout: Duration::from_secs(10),
            communication_type: CommunicationType::Vanilla,
        }
    }
}

/// Connected UDP socket
pub struct UdpLink {
    remote: SocketAddr,
    local: SocketAddr,
    options: LinkOptions,
    writer: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpLink {
    /// Bind an ephemeral local port and connect it to `remote`
    pub async fn connect(
        remote: SocketAddr,
        options: LinkOptions,
    ) -> io::Result<(Self, mpsc::Receiver<LinkEvent>)> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().map_err(invalid_input)?
        } else {
            "[::]:0".parse().map_err(invalid_input)?
        };

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(remote).await?;
        let local = socket.local_addr()?;
        log::debug!("UDP link {} -> {}", local, remote);

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (writer, mut write_rx) = mpsc::unbounded_channel::<Vec<Vec<u8>>>();

        let socket_read = socket.clone();
        let events = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match socket_read.recv(&mut buf).await {
                    Ok(n) => {
                        if events.send(LinkEvent::Packets(vec![buf[..n].to_vec()])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("UDP recv error: {}", e);
                        let _ = events.send(LinkEvent::Closed(e.to_string())).await;
                        break;
                    }
                }
            }
        });

        let write_task = tokio::spawn(async move {
            while let Some(packets) = write_rx.recv().await {
                for packet in packets {
                    if let Err(e) = socket.send(&packet).await {
                        log::debug!("UDP send error: {}", e);
                        let _ = event_tx.send(LinkEvent::WriteFailed(e.to_string())).await;
                        return;
                    }
                }
            }
        });

        Ok((
            Self {
                remote,
                local,
                options,
                writer,
                tasks: vec![reader, write_task],
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl Link for UdpLink {
    fn is_reliable(&self) -> bool {
        false
    }

    fn mtu(&self) -> usize {
        self.options.mtu
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.remote.ip().to_string())
    }

    fn packet_buffer_size(&self) -> usize {
        PACKET_BUFFER_SIZE
    }

    fn negotiation_timeout(&self) -> Duration {
        self.options.negotiation_timeout
    }

    fn hard_reset_timeout(&self) -> Duration {
        self.options.hard_reset_timeout
    }

    fn communication_type(&self) -> CommunicationType {
        self.options.communication_type
    }

    fn write_packets(&self, packets: &[Vec<u8>]) -> ovpn_protocol::Result<()> {
        self.writer
            .send(packets.to_vec())
            .map_err(|_| ovpn_protocol::Error::FailedLinkWrite)
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// TCP connection carrying length-prefixed packets
pub struct TcpLink {
    remote: SocketAddr,
    options: LinkOptions,
    writer: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpLink {
    /// Connect to `remote`, giving up after the hard reset timeout
    pub async fn connect(
        remote: SocketAddr,
        options: LinkOptions,
    ) -> io::Result<(Self, mpsc::Receiver<LinkEvent>)> {
        let tcp = tokio::time::timeout(options.hard_reset_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TCP connect timed out"))??;
        tcp.set_nodelay(true)?;
        log::debug!("TCP link {} -> {}", tcp.local_addr()?, remote);

        let (mut read_half, mut write_half) = tcp.into_split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (writer, mut write_rx) = mpsc::unbounded_channel::<Vec<Vec<u8>>>();

        let events = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            let mut framing = StreamBuffer::new();
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = events
                            .send(LinkEvent::Closed("connection closed by peer".into()))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        let packets = framing.push(&buf[..n]);
                        if packets.is_empty() {
                            continue;
                        }
                        if events.send(LinkEvent::Packets(packets)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("TCP read error: {}", e);
                        let _ = events.send(LinkEvent::Closed(e.to_string())).await;
                        break;
                    }
                }
            }
        });

        let write_task = tokio::spawn(async move {
            while let Some(packets) = write_rx.recv().await {
                let raw = match stream(packets.as_slice()) {
                    Ok(raw) => raw,
                    Err(e) => {
                        log::error!("TCP framing error: {}", e);
                        let _ = event_tx.send(LinkEvent::WriteFailed(e.to_string())).await;
                        return;
                    }
                };
                if let Err(e) = write_half.write_all(&raw).await {
                    log::debug!("TCP write error: {}", e);
                    let _ = event_tx.send(LinkEvent::WriteFailed(e.to_string())).await;
                    return;
                }
            }
        });

        Ok((
            Self {
                remote,
                options,
                writer,
                tasks: vec![reader, write_task],
            },
            event_rx,
        ))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl Link for TcpLink {
    fn is_reliable(&self) -> bool {
        true
    }

    fn mtu(&self) -> usize {
        TCP_MTU
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.remote.ip().to_string())
    }

    fn packet_buffer_size(&self) -> usize {
        PACKET_BUFFER_SIZE
    }

    fn negotiation_timeout(&self) -> Duration {
        self.options.negotiation_timeout
    }

    fn hard_reset_timeout(&self) -> Duration {
        self.options.hard_reset_timeout
    }

    fn communication_type(&self) -> CommunicationType {
        self.options.communication_type
    }

    fn write_packets(&self, packets: &[Vec<u8>]) -> ovpn_protocol::Result<()> {
        self.writer
            .send(packets.to_vec())
            .map_err(|_| ovpn_protocol::Error::FailedLinkWrite)
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn invalid_input(e: std::net::AddrParseError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn next_packets(rx: &mut mpsc::Receiver<LinkEvent>) -> Vec<Vec<u8>> {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(LinkEvent::Packets(packets))) => packets,
            other => panic!("expected packets, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_udp_link_exchanges_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let (link, mut events) = UdpLink::connect(server_addr, LinkOptions::default())
            .await
            .unwrap();
        assert!(!link.is_reliable());
        assert_eq!(link.mtu(), DEFAULT_LINK_MTU);
        assert_eq!(link.remote_address().as_deref(), Some("127.0.0.1"));

        link.write_packets(&[vec![1, 2, 3], vec![4, 5]]).unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        assert_eq!(from.port(), link.local_addr().port());
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[4, 5]);

        server.send_to(&[9, 9], from).await.unwrap();
        assert_eq!(next_packets(&mut events).await, vec![vec![9, 9]]);
    }

    #[tokio::test]
    async fn test_tcp_link_frames_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let (link, mut events) = TcpLink::connect(server_addr, LinkOptions::default())
            .await
            .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        assert!(link.is_reliable());
        assert!(link.mtu() > DEFAULT_LINK_MTU);

        link.write_packet(&[0x38, 0xaa]).unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x00, 0x02, 0x38, 0xaa]);

        // one packet split across writes, then two in a single write
        server.write_all(&[0x00, 0x03, 0x01]).await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server
            .write_all(&[0x02, 0x03, 0x00, 0x01, 0x07, 0x00, 0x01, 0x08])
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 3 {
            received.extend(next_packets(&mut events).await);
        }
        assert_eq!(received, vec![vec![1, 2, 3], vec![7], vec![8]]);

        drop(server);
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(LinkEvent::Closed(_))) => {}
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(TcpLink::connect(addr, LinkOptions::default()).await.is_err());
    }
}
