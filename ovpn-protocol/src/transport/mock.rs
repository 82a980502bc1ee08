//! In-memory links, tunnels and TLS for testing
//!
//! These mocks let a [`crate::SessionProxy`] run a full negotiation against a
//! scripted server without sockets or certificates:
//!
//! - [`MockLink`] records every packet the session writes and can be told to
//!   fail writes
//! - [`MockTunnel`] records decrypted packets delivered to the tunnel
//! - [`MockTlsFactory`] hands out [`MockTlsSession`]s, a passthrough "TLS"
//!   that completes once the server hello marker is received
//! - [`RecordingEventHandler`] keeps every emitted [`SessionEvent`]
//! - [`IpPacketBuilder`] and [`IpPacketInfo`] build and inspect IP packets
//!
//! # Example
//!
//! ```ignore
//! use ovpn_protocol::transport::mock::{MockLink, MockTlsFactory, RecordingEventHandler};
//!
//! let link = MockLink::udp();
//! session.set_link(Box::new(link.clone()), Instant::now())?;
//! // the client hard reset is now recorded
//! assert_eq!(link.written().len(), 1);
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Link, Tunnel, DEFAULT_LINK_MTU};
use crate::error::Result;
use crate::event::{EventHandler, SessionEvent};
use crate::settings::CommunicationType;
use crate::tls::{TlsFactory, TlsSession};
use crate::zeroing::SecretBuffer;
use crate::Error;

/// First ciphertext produced by a [`MockTlsSession`]
pub const CLIENT_HELLO: &[u8] = b"MOCK_CLIENT_HELLO";

/// Ciphertext that completes a [`MockTlsSession`] handshake
pub const SERVER_HELLO: &[u8] = b"MOCK_SERVER_HELLO";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Link
// ============================================================================

/// Link that records written packets; clones share the same record
#[derive(Clone)]
pub struct MockLink {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    reliable: bool,
    mtu: usize,
    remote_address: Option<String>,
    communication_type: CommunicationType,
    negotiation_timeout: Duration,
    hard_reset_timeout: Duration,
}

impl MockLink {
    /// Datagram link with UDP-like timeouts
    pub fn udp() -> Self {
        Self {
            written: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            reliable: false,
            mtu: DEFAULT_LINK_MTU,
            remote_address: Some("192.0.2.1".to_string()),
            communication_type: CommunicationType::Vanilla,
            negotiation_timeout: Duration::from_secs(10),
            hard_reset_timeout: Duration::from_secs(2),
        }
    }

    /// Stream link with TCP-like timeouts
    pub fn tcp() -> Self {
        Self {
            reliable: true,
            mtu: usize::MAX,
            hard_reset_timeout: Duration::from_secs(5),
            ..Self::udp()
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_remote_address(mut self, address: Option<&str>) -> Self {
        self.remote_address = address.map(str::to_string);
        self
    }

    pub fn with_communication_type(mut self, communication_type: CommunicationType) -> Self {
        self.communication_type = communication_type;
        self
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every packet written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.written).clone()
    }

    /// Take and clear the written packets
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *lock(&self.written))
    }
}

impl Link for MockLink {
    fn is_reliable(&self) -> bool {
        self.reliable
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn remote_address(&self) -> Option<String> {
        self.remote_address.clone()
    }

    fn packet_buffer_size(&self) -> usize {
        200
    }

    fn negotiation_timeout(&self) -> Duration {
        self.negotiation_timeout
    }

    fn hard_reset_timeout(&self) -> Duration {
        self.hard_reset_timeout
    }

    fn communication_type(&self) -> CommunicationType {
        self.communication_type
    }

    fn write_packets(&self, packets: &[Vec<u8>]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::FailedLinkWrite);
        }
        lock(&self.written).extend(packets.iter().cloned());
        Ok(())
    }
}

// ============================================================================
// Tunnel
// ============================================================================

/// Tunnel that records delivered packets
#[derive(Default)]
pub struct MockTunnel {
    packets: Mutex<Vec<Vec<u8>>>,
    persistent: bool,
}

impl MockTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Self::default()
        }
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        lock(&self.packets).clone()
    }
}

impl Tunnel for MockTunnel {
    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn write_packets(&self, packets: &[Vec<u8>]) -> Result<()> {
        lock(&self.packets).extend(packets.iter().cloned());
        Ok(())
    }
}

// ============================================================================
// TLS
// ============================================================================

/// Passthrough TLS: after the hello exchange, ciphertext equals plaintext
#[derive(Default)]
pub struct MockTlsSession {
    outgoing: Vec<u8>,
    incoming: Vec<u8>,
    plain_in: Vec<u8>,
    started: bool,
    connected: bool,
}

impl MockTlsSession {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TlsSession for MockTlsSession {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        self.outgoing.extend_from_slice(CLIENT_HELLO);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn put_cipher_text(&mut self, data: &[u8]) -> Result<()> {
        if !self.started {
            return Err(Error::Tls("handshake not started".into()));
        }
        if self.connected {
            self.plain_in.extend_from_slice(data);
            return Ok(());
        }
        self.incoming.extend_from_slice(data);
        if self.incoming.len() >= SERVER_HELLO.len() {
            if !self.incoming.starts_with(SERVER_HELLO) {
                return Err(Error::Tls("unexpected handshake data".into()));
            }
            self.connected = true;
            self.plain_in.extend_from_slice(&self.incoming[SERVER_HELLO.len()..]);
            self.incoming.clear();
        }
        Ok(())
    }

    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>> {
        if self.outgoing.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.outgoing)))
    }

    fn put_plain_text(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::Tls("handshake not complete".into()));
        }
        self.outgoing.extend_from_slice(data);
        Ok(())
    }

    fn pull_plain_text(&mut self) -> Result<Option<SecretBuffer>> {
        if self.plain_in.is_empty() {
            return Ok(None);
        }
        let plain = SecretBuffer::from_slice(&self.plain_in);
        self.plain_in.clear();
        Ok(Some(plain))
    }
}

/// Factory for [`MockTlsSession`]s
#[derive(Default)]
pub struct MockTlsFactory;

impl TlsFactory for MockTlsFactory {
    fn create(&self) -> Result<Box<dyn TlsSession>> {
        Ok(Box::new(MockTlsSession::new()))
    }
}

// ============================================================================
// Events
// ============================================================================

/// Keeps every event for later inspection
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        lock(&self.events).clone()
    }

    pub fn last(&self) -> Option<SessionEvent> {
        lock(&self.events).last().cloned()
    }

    pub fn started(&self) -> bool {
        lock(&self.events)
            .iter()
            .any(|e| matches!(e, SessionEvent::Started { .. }))
    }

    /// `should_reconnect` of the first stop, if any
    pub fn stopped(&self) -> Option<bool> {
        lock(&self.events).iter().find_map(|e| match e {
            SessionEvent::Stopped { should_reconnect, .. } => Some(*should_reconnect),
            _ => None,
        })
    }
}

impl EventHandler for RecordingEventHandler {
    fn on_event(&self, event: SessionEvent) {
        lock(&self.events).push(event);
    }
}

// ============================================================================
// IP packets
// ============================================================================

/// IP address of either family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl std::fmt::Display for IpAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpAddr::V4(addr) => write!(f, "{}", addr),
            IpAddr::V6(addr) => write!(f, "{}", addr),
        }
    }
}

/// Header fields of a parsed IP packet
#[derive(Debug, Clone)]
pub struct IpPacketInfo {
    pub version: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    /// IP protocol number (6=TCP, 17=UDP, 1=ICMP)
    pub protocol: u8,
    pub ttl: u8,
    pub header_length: usize,
    /// Bytes after the IP header
    pub payload: Vec<u8>,
}

impl IpPacketInfo {
    pub fn parse(data: &[u8]) -> Option<Self> {
        match data.first()? >> 4 {
            4 => Self::parse_ipv4(data),
            6 => Self::parse_ipv6(data),
            _ => None,
        }
    }

    fn parse_ipv4(data: &[u8]) -> Option<Self> {
        let header_length = usize::from(data[0] & 0x0F) * 4;
        if data.len() < 20 || data.len() < header_length {
            return None;
        }
        Some(Self {
            version: 4,
            src_addr: IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15])),
            dst_addr: IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19])),
            protocol: data[9],
            ttl: data[8],
            header_length,
            payload: data[header_length..].to_vec(),
        })
    }

    fn parse_ipv6(data: &[u8]) -> Option<Self> {
        if data.len() < 40 {
            return None;
        }
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        dst.copy_from_slice(&data[24..40]);
        Some(Self {
            version: 6,
            src_addr: IpAddr::V6(Ipv6Addr::from(src)),
            dst_addr: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol: data[6],
            ttl: data[7],
            header_length: 40,
            payload: data[40..].to_vec(),
        })
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == 6
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == 17
    }

    pub fn parse_tcp(&self) -> Option<TcpInfo> {
        if !self.is_tcp() || self.payload.len() < 20 {
            return None;
        }
        let p = &self.payload;
        let data_offset = usize::from(p[12] >> 4) * 4;
        if data_offset < 20 || p.len() < data_offset {
            return None;
        }
        Some(TcpInfo {
            src_port: u16::from_be_bytes([p[0], p[1]]),
            dst_port: u16::from_be_bytes([p[2], p[3]]),
            flags: p[13],
            checksum: u16::from_be_bytes([p[16], p[17]]),
            options: p[20..data_offset].to_vec(),
            data: p[data_offset..].to_vec(),
        })
    }
}

/// TCP header fields
#[derive(Debug, Clone)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub checksum: u16,
    pub options: Vec<u8>,
    pub data: Vec<u8>,
}

impl TcpInfo {
    pub fn is_syn(&self) -> bool {
        self.flags & 0x02 != 0
    }

    /// Value of the MSS option, if present
    pub fn mss(&self) -> Option<u16> {
        let mut i = 0;
        while i < self.options.len() {
            match self.options[i] {
                0 => return None,
                1 => i += 1,
                kind => {
                    let len = usize::from(*self.options.get(i + 1)?);
                    if len < 2 {
                        return None;
                    }
                    if kind == 2 && len == 4 {
                        let value = self.options.get(i + 2..i + 4)?;
                        return Some(u16::from_be_bytes([value[0], value[1]]));
                    }
                    i += len;
                }
            }
        }
        None
    }
}

/// Builder for test IPv4 packets
pub struct IpPacketBuilder {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    payload: Vec<u8>,
}

impl IpPacketBuilder {
    pub fn ipv4() -> Self {
        Self {
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(10, 0, 0, 1),
            protocol: 1,
            ttl: 64,
            payload: Vec::new(),
        }
    }

    pub fn src_v4(mut self, a: u8, b: u8, c: u8, d: u8) -> Self {
        self.src = Ipv4Addr::new(a, b, c, d);
        self
    }

    pub fn dst_v4(mut self, a: u8, b: u8, c: u8, d: u8) -> Self {
        self.dst = Ipv4Addr::new(a, b, c, d);
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// ICMP echo request carrying `data`
    pub fn with_icmp_echo(mut self, data: &[u8]) -> Self {
        let mut payload = vec![8, 0, 0, 0, 0, 1, 0, 1];
        payload.extend_from_slice(data);
        self.protocol = 1;
        self.payload = payload;
        self
    }

    /// UDP datagram with a zero checksum
    pub fn with_udp(mut self, src_port: u16, dst_port: u16, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&src_port.to_be_bytes());
        payload.extend_from_slice(&dst_port.to_be_bytes());
        payload.extend_from_slice(&((8 + data.len()) as u16).to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(data);
        self.protocol = 17;
        self.payload = payload;
        self
    }

    /// TCP SYN carrying an MSS option, with a valid checksum
    pub fn with_tcp_syn(mut self, src_port: u16, dst_port: u16, mss: u16) -> Self {
        let mut tcp = Vec::with_capacity(28);
        tcp.extend_from_slice(&src_port.to_be_bytes());
        tcp.extend_from_slice(&dst_port.to_be_bytes());
        tcp.extend_from_slice(&0x1000_0000u32.to_be_bytes()); // seq
        tcp.extend_from_slice(&0u32.to_be_bytes()); // ack
        tcp.push(0x70); // 28-byte header
        tcp.push(0x02); // SYN
        tcp.extend_from_slice(&[0xFF, 0xFF]); // window
        tcp.extend_from_slice(&[0, 0]); // checksum
        tcp.extend_from_slice(&[0, 0]); // urgent
        tcp.extend_from_slice(&[1, 1]); // NOP NOP
        tcp.extend_from_slice(&[2, 4]);
        tcp.extend_from_slice(&mss.to_be_bytes());
        tcp.extend_from_slice(&[1, 1]);

        let checksum = self.transport_checksum(6, &tcp);
        tcp[16..18].copy_from_slice(&checksum.to_be_bytes());
        self.protocol = 6;
        self.payload = tcp;
        self
    }

    fn transport_checksum(&self, protocol: u8, segment: &[u8]) -> u16 {
        let mut pseudo = Vec::with_capacity(12 + segment.len() + 1);
        pseudo.extend_from_slice(&self.src.octets());
        pseudo.extend_from_slice(&self.dst.octets());
        pseudo.push(0);
        pseudo.push(protocol);
        pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
        pseudo.extend_from_slice(segment);
        ones_complement(&pseudo)
    }

    pub fn build(self) -> Vec<u8> {
        let total_length = 20 + self.payload.len();
        let mut packet = Vec::with_capacity(total_length);
        packet.push(0x45);
        packet.push(0x00);
        packet.extend_from_slice(&(total_length as u16).to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x00]); // identification
        packet.extend_from_slice(&[0x40, 0x00]); // don't fragment
        packet.push(self.ttl);
        packet.push(self.protocol);
        packet.extend_from_slice(&[0x00, 0x00]);
        packet.extend_from_slice(&self.src.octets());
        packet.extend_from_slice(&self.dst.octets());
        let checksum = ones_complement(&packet);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());
        packet.extend_from_slice(&self.payload);
        packet
    }
}

fn ones_complement(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)])))
        .sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_packet_builder_icmp() {
        let packet = IpPacketBuilder::ipv4()
            .src_v4(192, 168, 1, 1)
            .dst_v4(192, 168, 1, 2)
            .ttl(128)
            .with_icmp_echo(&[1, 2, 3, 4])
            .build();

        let info = IpPacketInfo::parse(&packet).unwrap();
        assert_eq!(info.version, 4);
        assert_eq!(info.src_addr, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(info.dst_addr, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)));
        assert_eq!(info.protocol, 1);
        assert_eq!(info.ttl, 128);
        assert_eq!(&info.payload[8..], &[1, 2, 3, 4]);
        // header checksum verifies to zero
        assert_eq!(ones_complement(&packet[..20]), 0);
    }

    #[test]
    fn test_tcp_syn_mss() {
        let packet = IpPacketBuilder::ipv4().with_tcp_syn(1234, 80, 1460).build();
        let tcp = IpPacketInfo::parse(&packet).unwrap().parse_tcp().unwrap();
        assert!(tcp.is_syn());
        assert_eq!(tcp.src_port, 1234);
        assert_eq!(tcp.mss(), Some(1460));
        assert!(tcp.data.is_empty());
    }

    #[test]
    fn test_mock_link_records_and_fails() {
        let link = MockLink::udp();
        let handle = link.clone();
        link.write_packet(&[1, 2]).unwrap();
        assert_eq!(handle.written(), vec![vec![1, 2]]);

        handle.set_fail_writes(true);
        assert!(matches!(link.write_packet(&[3]), Err(Error::FailedLinkWrite)));
        assert_eq!(handle.take_written().len(), 1);
        assert!(handle.written().is_empty());
    }

    #[test]
    fn test_mock_tls_handshake() {
        let mut tls = MockTlsFactory.create().unwrap();
        assert!(tls.put_plain_text(b"early").is_err());
        tls.start().unwrap();
        assert_eq!(tls.pull_cipher_text().unwrap().unwrap(), CLIENT_HELLO);

        // hello split across two packets, with data following
        tls.put_cipher_text(&SERVER_HELLO[..5]).unwrap();
        assert!(!tls.is_connected());
        let mut rest = SERVER_HELLO[5..].to_vec();
        rest.extend_from_slice(b"data");
        tls.put_cipher_text(&rest).unwrap();
        assert!(tls.is_connected());
        assert_eq!(tls.pull_plain_text().unwrap().unwrap().as_bytes(), b"data");

        tls.put_plain_text(b"reply").unwrap();
        assert_eq!(tls.pull_cipher_text().unwrap().unwrap(), b"reply");
    }

    #[test]
    fn test_recording_event_handler() {
        let handler = RecordingEventHandler::new();
        assert!(handler.stopped().is_none());
        handler.on_event(SessionEvent::Stopped {
            should_reconnect: true,
            reason: None,
        });
        assert_eq!(handler.stopped(), Some(true));
        assert!(!handler.started());
    }
}
