//! End-to-end negotiation tests
//!
//! A scripted server answers the client over in-memory links: reset
//! exchange, TLS (mock or rustls), key method 2 authentication, the push
//! exchange and the encrypted data channel.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ovpn_protocol::transport::mock::{
    IpPacketBuilder, MockLink, MockTlsFactory, MockTunnel, RecordingEventHandler, CLIENT_HELLO,
    SERVER_HELLO,
};
use ovpn_protocol::{
    split_header, CipherAlgorithm, ControlPacket, Credentials, CryptoBox, DataPath,
    DigestAlgorithm, EncryptionParameters, Error, Handshake, InboundQueue, KeyMaterial,
    PacketCode, RustlsFactory, SessionEvent, SessionId, SessionOptions, SessionProxy, TlsFactory,
    PEER_INFO, TLS_PREFIX,
};

const CA: &str = include_str!("fixtures/ca.pem");
const SERVER_CERT: &str = include_str!("fixtures/server.pem");
const SERVER_KEY: &str = include_str!("fixtures/server.key");

const SERVER_RANDOM1: [u8; 32] = [0x5a; 32];
const SERVER_RANDOM2: [u8; 32] = [0xa5; 32];
const AUTH_HEADER_LENGTH: usize = 5 + 48 + 32 + 32;

const SIMPLE_REPLY: &str = "PUSH_REPLY ifconfig 10.0.0.2 10.0.0.1 dhcp-option DNS 8.8.8.8";
const PEER_ID_REPLY: &str = "PUSH_REPLY,ifconfig 10.0.0.2 10.0.0.1,peer-id 5,auth-token SESS123";

// ============================================================================
// Simulated server
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Accept,
    FailEarly,
    FailOnPush,
}

enum ServerTls {
    Mock { connected: bool, incoming: Vec<u8> },
    Rustls(Box<rustls::ServerConnection>),
}

impl ServerTls {
    /// Feed ciphertext; returns (ciphertext to send, plaintext received)
    fn receive(&mut self, data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        match self {
            Self::Mock { connected: true, .. } => (Vec::new(), data.to_vec()),
            Self::Mock { connected, incoming } => {
                incoming.extend_from_slice(data);
                if incoming.len() < CLIENT_HELLO.len() {
                    return (Vec::new(), Vec::new());
                }
                assert!(incoming.starts_with(CLIENT_HELLO));
                *connected = true;
                let plain = incoming[CLIENT_HELLO.len()..].to_vec();
                incoming.clear();
                (SERVER_HELLO.to_vec(), plain)
            }
            Self::Rustls(conn) => {
                let mut rd = data;
                while !rd.is_empty() {
                    conn.read_tls(&mut rd).unwrap();
                    conn.process_new_packets().unwrap();
                }
                let mut plain = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match conn.reader().read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => plain.extend_from_slice(&chunk[..n]),
                    }
                }
                (Self::drain(conn), plain)
            }
        }
    }

    fn send(&mut self, plain: &[u8]) -> Vec<u8> {
        match self {
            Self::Mock { .. } => plain.to_vec(),
            Self::Rustls(conn) => {
                conn.writer().write_all(plain).unwrap();
                Self::drain(conn)
            }
        }
    }

    fn drain(conn: &mut rustls::ServerConnection) -> Vec<u8> {
        let mut out = Vec::new();
        while conn.wants_write() {
            conn.write_tls(&mut out).unwrap();
        }
        out
    }
}

fn rustls_server_config() -> Arc<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certs = rustls_pemfile::certs(&mut SERVER_CERT.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut SERVER_KEY.as_bytes())
        .unwrap()
        .unwrap();
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    Arc::new(config)
}

struct AuthRequest {
    pre_master: Vec<u8>,
    random1: Vec<u8>,
    random2: Vec<u8>,
    username: String,
    password: String,
    peer_info: String,
}

fn parse_auth_request(buf: &[u8]) -> Option<(AuthRequest, usize)> {
    if buf.len() < AUTH_HEADER_LENGTH {
        return None;
    }
    assert_eq!(buf[..5], TLS_PREFIX);

    let mut offset = AUTH_HEADER_LENGTH;
    let mut fields = Vec::new();
    for _ in 0..4 {
        let len = u16::from_be_bytes([*buf.get(offset)?, *buf.get(offset + 1)?]) as usize;
        offset += 2;
        let raw = buf.get(offset..offset + len)?;
        fields.push(String::from_utf8_lossy(raw).trim_end_matches('\0').to_string());
        offset += len;
    }
    let request = AuthRequest {
        pre_master: buf[5..53].to_vec(),
        random1: buf[53..85].to_vec(),
        random2: buf[85..117].to_vec(),
        username: fields[1].clone(),
        password: fields[2].clone(),
        peer_info: fields[3].clone(),
    };
    Some((request, offset))
}

struct Server {
    session_id: SessionId,
    client_session_id: Option<SessionId>,
    key: u8,
    next_packet_id: u32,
    inbound: InboundQueue,
    rustls: Option<Arc<rustls::ServerConfig>>,
    tls: ServerTls,
    plain: Vec<u8>,
    authenticated: bool,
    auth_mode: AuthMode,
    push_reply: String,
    /// Largest control payload per packet
    mtu: usize,
    /// Reverse and duplicate every batch of replies
    scramble: bool,
    cipher: CipherAlgorithm,
    data: BTreeMap<u8, DataPath>,
    data_packets: Vec<Vec<u8>>,
    received: Vec<Vec<u8>>,
    pings: usize,
    push_requests: usize,
    credentials: Vec<(String, String)>,
}

impl Server {
    fn new(cipher: CipherAlgorithm, push_reply: &str) -> Self {
        Self {
            session_id: SessionId::new([0x53; 8]),
            client_session_id: None,
            key: 0,
            next_packet_id: 0,
            inbound: InboundQueue::new(),
            rustls: None,
            tls: Self::mock_tls(),
            plain: Vec::new(),
            authenticated: false,
            auth_mode: AuthMode::Accept,
            push_reply: push_reply.to_string(),
            mtu: 1000,
            scramble: false,
            cipher,
            data: BTreeMap::new(),
            data_packets: Vec::new(),
            received: Vec::new(),
            pings: 0,
            push_requests: 0,
            credentials: Vec::new(),
        }
    }

    fn with_rustls(mut self) -> Self {
        self.rustls = Some(rustls_server_config());
        self.tls = self.new_tls();
        self
    }

    fn mock_tls() -> ServerTls {
        ServerTls::Mock {
            connected: false,
            incoming: Vec::new(),
        }
    }

    fn new_tls(&self) -> ServerTls {
        match &self.rustls {
            Some(config) => ServerTls::Rustls(Box::new(
                rustls::ServerConnection::new(config.clone()).unwrap(),
            )),
            None => Self::mock_tls(),
        }
    }

    /// Handle packets written by the client and return the replies
    fn receive(&mut self, packets: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for raw in packets {
            let (code, key) = split_header(raw[0]);
            if PacketCode::try_from(code).unwrap().is_data() {
                self.receive_data(key, raw);
                continue;
            }

            let packet = ControlPacket::decode(raw).unwrap().unwrap();
            let Some(packet_id) = packet.packet_id else {
                continue;
            };
            if packet.code == PacketCode::SoftResetV1 && packet.key != self.key {
                self.renegotiate(packet.key);
            }
            self.client_session_id = Some(packet.session_id);
            out.push(
                ControlPacket::ack(packet.key, self.session_id, vec![packet_id], packet.session_id)
                    .encode(),
            );
            for ready in self.inbound.enqueue(packet) {
                self.handle_control(ready, &mut out);
            }
        }

        if self.scramble {
            out.reverse();
            let copy = out.clone();
            out.extend(copy);
        }
        out
    }

    fn renegotiate(&mut self, key: u8) {
        self.key = key;
        self.next_packet_id = 0;
        self.inbound.reset();
        self.tls = self.new_tls();
        self.plain.clear();
        self.authenticated = false;
    }

    fn control(&mut self, code: PacketCode, payload: Vec<u8>) -> Vec<u8> {
        let id = self.next_packet_id;
        self.next_packet_id += 1;
        ControlPacket::new(code, self.key, self.session_id, id, payload).encode()
    }

    fn handle_control(&mut self, packet: ControlPacket, out: &mut Vec<Vec<u8>>) {
        match packet.code {
            PacketCode::HardResetClientV2 => {
                out.push(self.control(PacketCode::HardResetServerV2, Vec::new()))
            }
            PacketCode::SoftResetV1 => out.push(self.control(PacketCode::SoftResetV1, Vec::new())),
            PacketCode::ControlV1 => {
                let (cipher, plain) = self.tls.receive(&packet.payload);
                self.send_cipher(&cipher, out);
                self.plain.extend_from_slice(&plain);
                self.handle_plain(out);
            }
            _ => {}
        }
    }

    fn send_cipher(&mut self, cipher: &[u8], out: &mut Vec<Vec<u8>>) {
        for chunk in cipher.chunks(self.mtu) {
            out.push(self.control(PacketCode::ControlV1, chunk.to_vec()));
        }
    }

    fn send_plain(&mut self, plain: &[u8], out: &mut Vec<Vec<u8>>) {
        let cipher = self.tls.send(plain);
        self.send_cipher(&cipher, out);
    }

    fn handle_plain(&mut self, out: &mut Vec<Vec<u8>>) {
        if !self.authenticated {
            let Some((request, consumed)) = parse_auth_request(&self.plain) else {
                return;
            };
            self.plain.drain(..consumed);
            assert_eq!(request.peer_info, PEER_INFO);
            self.credentials
                .push((request.username.clone(), request.password.clone()));
            if self.auth_mode == AuthMode::FailEarly {
                self.send_plain(b"AUTH_FAILED\0", out);
                return;
            }

            let client_session_id = self.client_session_id.unwrap();
            let keys = KeyMaterial::derive(
                &request.pre_master,
                &request.random1,
                &request.random2,
                &SERVER_RANDOM1,
                &SERVER_RANDOM2,
                &client_session_id,
                &self.session_id,
            )
            .unwrap()
            .reversed();
            let crypto = CryptoBox::new(self.cipher, DigestAlgorithm::Sha1, &keys).unwrap();
            self.data.insert(self.key, DataPath::new(crypto, true));

            let opts = b"V4,dev-type tun\0";
            let mut reply = TLS_PREFIX.to_vec();
            reply.extend_from_slice(&SERVER_RANDOM1);
            reply.extend_from_slice(&SERVER_RANDOM2);
            reply.extend_from_slice(&(opts.len() as u16).to_be_bytes());
            reply.extend_from_slice(opts);
            self.send_plain(&reply, out);
            self.authenticated = true;
        }

        while let Some(end) = self.plain.iter().position(|&b| b == 0) {
            let message: Vec<u8> = self.plain.drain(..=end).collect();
            if message != b"PUSH_REQUEST\0" {
                continue;
            }
            self.push_requests += 1;
            let answer = match self.auth_mode {
                AuthMode::FailOnPush => "AUTH_FAILED,bad password".to_string(),
                _ => self.push_reply.clone(),
            };
            self.send_plain(format!("{}\0", answer).as_bytes(), out);
        }
    }

    fn receive_data(&mut self, key: u8, raw: &[u8]) {
        let data_path = self
            .data
            .get_mut(&key)
            .unwrap_or_else(|| panic!("no server data key {}", key));
        let mut keep_alive = false;
        let plain = data_path
            .decrypt_packets(&[raw.to_vec()], &mut keep_alive)
            .unwrap();
        if keep_alive {
            self.pings += 1;
        }
        self.data_packets.push(raw.to_vec());
        self.received.extend(plain);
    }

    /// Encrypt tunnel packets for the client with key `key`
    fn encrypt(&mut self, key: u8, packets: &[Vec<u8>]) -> Vec<Vec<u8>> {
        self.data
            .get_mut(&key)
            .unwrap()
            .encrypt_packets(packets, key)
            .unwrap()
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    session: SessionProxy,
    server: Server,
    link: MockLink,
    tunnel: Arc<MockTunnel>,
    events: Arc<RecordingEventHandler>,
    start: Instant,
}

impl Harness {
    fn new(link: MockLink, options: SessionOptions, server: Server) -> Self {
        Self::with_tls(link, options, server, Arc::new(MockTlsFactory))
    }

    fn with_tls(
        link: MockLink,
        options: SessionOptions,
        server: Server,
        tls: Arc<dyn TlsFactory>,
    ) -> Self {
        let encryption = EncryptionParameters::new(
            server.cipher,
            DigestAlgorithm::Sha1,
            Handshake::CaOnly {
                ca_pem: CA.to_string(),
            },
        )
        .unwrap();
        let events = Arc::new(RecordingEventHandler::new());
        let tunnel = Arc::new(MockTunnel::new());
        let mut session = SessionProxy::new(
            encryption,
            Credentials::new("user", "pass"),
            options,
            tls,
            events.clone(),
        );
        session.set_tunnel(tunnel.clone());
        Self {
            session,
            server,
            link,
            tunnel,
            events,
            start: Instant::now(),
        }
    }

    fn at(&self, millis: u64) -> Instant {
        self.start + Duration::from_millis(millis)
    }

    /// Exchange packets until the client stops writing
    fn pump(&mut self, now: Instant) {
        for _ in 0..64 {
            let written = self.link.take_written();
            if written.is_empty() {
                return;
            }
            let replies = self.server.receive(&written);
            if !replies.is_empty() {
                self.session.receive_link(&replies, now);
            }
        }
        panic!("link never settled");
    }

    fn set_link(&mut self) {
        self.session
            .set_link(Box::new(self.link.clone()), self.start);
        self.pump(self.start);
    }

    /// Full negotiation; the PUSH_REQUEST goes out on the first tick
    fn connect(&mut self) {
        self.set_link();
        let now = self.at(200);
        self.session.tick(now);
        self.pump(now);
    }
}

fn icmp_packet(payload: &[u8]) -> Vec<u8> {
    IpPacketBuilder::ipv4()
        .src_v4(10, 0, 0, 2)
        .dst_v4(10, 0, 0, 1)
        .with_icmp_echo(payload)
        .build()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_udp_handshake_reports_pushed_settings() {
    let server = Server::new(CipherAlgorithm::Aes128Cbc, SIMPLE_REPLY);
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);

    h.set_link();
    // keys are set up, PUSH_REQUEST waits for the retransmission interval
    assert!(!h.events.started());
    assert!(!h.session.is_connected());
    assert_eq!(h.server.push_requests, 0);

    let now = h.at(200);
    h.session.tick(now);
    h.pump(now);

    assert_eq!(
        h.events.events(),
        vec![SessionEvent::Started {
            remote_address: Some("192.0.2.1".to_string()),
            address: Ipv4Addr::new(10, 0, 0, 2),
            gateway_address: Ipv4Addr::new(10, 0, 0, 1),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
        }]
    );
    assert!(h.session.is_connected());
    assert_eq!(h.session.current_key_id(), Some(0));
    assert_eq!(h.session.connected_at(), Some(now));
    assert_eq!(h.session.peer_id(), None);
    assert!(!h.session.has_auth_token());
    assert_eq!(
        h.server.credentials,
        vec![("user".to_string(), "pass".to_string())]
    );
}

#[test]
fn test_tcp_handshake_pushes_immediately() {
    let server = Server::new(CipherAlgorithm::Aes256Gcm, SIMPLE_REPLY);
    let mut h = Harness::new(MockLink::tcp(), SessionOptions::default(), server);

    h.set_link();
    assert!(h.events.started());
    assert!(h.session.is_connected());
    assert!(h.server.push_requests >= 1);
}

#[test]
fn test_reordered_and_duplicated_control_packets() {
    let mut server = Server::new(CipherAlgorithm::Aes128Gcm, PEER_ID_REPLY);
    server.mtu = 5;
    server.scramble = true;
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);

    h.connect();
    assert_eq!(h.events.events().len(), 1);
    assert!(h.events.started());
    assert_eq!(h.session.peer_id(), Some(5));
    assert!(h.session.has_auth_token());
}

#[test]
fn test_auth_failed_before_key_exchange() {
    let mut server = Server::new(CipherAlgorithm::Aes128Cbc, SIMPLE_REPLY);
    server.auth_mode = AuthMode::FailEarly;
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);

    h.set_link();
    assert_eq!(h.events.events().len(), 1);
    assert_eq!(h.events.stopped(), Some(false));
    assert!(matches!(h.session.stop_error(), Some(Error::BadCredentials)));
}

#[test]
fn test_auth_failed_instead_of_push_reply() {
    let mut server = Server::new(CipherAlgorithm::Aes128Cbc, SIMPLE_REPLY);
    server.auth_mode = AuthMode::FailOnPush;
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);

    h.connect();
    assert!(!h.events.started());
    assert_eq!(h.events.stopped(), Some(false));
    assert!(matches!(h.session.stop_error(), Some(Error::BadCredentials)));
}

#[test]
fn test_session_mismatch_is_fatal() {
    let server = Server::new(CipherAlgorithm::Aes128Cbc, SIMPLE_REPLY);
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);
    h.session.set_link(Box::new(h.link.clone()), h.start);

    let hard_reset = ControlPacket::decode(&h.link.take_written()[0])
        .unwrap()
        .unwrap();
    let reply = ControlPacket::new(
        PacketCode::HardResetServerV2,
        0,
        SessionId::new([7; 8]),
        0,
        Vec::new(),
    )
    .with_acks(vec![0], hard_reset.session_id);
    h.session.receive_link(&[reply.encode()], h.start);

    let written = h.link.take_written();
    assert!(written
        .iter()
        .any(|raw| ControlPacket::decode(raw).unwrap().unwrap().payload == CLIENT_HELLO));

    let rogue = ControlPacket::new(
        PacketCode::ControlV1,
        0,
        SessionId::new([8; 8]),
        1,
        SERVER_HELLO.to_vec(),
    );
    h.session.receive_link(&[rogue.encode()], h.start);
    assert_eq!(h.events.stopped(), Some(false));
    assert!(matches!(h.session.stop_error(), Some(Error::SessionMismatch)));
}

#[test]
fn test_data_round_trip_with_peer_id() {
    let server = Server::new(CipherAlgorithm::Aes128Gcm, PEER_ID_REPLY);
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);
    h.connect();
    assert_eq!(h.session.peer_id(), Some(5));

    let now = h.at(300);
    let request = icmp_packet(b"ping");
    h.session.receive_tunnel(&[request.clone()], now);
    let written = h.link.take_written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0][..4], [0x48, 0, 0, 5]);
    assert_eq!(h.session.data_count(), (0, written[0].len() as u64));

    h.server.receive(&written);
    assert_eq!(h.server.received, vec![request]);

    let response = icmp_packet(b"pong");
    let encrypted = h.server.encrypt(0, &[response.clone()]);
    h.session.receive_link(&encrypted, now);
    assert_eq!(h.tunnel.received(), vec![response]);
    assert_eq!(
        h.session.data_count(),
        (encrypted[0].len() as u64, written[0].len() as u64)
    );
}

#[test]
fn test_rebind_moves_traffic_to_new_link() {
    let server = Server::new(CipherAlgorithm::Aes128Gcm, PEER_ID_REPLY);
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);
    h.connect();
    assert!(h.session.can_rebind_link());

    let now = h.at(400);
    let other = MockLink::udp().with_remote_address(Some("198.51.100.7"));
    assert!(h.session.rebind_link(Box::new(other.clone()), now));

    let packet = icmp_packet(b"moved");
    h.session.receive_tunnel(&[packet.clone()], now);
    assert!(h.link.written().is_empty());
    let written = other.take_written();
    assert_eq!(written.len(), 1);

    h.server.receive(&written);
    assert_eq!(h.server.received, vec![packet]);
    assert!(h.session.is_connected());
}

#[test]
fn test_rebind_refused_without_peer_id() {
    let server = Server::new(CipherAlgorithm::Aes128Cbc, SIMPLE_REPLY);
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);
    h.connect();

    assert!(!h.session.rebind_link(Box::new(MockLink::udp()), h.at(400)));
    h.session.receive_tunnel(&[icmp_packet(b"stay")], h.at(400));
    let written = h.link.take_written();
    assert_eq!(written.len(), 1);
    // P_DATA_V1, key 0
    assert_eq!(written[0][0], 0x30);
}

#[test]
fn test_keep_alive_ping() {
    let server = Server::new(CipherAlgorithm::Aes128Cbc, SIMPLE_REPLY);
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);
    h.connect();

    h.session.tick(h.at(5_200));
    assert!(h.link.written().is_empty());

    h.session.tick(h.at(10_200));
    let written = h.link.take_written();
    assert_eq!(written.len(), 1);
    h.server.receive(&written);
    assert_eq!(h.server.pings, 1);
    assert!(h.server.received.is_empty());
}

#[test]
fn test_no_keep_alive_when_disabled() {
    let server = Server::new(CipherAlgorithm::Aes128Cbc, SIMPLE_REPLY);
    let options = SessionOptions {
        sends_keep_alive: false,
        ..SessionOptions::default()
    };
    let mut h = Harness::new(MockLink::udp(), options, server);
    h.connect();

    h.session.tick(h.at(10_200));
    h.session.tick(h.at(60_000));
    assert!(h.link.written().is_empty());
    assert!(!h.session.is_stopping());
}

#[test]
fn test_ping_timeout() {
    let server = Server::new(CipherAlgorithm::Aes128Cbc, SIMPLE_REPLY);
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);
    h.connect();

    h.session.tick(h.at(100_000));
    assert!(!h.session.is_stopping());

    h.session.tick(h.at(121_500));
    assert_eq!(h.events.stopped(), Some(false));
    assert!(matches!(h.session.stop_error(), Some(Error::PingTimeout)));
}

#[test]
fn test_negotiation_timeout_shuts_down() {
    let mut server = Server::new(CipherAlgorithm::Aes128Cbc, SIMPLE_REPLY);
    // never answers PUSH_REQUEST with anything usable
    server.push_reply = "PUSH_IGNORED".to_string();
    let mut h = Harness::new(MockLink::udp(), SessionOptions::default(), server);
    h.connect();
    assert!(!h.events.started());

    h.session.tick(h.at(10_500));
    assert_eq!(h.events.stopped(), Some(false));
    assert!(matches!(
        h.session.stop_error(),
        Some(Error::ConnectionTimeout)
    ));
}

#[test]
fn test_soft_reset_renegotiates_key() {
    let server = Server::new(CipherAlgorithm::Aes128Gcm, PEER_ID_REPLY);
    let options = SessionOptions {
        renegotiates_after: Some(Duration::from_secs(30)),
        ..SessionOptions::default()
    };
    let mut h = Harness::new(MockLink::udp(), options, server);
    h.connect();
    assert_eq!(h.session.current_key_id(), Some(0));

    let now = h.at(31_000);
    h.session.tick(now);
    h.pump(now);
    assert_eq!(h.session.negotiation_key_id(), 1);
    assert_eq!(h.session.current_key_id(), Some(0));
    // the pushed auth token replaces the password
    assert_eq!(
        h.server.credentials,
        vec![
            ("user".to_string(), "pass".to_string()),
            ("user".to_string(), "SESS123".to_string()),
        ]
    );

    let now = h.at(36_500);
    h.session.tick(now);
    h.pump(now);
    assert_eq!(h.session.current_key_id(), Some(1));
    assert!(h.session.is_connected());
    assert_eq!(h.events.events().len(), 1);

    let packet = icmp_packet(b"rekeyed");
    h.session.receive_tunnel(&[packet.clone()], now);
    let written = h.link.take_written();
    assert_eq!(written[0][..4], [0x49, 0, 0, 5]);
    h.server.receive(&written);
    assert_eq!(h.server.received.last(), Some(&packet));

    // the retired key still decrypts in-flight data
    let late = icmp_packet(b"late");
    let encrypted = h.server.encrypt(0, &[late.clone()]);
    h.session.receive_link(&encrypted, now);
    assert_eq!(h.tunnel.received(), vec![late]);
}

#[test]
fn test_rustls_handshake() {
    let server = Server::new(CipherAlgorithm::Aes256Gcm, PEER_ID_REPLY).with_rustls();
    let tls = RustlsFactory::new(&Handshake::CaOnly {
        ca_pem: CA.to_string(),
    })
    .unwrap();
    let mut h = Harness::with_tls(
        MockLink::udp(),
        SessionOptions::default(),
        server,
        Arc::new(tls),
    );

    h.connect();
    assert!(h.events.started());
    assert_eq!(h.session.peer_id(), Some(5));

    let packet = icmp_packet(b"over tls");
    h.session.receive_tunnel(&[packet.clone()], h.at(300));
    let written = h.link.take_written();
    h.server.receive(&written);
    assert_eq!(h.server.received, vec![packet]);
}
