//! OpenVPN client session
//!
//! [`SessionProxy`] owns the whole protocol state: control channel
//! reliability, the hard/soft reset handshake, key derivation, keep-alive and
//! data dispatch. It performs no I/O and reads no clock on its own. The host
//! serialises every call (link reads, tunnel reads, timer ticks) and passes the
//! current [`Instant`], writes go out through the [`Link`] and [`Tunnel`]
//! handed to it.
//!
//! # Lifecycle
//!
//! ```text
//! set_link ──► hard reset ──► TLS ──► auth ──► PUSH_REQUEST ──► Started
//!                                                                  │
//!        soft reset (renegotiation) ◄──────────────────────────────┘
//!
//! shutdown / reconnect / fatal error ──► Stopped ──► cleanup
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::auth::{Authenticator, AUTH_FAILED};
use crate::crypto::CryptoBox;
use crate::datapath::{DataPath, PING_STRING};
use crate::event::{EventHandler, SessionEvent};
use crate::packet::{split_header, ControlPacket, PacketCode, SessionId, NUMBER_OF_KEYS};
use crate::push_reply::PushReply;
use crate::reliable::{InboundQueue, OutboundQueue};
use crate::session_key::{ControlState, KeyState, SessionKey};
use crate::settings::{Credentials, EncryptionParameters, SessionOptions};
use crate::tls::{TlsFactory, TlsSession};
use crate::transport::{Link, Tunnel};
use crate::{Error, Result};

const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMethod {
    Shutdown,
    Reconnect,
}

/// Client side of one OpenVPN session
pub struct SessionProxy {
    encryption: EncryptionParameters,
    credentials: Credentials,
    options: SessionOptions,
    tls_factory: Arc<dyn TlsFactory>,
    events: Arc<dyn EventHandler>,

    keys: BTreeMap<u8, SessionKey>,
    old_keys: VecDeque<u8>,
    negotiation_key_id: u8,
    current_key_id: Option<u8>,

    link: Option<Box<dyn Link>>,
    tunnel: Option<Arc<dyn Tunnel>>,

    session_id: Option<SessionId>,
    remote_session_id: Option<SessionId>,
    auth_token: Option<Zeroizing<String>>,
    peer_id: Option<u32>,
    next_push_request: Option<Instant>,
    connected_at: Option<Instant>,
    last_ping_out: Option<Instant>,
    last_ping_in: Option<Instant>,
    is_stopping: bool,
    is_suspended: bool,
    stop_error: Option<Error>,

    control_out: OutboundQueue,
    control_in: InboundQueue,
    authenticator: Option<Authenticator>,

    bytes_in: u64,
    bytes_out: u64,
}

impl SessionProxy {
    pub fn new(
        encryption: EncryptionParameters,
        credentials: Credentials,
        options: SessionOptions,
        tls_factory: Arc<dyn TlsFactory>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            encryption,
            credentials,
            options,
            tls_factory,
            events,
            keys: BTreeMap::new(),
            old_keys: VecDeque::new(),
            negotiation_key_id: 0,
            current_key_id: None,
            link: None,
            tunnel: None,
            session_id: None,
            remote_session_id: None,
            auth_token: None,
            peer_id: None,
            next_push_request: None,
            connected_at: None,
            last_ping_out: None,
            last_ping_in: None,
            is_stopping: false,
            is_suspended: false,
            stop_error: None,
            control_out: OutboundQueue::new(),
            control_in: InboundQueue::new(),
            authenticator: None,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    // ========================================================================
    // Public interface
    // ========================================================================

    /// Attach the link and start negotiating with a hard reset
    pub fn set_link(&mut self, link: Box<dyn Link>, now: Instant) {
        if self.link.is_some() {
            log::warn!("Link interface already set!");
            return;
        }
        log::debug!("Starting VPN session");
        self.link = Some(link);
        self.hard_reset(now);
    }

    /// Attach the tunnel receiving decrypted packets
    pub fn set_tunnel(&mut self, tunnel: Arc<dyn Tunnel>) {
        if self.tunnel.is_some() {
            log::warn!("Tunnel interface already set!");
            return;
        }
        self.tunnel = Some(tunnel);
    }

    /// Whether the link can be replaced without renegotiating
    pub fn can_rebind_link(&self) -> bool {
        self.peer_id.is_some() && self.is_connected()
    }

    /// Move the session to a new link, keeping keys and peer id
    ///
    /// Returns false, leaving the current link in place, when the server
    /// assigned no peer id.
    pub fn rebind_link(&mut self, link: Box<dyn Link>, now: Instant) -> bool {
        if !self.can_rebind_link() {
            log::warn!("Cannot rebind link without a peer id");
            return false;
        }
        log::info!(
            "Rebinding link to {}",
            link.remote_address().as_deref().unwrap_or("?")
        );
        self.link = Some(link);
        self.last_ping_in = Some(now);
        true
    }

    /// Stop without a reconnect hint. No-op if already stopping.
    pub fn shutdown(&mut self, error: Option<Error>) {
        if self.is_stopping {
            log::warn!("Ignore stop request, already stopping!");
            return;
        }
        self.defer_stop(StopMethod::Shutdown, error);
    }

    /// Stop asking the host to reconnect. No-op if already stopping.
    pub fn reconnect(&mut self, error: Option<Error>) {
        if self.is_stopping {
            log::warn!("Ignore stop request, already stopping!");
            return;
        }
        self.defer_stop(StopMethod::Reconnect, error);
    }

    /// Report an asynchronous link write failure
    pub fn link_write_failed(&mut self) {
        if self.is_stopping {
            return;
        }
        log::error!("Failed LINK write");
        self.defer_stop(StopMethod::Reconnect, Some(Error::FailedLinkWrite));
    }

    pub fn suspend(&mut self) {
        log::info!("Suspending...");
        self.is_suspended = true;
    }

    /// Resume and ping right away to wake the link or fail early
    pub fn resume(&mut self, now: Instant) {
        log::info!("Resuming...");
        self.is_suspended = false;
        if self.is_connected() && !self.is_stopping {
            self.send_ping(now);
        }
    }

    /// Reset all mutable state; a persistent tunnel is kept
    pub fn cleanup(&mut self) {
        log::info!("Cleaning up...");

        self.keys.clear();
        self.old_keys.clear();
        self.negotiation_key_id = 0;
        self.current_key_id = None;

        self.session_id = None;
        self.remote_session_id = None;
        self.auth_token = None;
        self.peer_id = None;
        self.next_push_request = None;
        self.connected_at = None;
        self.last_ping_out = None;
        self.last_ping_in = None;
        self.reset_control_channel();

        self.link = None;
        if !self.tunnel.as_ref().is_some_and(|t| t.is_persistent()) {
            self.tunnel = None;
        }

        self.is_stopping = false;
        self.is_suspended = false;
        self.stop_error = None;
        self.bytes_in = 0;
        self.bytes_out = 0;
    }

    /// Handle packets read from the link
    pub fn receive_link(&mut self, packets: &[Vec<u8>], now: Instant) {
        if !self.should_handle_packets() {
            return;
        }
        self.maybe_renegotiate(now);
        self.last_ping_in = Some(now);

        let mut data_packets: BTreeMap<u8, Vec<Vec<u8>>> = BTreeMap::new();
        for packet in packets {
            let Some(&first) = packet.first() else {
                continue;
            };
            let (raw_code, key) = split_header(first);
            let code = match PacketCode::try_from(raw_code) {
                Ok(code) => code,
                Err(_) => {
                    log::warn!("Ignored unknown packet code {}", raw_code);
                    continue;
                }
            };

            if code.is_data() {
                if !self.keys.contains_key(&key) {
                    log::error!("Key with id {} not found", key);
                    self.defer_stop(StopMethod::Shutdown, Some(Error::BadKey(key)));
                    return;
                }
                data_packets.entry(key).or_default().push(packet.clone());
                continue;
            }

            let control = match ControlPacket::decode(packet) {
                Ok(Some(control)) => control,
                Ok(None) => {
                    log::warn!("Dropped truncated control packet ({} bytes)", packet.len());
                    continue;
                }
                Err(e) => {
                    log::warn!("Dropped control packet: {}", e);
                    continue;
                }
            };
            log::debug!(
                "Packet has code {}, sessionId {} and {} acks entries",
                control.code,
                control.session_id,
                control.acks.len()
            );

            if let Some(remote) = control.remote_session_id {
                self.handle_acks(&control.acks, remote, now);
                if self.is_stopping {
                    return;
                }
            }
            let Some(packet_id) = control.packet_id else {
                continue;
            };

            self.send_ack(key, packet_id, control.session_id);
            for ready in self.control_in.enqueue(control) {
                self.handle_control_packet(ready, now);
                if self.is_stopping {
                    return;
                }
            }
        }

        for (key, packets) in data_packets {
            self.handle_data_packets(key, &packets);
            if self.is_stopping {
                return;
            }
        }
    }

    /// Encrypt and send packets read from the tunnel
    pub fn receive_tunnel(&mut self, packets: &[Vec<u8>], now: Instant) {
        if !self.should_handle_packets() {
            return;
        }
        self.send_data_packets(packets);
        self.last_ping_out = Some(now);
    }

    /// Drive timers: retransmission, negotiation timeouts, keep-alive and
    /// renegotiation. Call every [`crate::SessionTimings::tick_interval`].
    pub fn tick(&mut self, now: Instant) {
        if !self.should_handle_packets() || self.is_suspended {
            return;
        }
        self.maybe_renegotiate(now);
        self.loop_negotiation(now);
        if self.is_stopping {
            return;
        }
        self.ping(now);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The error that stopped the session, until cleanup
    pub fn stop_error(&self) -> Option<&Error> {
        self.stop_error.as_ref()
    }

    pub fn is_stopping(&self) -> bool {
        self.is_stopping
    }

    pub fn is_suspended(&self) -> bool {
        self.is_suspended
    }

    /// Whether a key is connected and carrying data
    pub fn is_connected(&self) -> bool {
        self.current_key()
            .is_some_and(|key| key.control_state == Some(ControlState::Connected))
    }

    /// Data channel bytes received and sent on the link
    pub fn data_count(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }

    pub fn peer_id(&self) -> Option<u32> {
        self.peer_id
    }

    pub fn has_auth_token(&self) -> bool {
        self.auth_token.is_some()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn negotiation_key_id(&self) -> u8 {
        self.negotiation_key_id
    }

    pub fn current_key_id(&self) -> Option<u8> {
        self.current_key_id
    }

    /// When the current key finished negotiating
    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn tick_interval(&self) -> Duration {
        self.options.timings.tick_interval
    }

    // ========================================================================
    // Loop
    // ========================================================================

    fn loop_negotiation(&mut self, now: Instant) {
        let Some(link) = &self.link else {
            return;
        };
        let reliable = link.is_reliable();
        let hard_reset_timeout = link.hard_reset_timeout();
        let negotiation_timeout = link.negotiation_timeout();
        let soft_timeout = self.options.timings.soft_negotiation_timeout;

        let (hard_reset_timed_out, negotiation_timed_out) = match self.keys.get(&self.negotiation_key_id) {
            Some(key) if key.control_state != Some(ControlState::Connected) => (
                key.did_hard_reset_time_out(now, hard_reset_timeout),
                key.did_negotiation_time_out(now, negotiation_timeout, soft_timeout),
            ),
            _ => return,
        };
        if hard_reset_timed_out {
            self.defer_stop(StopMethod::Reconnect, Some(Error::ConnectionTimeout));
            return;
        }
        if negotiation_timed_out {
            self.defer_stop(StopMethod::Shutdown, Some(Error::ConnectionTimeout));
            return;
        }

        if !reliable {
            self.push_request(now);
            self.flush_control_queue(now);
        }
    }

    fn ping(&mut self, now: Instant) {
        if !self.is_connected() {
            return;
        }
        let timings = &self.options.timings;
        let ping_timeout = timings.ping_timeout;
        let ping_interval = timings.ping_interval;

        if self
            .last_ping_in
            .is_some_and(|at| now.saturating_duration_since(at) > ping_timeout)
        {
            self.defer_stop(StopMethod::Shutdown, Some(Error::PingTimeout));
            return;
        }
        if !self.options.sends_keep_alive {
            return;
        }
        let elapsed = self
            .last_ping_out
            .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
        if elapsed >= ping_interval {
            self.send_ping(now);
        }
    }

    fn send_ping(&mut self, now: Instant) {
        log::debug!("Send ping");
        self.send_data_packets(&[PING_STRING.to_vec()]);
        self.last_ping_out = Some(now);
    }

    fn maybe_renegotiate(&mut self, now: Instant) {
        let Some(after) = self.options.renegotiates_after else {
            return;
        };
        if self.current_key_id != Some(self.negotiation_key_id) {
            return;
        }
        let Some(key) = self.keys.get(&self.negotiation_key_id) else {
            return;
        };
        let elapsed = now.saturating_duration_since(key.start_time);
        if elapsed > after {
            log::debug!("Renegotiating after {:.1} seconds", elapsed.as_secs_f64());
            self.soft_reset(now);
        }
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    fn reset_control_channel(&mut self) {
        self.control_out.reset();
        self.control_in.reset();
        self.authenticator = None;
    }

    fn hard_reset(&mut self, now: Instant) {
        log::debug!("Send hard reset");

        self.reset_control_channel();
        self.session_id = match SessionId::random() {
            Ok(id) => Some(id),
            Err(e) => {
                self.defer_stop(StopMethod::Shutdown, Some(e));
                return;
            }
        };
        self.negotiation_key_id = 0;
        let mut key = SessionKey::new(0, now);
        key.state = KeyState::HardReset;
        self.keys.insert(0, key);
        log::debug!("Negotiation key index is 0");

        let payload = match self.link.as_ref().map(|link| link.hard_reset(&self.encryption)) {
            Some(Ok(payload)) => payload.unwrap_or_default(),
            Some(Err(e)) => {
                self.defer_stop(StopMethod::Shutdown, Some(e));
                return;
            }
            None => Vec::new(),
        };
        self.enqueue_control_packets(PacketCode::HardResetClientV2, 0, &payload, now);
    }

    fn soft_reset(&mut self, now: Instant) {
        log::debug!("Send soft reset");

        self.reset_control_channel();
        let id = ((self.negotiation_key_id + 1) % NUMBER_OF_KEYS).max(1);
        self.negotiation_key_id = id;
        let mut key = SessionKey::new(id, now);
        key.state = KeyState::SoftReset;
        key.soft_reset = true;
        self.keys.insert(id, key);
        log::debug!("Negotiation key index is {}", id);

        self.enqueue_control_packets(PacketCode::SoftResetV1, id, &[], now);
    }

    fn handle_control_packet(&mut self, packet: ControlPacket, now: Instant) {
        let Some(state) = self.keys.get(&self.negotiation_key_id).map(|k| k.state) else {
            return;
        };
        if packet.key != self.negotiation_key_id {
            log::error!(
                "Bad key in control packet ({} != {})",
                packet.key,
                self.negotiation_key_id
            );
            self.defer_stop(StopMethod::Shutdown, Some(Error::BadKey(packet.key)));
            return;
        }
        log::debug!(
            "Handle control packet with code {} and id {}",
            packet.code,
            packet.sort_id()
        );

        match (packet.code, state) {
            (PacketCode::HardResetServerV2, KeyState::HardReset)
            | (PacketCode::SoftResetV1, KeyState::SoftReset) => {
                if state == KeyState::HardReset {
                    self.remote_session_id = Some(packet.session_id);
                }
                self.handle_server_reset(&packet, now);
            }
            (PacketCode::ControlV1, KeyState::Tls) => self.handle_tls_packet(&packet, now),
            _ => log::debug!("Ignore {} in state {:?}", packet.code, state),
        }
    }

    fn check_remote_session(&self, packet: &ControlPacket) -> Result<()> {
        let remote = self.remote_session_id.ok_or(Error::MissingSessionId)?;
        if packet.session_id != remote {
            log::error!(
                "Packet session mismatch ({} != {})",
                packet.session_id,
                remote
            );
            return Err(Error::SessionMismatch);
        }
        Ok(())
    }

    fn negotiation_tls(&mut self) -> Result<&mut (dyn TlsSession + 'static)> {
        let id = self.negotiation_key_id;
        self.keys.get_mut(&id).ok_or(Error::BadKey(id))?.tls_mut()
    }

    fn handle_server_reset(&mut self, packet: &ControlPacket, now: Instant) {
        if let Err(e) = self.check_remote_session(packet) {
            self.defer_stop(StopMethod::Shutdown, Some(e));
            return;
        }
        log::debug!("Start TLS handshake");

        let client_hello = self.tls_factory.create().and_then(|mut tls| {
            tls.start()?;
            let out = tls.pull_cipher_text()?;
            Ok((tls, out))
        });
        let (tls, out) = match client_hello {
            Ok((tls, Some(out))) => (tls, out),
            Ok((_, None)) => {
                self.defer_stop(StopMethod::Shutdown, Some(Error::Tls("no ClientHello".into())));
                return;
            }
            Err(e) => {
                self.defer_stop(StopMethod::Shutdown, Some(e));
                return;
            }
        };

        let key_id = self.negotiation_key_id;
        if let Some(key) = self.keys.get_mut(&key_id) {
            key.state = KeyState::Tls;
            key.set_tls(tls);
        }
        log::debug!("TLS.connect: Pulled ciphertext ({} bytes)", out.len());
        self.enqueue_control_packets(PacketCode::ControlV1, key_id, &out, now);
    }

    fn handle_tls_packet(&mut self, packet: &ControlPacket, now: Instant) {
        if let Err(e) = self.check_remote_session(packet) {
            self.defer_stop(StopMethod::Shutdown, Some(e));
            return;
        }
        if packet.payload.is_empty() {
            log::warn!("TLS.connect: Control packet with empty payload?");
            return;
        }

        let key_id = self.negotiation_key_id;
        log::debug!(
            "TLS.connect: Put received ciphertext ({} bytes)",
            packet.payload.len()
        );
        let exchanged = self.negotiation_tls().and_then(|tls| {
            tls.put_cipher_text(&packet.payload)?;
            tls.pull_cipher_text()
        });
        match exchanged {
            Ok(Some(out)) => {
                log::debug!("TLS.connect: Send pulled ciphertext ({} bytes)", out.len());
                self.enqueue_control_packets(PacketCode::ControlV1, key_id, &out, now);
            }
            Ok(None) => {}
            Err(e) => {
                self.defer_stop(StopMethod::Shutdown, Some(e));
                return;
            }
        }

        if self
            .keys
            .get_mut(&key_id)
            .is_some_and(SessionKey::should_on_tls_connect)
        {
            self.on_tls_connect(now);
            if self.is_stopping {
                return;
            }
        }

        match self.negotiation_tls().and_then(|tls| tls.pull_plain_text()) {
            Ok(Some(plain)) => self.handle_control_data(plain.as_bytes(), now),
            Ok(None) => {}
            Err(e) => self.defer_stop(StopMethod::Shutdown, Some(e)),
        }
    }

    fn on_tls_connect(&mut self, now: Instant) {
        log::debug!("TLS.connect: Handshake is complete");

        let key_id = self.negotiation_key_id;
        if let Some(key) = self.keys.get_mut(&key_id) {
            key.control_state = Some(ControlState::PreAuth);
        }

        let password = self
            .auth_token
            .as_ref()
            .map_or(self.credentials.password.as_str(), |token| token.as_str());
        let auth = match Authenticator::new(&self.credentials.username, password) {
            Ok(auth) => auth,
            Err(e) => {
                self.defer_stop(StopMethod::Shutdown, Some(e));
                return;
            }
        };
        let pulled = self.negotiation_tls().and_then(|tls| {
            auth.put_auth(&mut *tls)?;
            tls.pull_cipher_text()
        });
        self.authenticator = Some(auth);

        match pulled {
            Ok(Some(out)) => {
                log::debug!("TLS.auth: Pulled ciphertext ({} bytes)", out.len());
                self.enqueue_control_packets(PacketCode::ControlV1, key_id, &out, now);
            }
            Ok(None) => log::debug!("TLS.auth: Still can't pull ciphertext"),
            Err(e) => self.defer_stop(StopMethod::Shutdown, Some(e)),
        }
    }

    fn handle_control_data(&mut self, data: &[u8], now: Instant) {
        let Some(auth) = self.authenticator.as_mut() else {
            return;
        };
        log::debug!("Pulled plain control data ({} bytes)", data.len());
        auth.append_control_data(data);

        let key_id = self.negotiation_key_id;
        let Some(key) = self.keys.get(&key_id) else {
            return;
        };
        let soft_reset = key.soft_reset;
        if key.control_state == Some(ControlState::PreAuth) {
            let parsed = match self.authenticator.as_mut() {
                Some(auth) if auth.is_auth_failed() => Err(Error::BadCredentials),
                Some(auth) => auth.parse_auth_reply(),
                None => return,
            };
            match parsed {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    self.defer_stop(StopMethod::Shutdown, Some(e));
                    return;
                }
            }
            if let Err(e) = self.setup_keys() {
                self.defer_stop(StopMethod::Shutdown, Some(e));
                return;
            }

            if let Some(key) = self.keys.get_mut(&key_id) {
                key.control_state = Some(ControlState::PreIfConfig);
            }
            let timings = &self.options.timings;
            let delay = if soft_reset {
                timings.soft_reset_delay
            } else {
                timings.retransmission_interval
            };
            self.next_push_request = Some(now + delay);
            self.push_request(now);
        }

        let messages = match self.authenticator.as_mut() {
            Some(auth) => auth.parse_messages(),
            None => return,
        };
        for message in messages {
            log::debug!("Parsed control message ({} bytes)", message.len());
            self.handle_control_message(&message, now);
            if self.is_stopping {
                return;
            }
        }
    }

    fn setup_keys(&mut self) -> Result<()> {
        let auth = self
            .authenticator
            .as_ref()
            .ok_or_else(|| Error::Tls("setting up keys without having authenticated".into()))?;
        let session_id = self.session_id.ok_or(Error::MissingSessionId)?;
        let remote_session_id = self.remote_session_id.ok_or(Error::MissingSessionId)?;

        log::debug!("Setup keys");
        let material = auth.derive_keys(&session_id, &remote_session_id)?;
        let crypto = CryptoBox::new(self.encryption.cipher, self.encryption.digest, &material)?;
        let data_path = DataPath::new(crypto, self.options.uses_replay_protection);

        let key_id = self.negotiation_key_id;
        self.keys
            .get_mut(&key_id)
            .ok_or(Error::BadKey(key_id))?
            .set_data_path(data_path);
        Ok(())
    }

    fn push_request(&mut self, now: Instant) {
        let key_id = self.negotiation_key_id;
        let Some(key) = self.keys.get(&key_id) else {
            return;
        };
        if key.control_state != Some(ControlState::PreIfConfig) {
            return;
        }
        let soft_reset = key.soft_reset;
        if !self.is_reliable_link() && !self.next_push_request.is_some_and(|at| now > at) {
            return;
        }

        log::debug!("TLS.ifconfig: Put plaintext (PUSH_REQUEST)");
        let pulled = self.negotiation_tls().and_then(|tls| {
            tls.put_plain_text(PUSH_REQUEST)?;
            tls.pull_cipher_text()
        });
        match pulled {
            Ok(Some(out)) => {
                log::debug!("TLS.ifconfig: Send pulled ciphertext ({} bytes)", out.len());
                self.enqueue_control_packets(PacketCode::ControlV1, key_id, &out, now);
            }
            Ok(None) => {
                log::debug!("TLS.ifconfig: Still can't pull ciphertext");
                return;
            }
            Err(e) => {
                log::warn!("TLS.ifconfig: {}", e);
                return;
            }
        }

        if soft_reset {
            self.authenticator = None;
            self.complete_negotiation(now);
        }
        self.next_push_request = Some(now + self.options.timings.retransmission_interval);
    }

    fn handle_control_message(&mut self, message: &str, now: Instant) {
        if message.starts_with(AUTH_FAILED) {
            self.defer_stop(StopMethod::Shutdown, Some(Error::BadCredentials));
            return;
        }
        let state = self
            .keys
            .get(&self.negotiation_key_id)
            .and_then(|key| key.control_state);
        if state != Some(ControlState::PreIfConfig) {
            return;
        }

        let reply = match PushReply::parse(message) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                log::debug!("Ignore control message");
                return;
            }
            Err(e) => {
                self.defer_stop(StopMethod::Shutdown, Some(e));
                return;
            }
        };
        log::debug!("Received PUSH_REPLY");

        if let Some(token) = reply.auth_token {
            self.auth_token = Some(Zeroizing::new(token));
        }
        self.peer_id = if self.options.supports_peer_id {
            reply.peer_id
        } else {
            None
        };
        if let Some(peer_id) = self.peer_id {
            log::debug!("Server assigned peer id {}", peer_id);
        }

        self.authenticator = None;
        self.complete_negotiation(now);
        self.last_ping_out = Some(now);

        let remote_address = self.link.as_ref().and_then(|link| link.remote_address());
        self.events.on_event(SessionEvent::Started {
            remote_address,
            address: reply.address,
            gateway_address: reply.gateway_address,
            dns_servers: reply.dns_servers,
        });
    }

    fn complete_negotiation(&mut self, now: Instant) {
        let key_id = self.negotiation_key_id;
        if let Some(key) = self.keys.get_mut(&key_id) {
            key.control_state = Some(ControlState::Connected);
            key.start_handling_packets(self.peer_id);
        }
        self.connected_at = Some(now);
        self.transition_keys();
    }

    fn transition_keys(&mut self) {
        if let Some(current) = self.current_key_id {
            if current != self.negotiation_key_id {
                self.old_keys.push_back(current);
            }
        }
        self.current_key_id = Some(self.negotiation_key_id);
        self.clean_keys();
    }

    // keep at most one retired key for in-flight data
    fn clean_keys(&mut self) {
        while self.old_keys.len() > 1 {
            let Some(id) = self.old_keys.pop_front() else {
                break;
            };
            if Some(id) != self.current_key_id && id != self.negotiation_key_id {
                self.keys.remove(&id);
            }
        }
    }

    fn current_key(&self) -> Option<&SessionKey> {
        self.current_key_id.and_then(|id| self.keys.get(&id))
    }

    fn is_reliable_link(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_reliable())
    }

    // ========================================================================
    // Control reliability
    // ========================================================================

    fn enqueue_control_packets(&mut self, code: PacketCode, key: u8, payload: &[u8], now: Instant) {
        let Some(link) = &self.link else {
            log::warn!("Not writing to LINK, interface is down");
            return;
        };
        let Some(session_id) = self.session_id else {
            log::warn!("No local session id, not sending {}", code);
            return;
        };

        let ids = self
            .control_out
            .enqueue(code, key, session_id, payload, link.mtu());
        let count = ids.end.wrapping_sub(ids.start);
        if count > 1 {
            log::debug!(
                "Enqueued {} control packets [{}-{}]",
                count,
                ids.start,
                ids.end.wrapping_sub(1)
            );
        } else {
            log::debug!("Enqueued 1 control packet [{}]", ids.start);
        }

        self.flush_control_queue(now);
    }

    fn flush_control_queue(&mut self, now: Instant) {
        let raw = self
            .control_out
            .due(now, self.options.timings.retransmission_interval);
        if !raw.is_empty() {
            self.write_link(&raw);
        }
    }

    fn handle_acks(&mut self, packet_ids: &[u32], remote_session_id: SessionId, now: Instant) {
        if Some(remote_session_id) != self.session_id {
            log::error!("Ack session mismatch ({})", remote_session_id);
            self.defer_stop(StopMethod::Shutdown, Some(Error::SessionMismatch));
            return;
        }
        log::debug!("Server acked packetIds {:?}", packet_ids);

        // retry PUSH_REQUEST once every sent packet was acked
        if self.control_out.acknowledge(packet_ids) {
            self.push_request(now);
        }
    }

    fn send_ack(&mut self, key: u8, packet_id: u32, remote_session_id: SessionId) {
        let Some(session_id) = self.session_id else {
            return;
        };
        log::debug!("Send ack for received packetId {}", packet_id);
        let raw = ControlPacket::ack(key, session_id, vec![packet_id], remote_session_id).encode();
        self.write_link(&[raw]);
    }

    fn write_link(&mut self, packets: &[Vec<u8>]) {
        let Some(link) = &self.link else {
            log::warn!("Not writing to LINK, interface is down");
            return;
        };
        if let Err(e) = link.write_packets(packets) {
            log::error!("Failed LINK write: {}", e);
            self.defer_stop(StopMethod::Reconnect, Some(Error::FailedLinkWrite));
        }
    }

    // ========================================================================
    // Data
    // ========================================================================

    fn handle_data_packets(&mut self, key_id: u8, packets: &[Vec<u8>]) {
        let Some(key) = self.keys.get_mut(&key_id) else {
            log::warn!("Accounted a data packet for which the cryptographic key hadn't been found");
            return;
        };
        self.bytes_in += packets.iter().map(|p| p.len() as u64).sum::<u64>();

        match key.decrypt(packets) {
            Ok(Some(decrypted)) => {
                if decrypted.is_empty() {
                    return;
                }
                if let Some(tunnel) = &self.tunnel {
                    if let Err(e) = tunnel.write_packets(&decrypted) {
                        log::warn!("Failed TUN write: {}", e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => self.stop_on_data_error(e),
        }
    }

    fn send_data_packets(&mut self, packets: &[Vec<u8>]) {
        let Some(key) = self.current_key_id.and_then(|id| self.keys.get_mut(&id)) else {
            return;
        };
        match key.encrypt(packets) {
            Ok(Some(encrypted)) => {
                if encrypted.is_empty() {
                    return;
                }
                self.bytes_out += encrypted.iter().map(|p| p.len() as u64).sum::<u64>();
                self.write_link(&encrypted);
            }
            Ok(None) => {}
            Err(e) => self.stop_on_data_error(e),
        }
    }

    // reusing packet ids would break the cipher, so overflow never reconnects
    fn stop_on_data_error(&mut self, error: Error) {
        let method = match error {
            Error::DataPathOverflow => StopMethod::Shutdown,
            _ => StopMethod::Reconnect,
        };
        self.defer_stop(method, Some(error));
    }

    // ========================================================================
    // Stop
    // ========================================================================

    fn should_handle_packets(&self) -> bool {
        !self.is_stopping && !self.keys.is_empty()
    }

    fn defer_stop(&mut self, method: StopMethod, error: Option<Error>) {
        if self.is_stopping {
            log::debug!("Already stopping, dropping {:?}", error);
            return;
        }
        self.is_stopping = true;

        let should_reconnect = method == StopMethod::Reconnect;
        let action = if should_reconnect { "reconnection" } else { "shutdown" };
        match &error {
            Some(e) => log::error!("Trigger {} (error: {})", action, e),
            None => log::info!("Trigger {} on request", action),
        }

        let reason = error.as_ref().map(ToString::to_string);
        self.stop_error = error;
        self.events.on_event(SessionEvent::Stopped {
            should_reconnect,
            reason,
        });
    }
}

impl Drop for SessionProxy {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for SessionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProxy")
            .field("session_id", &self.session_id)
            .field("negotiation_key_id", &self.negotiation_key_id)
            .field("current_key_id", &self.current_key_id)
            .field("peer_id", &self.peer_id)
            .field("is_stopping", &self.is_stopping)
            .finish()
    }
}
