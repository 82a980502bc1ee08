//! OpenVPN Client Protocol Implementation
//!
//! A sans-IO engine for the OpenVPN wire protocol: reliable control channel
//! over UDP or TCP, TLS handshake, key method 2 authentication, key
//! expansion and the encrypted data channel.
//!
//! The engine never touches sockets or clocks. A host feeds it packets and
//! the current time, and receives writes through the [`Link`] and [`Tunnel`]
//! traits plus lifecycle notifications through an [`EventHandler`]:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//! use ovpn_protocol::{
//!     CipherAlgorithm, Credentials, DigestAlgorithm, EncryptionParameters, Handshake,
//!     LoggingEventHandler, RustlsFactory, SessionOptions, SessionProxy,
//! };
//! # fn link() -> Box<dyn ovpn_protocol::Link> { unimplemented!() }
//!
//! let handshake = Handshake::CaOnly { ca_pem: std::fs::read_to_string("ca.pem").unwrap() };
//! let encryption = EncryptionParameters::new(
//!     CipherAlgorithm::Aes128Gcm,
//!     DigestAlgorithm::Sha1,
//!     handshake.clone(),
//! ).unwrap();
//!
//! let mut session = SessionProxy::new(
//!     encryption,
//!     Credentials::new("user", "pass"),
//!     SessionOptions::default(),
//!     Arc::new(RustlsFactory::new(&handshake).unwrap()),
//!     Arc::new(LoggingEventHandler),
//! );
//! session.set_link(link(), Instant::now());
//! // then: receive_link / receive_tunnel as packets arrive, tick() on a timer
//! ```

mod auth;
mod crypto;
mod datapath;
mod error;
mod event;
mod keys;
mod mss;
mod packet;
mod push_reply;
mod random;
mod reliable;
mod replay;
mod session;
mod session_key;
mod settings;
mod tls;
pub mod transport;
mod zeroing;

pub use auth::{Authenticator, PEER_INFO, TLS_PREFIX};
pub use crypto::{CipherAlgorithm, CryptoBox, DigestAlgorithm};
pub use datapath::{DataPath, DEFAULT_MAX_PACKET_ID, MAX_PEER_ID, NO_COMPRESS, PING_STRING};
pub use error::{Error, Result};
pub use event::{EventHandler, LoggingEventHandler, SessionEvent};
pub use keys::{prf, KeyMaterial, LABEL_KEY_EXPANSION, LABEL_MASTER_SECRET};
pub use mss::{mss_fix, DEFAULT_MAX_MSS};
pub use packet::{
    header_byte, parsed, split_header, stream, ControlPacket, PacketCode, SessionId, StreamBuffer,
    KEY_ID_MASK, NUMBER_OF_KEYS, PACKET_ID_LENGTH, SESSION_ID_LENGTH,
};
pub use push_reply::PushReply;
pub use random::SecureRandom;
pub use reliable::{InboundQueue, OutboundQueue};
pub use replay::{ReplayProtector, REPLAY_WINDOW_SIZE};
pub use session::SessionProxy;
pub use session_key::{ControlState, KeyState, SessionKey};
pub use settings::{
    ca_md5_digest, encode_pia_settings, CommunicationType, Credentials, EncryptionParameters,
    Handshake, SessionOptions, SessionTimings,
};
pub use tls::{RustlsFactory, TlsFactory, TlsSession};
pub use transport::{Link, Tunnel, DEFAULT_LINK_MTU};
pub use zeroing::SecretBuffer;
