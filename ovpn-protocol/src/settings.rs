//! Session construction parameters

use std::fmt;
use std::io::BufReader;
use std::str::FromStr;
use std::time::Duration;

use md5::{Digest, Md5};
use zeroize::Zeroizing;

use crate::crypto::{CipherAlgorithm, DigestAlgorithm};
use crate::random::SecureRandom;
use crate::{Error, Result};

/// TLS material used for the control channel
#[derive(Clone)]
pub enum Handshake {
    /// Verify the server against a CA, no client certificate
    CaOnly { ca_pem: String },
    /// Verify the server and present a client certificate
    CaCertKey {
        ca_pem: String,
        cert_pem: String,
        key_pem: Zeroizing<String>,
    },
}

impl Handshake {
    pub fn ca_pem(&self) -> &str {
        match self {
            Handshake::CaOnly { ca_pem } | Handshake::CaCertKey { ca_pem, .. } => ca_pem,
        }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handshake::CaOnly { .. } => f.write_str("CaOnly"),
            Handshake::CaCertKey { .. } => f.write_str("CaCertKey"),
        }
    }
}

/// Negotiated data channel algorithms plus the control channel trust anchor
#[derive(Debug, Clone)]
pub struct EncryptionParameters {
    pub cipher: CipherAlgorithm,
    pub digest: DigestAlgorithm,
    pub handshake: Handshake,
    /// Lowercase hex MD5 of the first CA certificate (DER)
    pub ca_md5: String,
}

impl EncryptionParameters {
    pub fn new(cipher: CipherAlgorithm, digest: DigestAlgorithm, handshake: Handshake) -> Result<Self> {
        let ca_md5 = ca_md5_digest(handshake.ca_pem())?;
        Ok(Self {
            cipher,
            digest,
            handshake,
            ca_md5,
        })
    }
}

/// MD5 of the first certificate in a PEM bundle, as lowercase hex
pub fn ca_md5_digest(ca_pem: &str) -> Result<String> {
    let mut reader = BufReader::new(ca_pem.as_bytes());
    let first = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| Error::Config("no certificate in CA".into()))?
        .map_err(|e| Error::Config(format!("invalid CA: {}", e)))?;
    Ok(hex::encode(Md5::digest(first.as_ref())))
}

/// Username and password; the password is wiped on drop
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session-wide timing constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimings {
    /// How often the host should call `tick`
    pub tick_interval: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub retransmission_interval: Duration,
    /// Delay before the first PUSH_REQUEST after a soft reset
    pub soft_reset_delay: Duration,
    pub soft_negotiation_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(120),
            retransmission_interval: Duration::from_millis(100),
            soft_reset_delay: Duration::from_secs(5),
            soft_negotiation_timeout: Duration::from_secs(120),
        }
    }
}

/// Behaviour switches resolved once per session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub sends_keep_alive: bool,
    /// Soft reset the current key after this long
    pub renegotiates_after: Option<Duration>,
    /// Use `P_DATA_V2` when the server assigns a peer id
    pub supports_peer_id: bool,
    pub uses_replay_protection: bool,
    pub timings: SessionTimings,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sends_keep_alive: true,
            renegotiates_after: None,
            supports_peer_id: true,
            uses_replay_protection: true,
            timings: SessionTimings::default(),
        }
    }
}

/// Server dialect spoken over a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommunicationType {
    /// Patched server expecting an encoded settings payload in the hard reset
    Pia,
    #[default]
    Vanilla,
}

impl FromStr for CommunicationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pia" => Ok(Self::Pia),
            "vanilla" => Ok(Self::Vanilla),
            other => Err(Error::Config(format!("unknown communication type '{}'", other))),
        }
    }
}

impl fmt::Display for CommunicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pia => f.write_str("pia"),
            Self::Vanilla => f.write_str("vanilla"),
        }
    }
}

const PIA_SETTINGS_MAGIC: &str = "53eo0rk92gxic98p1asgl5auh59r1vp4lmry1e3chzi100qntd";
const PIA_OBFUSCATION_KEY_LENGTH: usize = 3;

impl CommunicationType {
    /// Payload for the client hard reset, if this dialect sends one
    pub fn hard_reset_payload(self, encryption: &EncryptionParameters) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Pia => encode_pia_settings(encryption).map(Some),
            Self::Vanilla => Ok(None),
        }
    }
}

/// Encode cipher, digest and CA digest, XOR-obfuscated with a random 3-byte key
pub fn encode_pia_settings(encryption: &EncryptionParameters) -> Result<Vec<u8>> {
    let mut key = [0u8; PIA_OBFUSCATION_KEY_LENGTH];
    SecureRandom::fill(&mut key)?;
    Ok(obfuscate_pia_settings(encryption, key))
}

fn obfuscate_pia_settings(encryption: &EncryptionParameters, key: [u8; PIA_OBFUSCATION_KEY_LENGTH]) -> Vec<u8> {
    let plain = format!(
        "{}crypto\t{}|{}\tca\t{}",
        PIA_SETTINGS_MAGIC, encryption.cipher, encryption.digest, encryption.ca_md5
    );
    let mut encoded = Vec::with_capacity(key.len() + plain.len());
    encoded.extend_from_slice(&key);
    encoded.extend(
        plain
            .bytes()
            .enumerate()
            .map(|(i, b)| b ^ key[i % PIA_OBFUSCATION_KEY_LENGTH]),
    );
    encoded
}
