//! Error types for the OpenVPN protocol engine

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations
#[derive(Debug, Error)]
pub enum Error {
    /// The connection attempt timed out.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// The server certificate failed verification against the CA.
    #[error("peer verification failed")]
    PeerVerification,

    /// The session id is missing where one is required.
    #[error("missing session id")]
    MissingSessionId,

    /// A packet carried a session id that doesn't match the negotiated one.
    #[error("session id mismatch")]
    SessionMismatch,

    /// A data packet referenced a key id with no negotiated key.
    #[error("bad key id {0}")]
    BadKey(u8),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The authentication reply doesn't start with the expected prefix.
    #[error("wrong control data prefix")]
    WrongControlDataPrefix,

    /// The server rejected the credentials (AUTH_FAILED).
    #[error("bad credentials")]
    BadCredentials,

    #[error("malformed PUSH_REPLY: {0}")]
    MalformedPushReply(String),

    /// A write operation failed at the link layer.
    #[error("failed link write")]
    FailedLinkWrite,

    /// No inbound traffic within the ping timeout.
    #[error("ping timeout")]
    PingTimeout,

    /// The data channel packet id reached its ceiling.
    #[error("data path packet id overflow")]
    DataPathOverflow,

    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("packet too large for stream framing: {actual} bytes, limit {max}")]
    PacketTooLarge { max: usize, actual: usize },

    #[error("unknown packet code {0:#04x}")]
    UnknownPacketCode(u8),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("random generator failure: {0}")]
    RandomGenerator(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a fresh link may be able to recover from this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::FailedLinkWrite | Error::ConnectionTimeout | Error::Io(_)
        )
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        match e {
            rustls::Error::InvalidCertificate(_) => Error::PeerVerification,
            other => Error::Tls(other.to_string()),
        }
    }
}
