//! Key method 2 authentication exchanged over the TLS tunnel
//!
//! Request layout:
//! ```text
//! 00 00 00 00 02 | preMaster (48) | random1 (32) | random2 (32)
//! | u16 len + opts | u16 len + username\0 | u16 len + password\0 | u16 len + peer info
//! ```
//! The reply carries the server's two randoms and options behind the same prefix.

use crate::keys::{KeyMaterial, PRE_MASTER_LENGTH, RANDOM_LENGTH};
use crate::packet::SessionId;
use crate::random::SecureRandom;
use crate::tls::TlsSession;
use crate::zeroing::SecretBuffer;
use crate::{Error, Result};

/// Leading bytes of both the request and the reply
pub const TLS_PREFIX: [u8; 5] = [0x00, 0x00, 0x00, 0x00, 0x02];

/// Peer information sent with the credentials
pub const PEER_INFO: &str = "IV_VER=2.3.99\nIV_PROTO=2\n";

/// Control message rejecting the credentials
pub const AUTH_FAILED: &str = "AUTH_FAILED";

/// Client half of the key exchange plus the buffered control channel plaintext
pub struct Authenticator {
    control_buffer: SecretBuffer,
    pre_master: SecretBuffer,
    random1: SecretBuffer,
    random2: SecretBuffer,
    server_random1: Option<SecretBuffer>,
    server_random2: Option<SecretBuffer>,
    username: SecretBuffer,
    password: SecretBuffer,
}

impl Authenticator {
    pub fn new(username: &str, password: &str) -> Result<Self> {
        Ok(Self {
            control_buffer: SecretBuffer::new(),
            pre_master: SecureRandom::secret(PRE_MASTER_LENGTH)?,
            random1: SecureRandom::secret(RANDOM_LENGTH)?,
            random2: SecureRandom::secret(RANDOM_LENGTH)?,
            server_random1: None,
            server_random2: None,
            username: SecretBuffer::from_string(username, true),
            password: SecretBuffer::from_string(password, true),
        })
    }

    /// The full authentication request
    pub fn auth_request(&self) -> SecretBuffer {
        let mut raw = SecretBuffer::from_slice(&TLS_PREFIX);
        raw.append(self.pre_master.as_bytes());
        raw.append(self.random1.as_bytes());
        raw.append(self.random2.as_bytes());
        raw.append_sized(&[0]);
        raw.append_sized(self.username.as_bytes());
        raw.append_sized(self.password.as_bytes());
        raw.append_sized(PEER_INFO.as_bytes());
        raw
    }

    /// Write the authentication request into the TLS session
    pub fn put_auth(&self, tls: &mut dyn TlsSession) -> Result<()> {
        let raw = self.auth_request();
        log::debug!("TLS.auth: Put plaintext ({} bytes)", raw.len());
        tls.put_plain_text(raw.as_bytes())
    }

    /// Buffer plaintext pulled from the TLS session
    pub fn append_control_data(&mut self, data: &[u8]) {
        self.control_buffer.append(data);
    }

    /// Parse the server randoms once enough data is buffered
    ///
    /// Returns false while the reply is still incomplete. Consumed bytes are
    /// removed from the buffer.
    pub fn parse_auth_reply(&mut self) -> Result<bool> {
        let prefix_len = TLS_PREFIX.len();
        if self.control_buffer.len() < prefix_len + 2 * RANDOM_LENGTH + 2 {
            return Ok(false);
        }
        if self.control_buffer.as_bytes()[..prefix_len] != TLS_PREFIX {
            return Err(Error::WrongControlDataPrefix);
        }

        let mut offset = prefix_len;
        let server_random1 = self.control_buffer.slice(offset, RANDOM_LENGTH);
        offset += RANDOM_LENGTH;
        let server_random2 = self.control_buffer.slice(offset, RANDOM_LENGTH);
        offset += RANDOM_LENGTH;

        let opts_len = usize::from(self.control_buffer.u16_be(offset).unwrap_or_default());
        offset += 2;
        let Some(opts) = self.control_buffer.slice(offset, opts_len) else {
            return Ok(false);
        };
        offset += opts_len;

        log::debug!("TLS.auth: Parsed server random");
        if let Some(opts) = opts.null_terminated_string(0) {
            log::debug!("TLS.auth: Parsed server opts: \"{}\"", opts);
        }

        self.server_random1 = server_random1;
        self.server_random2 = server_random2;
        self.control_buffer.remove_until(offset);
        Ok(true)
    }

    /// Whether the server sent a rejection instead of its key exchange reply
    pub fn is_auth_failed(&self) -> bool {
        self.control_buffer.as_bytes().starts_with(AUTH_FAILED.as_bytes())
    }

    /// Extract every complete NUL-terminated message from the buffer
    pub fn parse_messages(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        let mut offset = 0;
        let bytes = self.control_buffer.as_bytes();
        while let Some(end) = bytes[offset..].iter().position(|&b| b == 0) {
            messages.push(String::from_utf8_lossy(&bytes[offset..offset + end]).into_owned());
            offset += end + 1;
        }
        self.control_buffer.remove_until(offset);
        messages
    }

    pub fn has_server_randoms(&self) -> bool {
        self.server_random1.is_some() && self.server_random2.is_some()
    }

    /// Derive data channel keys for this session pair
    pub fn derive_keys(&self, session_id: &SessionId, remote_session_id: &SessionId) -> Result<KeyMaterial> {
        let (Some(server_random1), Some(server_random2)) = (&self.server_random1, &self.server_random2) else {
            return Err(Error::Tls("server randoms not received".into()));
        };
        KeyMaterial::derive(
            self.pre_master.as_bytes(),
            self.random1.as_bytes(),
            self.random2.as_bytes(),
            server_random1.as_bytes(),
            server_random2.as_bytes(),
            session_id,
            remote_session_id,
        )
    }

    pub fn pre_master(&self) -> &[u8] {
        self.pre_master.as_bytes()
    }

    pub fn random1(&self) -> &[u8] {
        self.random1.as_bytes()
    }

    pub fn random2(&self) -> &[u8] {
        self.random2.as_bytes()
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("buffered", &self.control_buffer.len())
            .field("has_server_randoms", &self.has_server_randoms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(opts: &[u8]) -> Vec<u8> {
        let mut raw = TLS_PREFIX.to_vec();
        raw.extend_from_slice(&[0x33; 32]);
        raw.extend_from_slice(&[0x44; 32]);
        raw.extend_from_slice(&(opts.len() as u16).to_be_bytes());
        raw.extend_from_slice(opts);
        raw
    }

    #[test]
    fn test_auth_request_layout() {
        let auth = Authenticator::new("user", "pass").unwrap();
        let raw = auth.auth_request();
        let bytes = raw.as_bytes();

        assert_eq!(&bytes[..5], &TLS_PREFIX);
        assert_eq!(&bytes[5..53], auth.pre_master());
        assert_eq!(&bytes[53..85], auth.random1());
        assert_eq!(&bytes[85..117], auth.random2());

        let mut tail = Vec::new();
        tail.extend_from_slice(&[0x00, 0x01, 0x00]);
        tail.extend_from_slice(&[0x00, 0x05]);
        tail.extend_from_slice(b"user\0");
        tail.extend_from_slice(&[0x00, 0x05]);
        tail.extend_from_slice(b"pass\0");
        tail.extend_from_slice(&(PEER_INFO.len() as u16).to_be_bytes());
        tail.extend_from_slice(PEER_INFO.as_bytes());
        assert_eq!(&bytes[117..], tail.as_slice());
    }

    #[test]
    fn test_parse_reply_incrementally() {
        let mut auth = Authenticator::new("user", "pass").unwrap();
        let mut data = reply(b"V4\0");
        data.extend_from_slice(b"PUSH_REPLY,ifconfig 10.0.0.2 10.0.0.1\0");

        auth.append_control_data(&data[..40]);
        assert!(!auth.parse_auth_reply().unwrap());
        // randoms in, opts still short
        auth.append_control_data(&data[40..72]);
        assert!(!auth.parse_auth_reply().unwrap());
        auth.append_control_data(&data[72..]);
        assert!(auth.parse_auth_reply().unwrap());
        assert!(auth.has_server_randoms());

        assert_eq!(auth.parse_messages(), vec!["PUSH_REPLY,ifconfig 10.0.0.2 10.0.0.1"]);
        assert!(auth.parse_messages().is_empty());
    }

    #[test]
    fn test_wrong_prefix() {
        let mut auth = Authenticator::new("user", "pass").unwrap();
        let mut data = reply(&[]);
        data[4] = 0x01;
        auth.append_control_data(&data);
        assert!(matches!(auth.parse_auth_reply(), Err(Error::WrongControlDataPrefix)));
    }

    #[test]
    fn test_auth_failed_before_reply() {
        let mut auth = Authenticator::new("user", "pass").unwrap();
        auth.append_control_data(b"AUTH_FAILED\0");
        assert!(auth.is_auth_failed());
        assert!(!auth.parse_auth_reply().unwrap());

        let mut auth = Authenticator::new("user", "pass").unwrap();
        auth.append_control_data(&reply(&[]));
        assert!(!auth.is_auth_failed());
    }

    #[test]
    fn test_parse_messages_keeps_partial() {
        let mut auth = Authenticator::new("user", "pass").unwrap();
        auth.append_control_data(b"AUTH_FAILED\0PUSH_RE");
        assert_eq!(auth.parse_messages(), vec!["AUTH_FAILED"]);
        auth.append_control_data(b"PLY\0");
        assert_eq!(auth.parse_messages(), vec!["PUSH_REPLY"]);
    }

    #[test]
    fn test_derive_keys_requires_reply() {
        let mut auth = Authenticator::new("user", "pass").unwrap();
        let sid = SessionId::new([1; 8]);
        let rsid = SessionId::new([2; 8]);
        assert!(auth.derive_keys(&sid, &rsid).is_err());

        auth.append_control_data(&reply(&[]));
        assert!(auth.parse_auth_reply().unwrap());
        let keys = auth.derive_keys(&sid, &rsid).unwrap();
        assert_ne!(keys.cipher_encrypt_key(), keys.cipher_decrypt_key());
    }
}
