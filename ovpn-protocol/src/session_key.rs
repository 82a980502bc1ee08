//! Per key id negotiation state

use std::time::{Duration, Instant};

use crate::datapath::DataPath;
use crate::tls::TlsSession;
use crate::{Error, Result};

/// Reset/TLS progress of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Invalid,
    HardReset,
    SoftReset,
    Tls,
}

/// Progress of the authenticated control channel on top of TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    PreAuth,
    PreIfConfig,
    Connected,
}

pub struct SessionKey {
    pub id: u8,
    pub start_time: Instant,
    pub state: KeyState,
    pub control_state: Option<ControlState>,
    pub soft_reset: bool,
    tls: Option<Box<dyn TlsSession>>,
    data_path: Option<DataPath>,
    is_tls_connected: bool,
    handles_packets: bool,
}

impl SessionKey {
    pub fn new(id: u8, now: Instant) -> Self {
        Self {
            id,
            start_time: now,
            state: KeyState::Invalid,
            control_state: None,
            soft_reset: false,
            tls: None,
            data_path: None,
            is_tls_connected: false,
            handles_packets: false,
        }
    }

    /// Still waiting for the server reset past the link's timeout
    pub fn did_hard_reset_time_out(&self, now: Instant, hard_reset_timeout: Duration) -> bool {
        self.state == KeyState::HardReset && now.saturating_duration_since(self.start_time) > hard_reset_timeout
    }

    /// Not connected yet past the applicable negotiation timeout
    pub fn did_negotiation_time_out(&self, now: Instant, link_timeout: Duration, soft_timeout: Duration) -> bool {
        let timeout = if self.soft_reset { soft_timeout } else { link_timeout };
        self.control_state != Some(ControlState::Connected)
            && now.saturating_duration_since(self.start_time) > timeout
    }

    /// True exactly once, the first time the TLS handshake is seen complete
    pub fn should_on_tls_connect(&mut self) -> bool {
        if self.is_tls_connected {
            return false;
        }
        if self.tls.as_ref().is_some_and(|tls| tls.is_connected()) {
            self.is_tls_connected = true;
        }
        self.is_tls_connected
    }

    pub fn set_tls(&mut self, tls: Box<dyn TlsSession>) {
        self.tls = Some(tls);
    }

    pub fn tls_mut(&mut self) -> Result<&mut (dyn TlsSession + 'static)> {
        self.tls
            .as_deref_mut()
            .ok_or_else(|| Error::Tls(format!("no TLS session for key {}", self.id)))
    }

    pub fn set_data_path(&mut self, data_path: DataPath) {
        self.data_path = Some(data_path);
    }

    pub fn data_path(&self) -> Option<&DataPath> {
        self.data_path.as_ref()
    }

    /// Allow data packets, optionally switching to `P_DATA_V2`
    pub fn start_handling_packets(&mut self, peer_id: Option<u32>) {
        if let Some(data_path) = &mut self.data_path {
            data_path.set_peer_id(peer_id);
        }
        self.handles_packets = true;
    }

    pub fn handles_packets(&self) -> bool {
        self.handles_packets
    }

    /// Encrypt tunnel packets; `None` while data handling hasn't started
    pub fn encrypt(&mut self, packets: &[Vec<u8>]) -> Result<Option<Vec<Vec<u8>>>> {
        let id = self.id;
        match (&mut self.data_path, self.handles_packets) {
            (Some(data_path), true) => data_path.encrypt_packets(packets, id).map(Some),
            _ => {
                log::warn!("Data: Key {} not ready, not encrypting {} packets", id, packets.len());
                Ok(None)
            }
        }
    }

    /// Decrypt link packets; `None` while data handling hasn't started
    pub fn decrypt(&mut self, packets: &[Vec<u8>]) -> Result<Option<Vec<Vec<u8>>>> {
        let id = self.id;
        match (&mut self.data_path, self.handles_packets) {
            (Some(data_path), true) => {
                let mut keep_alive = false;
                let decrypted = data_path.decrypt_packets(packets, &mut keep_alive)?;
                if keep_alive {
                    log::debug!("Data: Received ping, do nothing");
                }
                Ok(Some(decrypted))
            }
            _ => {
                log::warn!("Data: Key {} not ready, dropping {} packets", id, packets.len());
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("control_state", &self.control_state)
            .field("soft_reset", &self.soft_reset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherAlgorithm, CryptoBox, DigestAlgorithm};
    use crate::keys::KeyMaterial;
    use crate::transport::mock::MockTlsSession;
    use crate::zeroing::SecretBuffer;

    fn data_path() -> DataPath {
        let keys = KeyMaterial::from_block(SecretBuffer::zeroed(256)).unwrap();
        DataPath::new(
            CryptoBox::new(CipherAlgorithm::Aes128Gcm, DigestAlgorithm::Sha1, &keys).unwrap(),
            true,
        )
    }

    #[test]
    fn test_hard_reset_timeout() {
        let start = Instant::now();
        let mut key = SessionKey::new(0, start);
        let timeout = Duration::from_secs(2);
        assert!(!key.did_hard_reset_time_out(start + Duration::from_secs(3), timeout));

        key.state = KeyState::HardReset;
        assert!(!key.did_hard_reset_time_out(start + Duration::from_secs(2), timeout));
        assert!(key.did_hard_reset_time_out(start + Duration::from_secs(3), timeout));
    }

    #[test]
    fn test_negotiation_timeout_soft_grace() {
        let start = Instant::now();
        let link = Duration::from_secs(10);
        let soft = Duration::from_secs(120);
        let mut key = SessionKey::new(1, start);
        assert!(key.did_negotiation_time_out(start + Duration::from_secs(11), link, soft));

        key.soft_reset = true;
        assert!(!key.did_negotiation_time_out(start + Duration::from_secs(11), link, soft));
        assert!(key.did_negotiation_time_out(start + Duration::from_secs(121), link, soft));

        key.control_state = Some(ControlState::Connected);
        assert!(!key.did_negotiation_time_out(start + Duration::from_secs(500), link, soft));
    }

    #[test]
    fn test_tls_connect_edge() {
        let mut key = SessionKey::new(0, Instant::now());
        assert!(!key.should_on_tls_connect());
        assert!(key.tls_mut().is_err());

        let mut tls = MockTlsSession::new();
        tls.start().unwrap();
        tls.put_cipher_text(crate::transport::mock::SERVER_HELLO).unwrap();
        key.set_tls(Box::new(tls));

        assert!(key.should_on_tls_connect());
        assert!(!key.should_on_tls_connect());
    }

    #[test]
    fn test_packets_refused_until_started() {
        let mut key = SessionKey::new(2, Instant::now());
        assert!(key.encrypt(&[vec![1, 2, 3]]).unwrap().is_none());

        key.set_data_path(data_path());
        assert!(key.encrypt(&[vec![1, 2, 3]]).unwrap().is_none());
        assert!(key.decrypt(&[vec![0x30; 40]]).unwrap().is_none());

        key.start_handling_packets(Some(7));
        let encrypted = key.encrypt(&[vec![1, 2, 3]]).unwrap().unwrap();
        assert_eq!(&encrypted[0][..4], &[(9 << 3) | 2, 0, 0, 7]);
        assert_eq!(key.data_path().and_then(DataPath::peer_id), Some(7));
    }
}
