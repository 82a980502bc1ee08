//! Data channel packet processing
//!
//! Outbound IP packets are framed as `no-compress marker || payload`, encrypted
//! with the next packet id and prefixed with the data header. Inbound packets
//! go through the reverse path, with replay and keep-alive filtering.

use crate::crypto::CryptoBox;
use crate::mss::{mss_fix, DEFAULT_MAX_MSS};
use crate::packet::{header_byte, PacketCode};
use crate::replay::ReplayProtector;
use crate::{Error, Result};

/// Payload of a keep-alive ping
pub const PING_STRING: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7, 0x48,
];

/// Compression framing byte for uncompressed payloads
pub const NO_COMPRESS: u8 = 0xFA;

/// Default packet id ceiling, well below `u32::MAX`
pub const DEFAULT_MAX_PACKET_ID: u32 = u32::MAX - 10_000;

/// Largest peer id representable in the `P_DATA_V2` header
pub const MAX_PEER_ID: u32 = 0x00FF_FFFF;

const DATA_V1_HEADER_LENGTH: usize = 1;
const DATA_V2_HEADER_LENGTH: usize = 4;

/// Per-key data channel state
#[derive(Debug)]
pub struct DataPath {
    crypto: CryptoBox,
    max_packet_id: u32,
    out_packet_id: u32,
    replay: Option<ReplayProtector>,
    peer_id: Option<u32>,
    max_mss: u16,
}

impl DataPath {
    pub fn new(crypto: CryptoBox, uses_replay_protection: bool) -> Self {
        Self {
            crypto,
            max_packet_id: DEFAULT_MAX_PACKET_ID,
            out_packet_id: 0,
            replay: uses_replay_protection.then(ReplayProtector::new),
            peer_id: None,
            max_mss: DEFAULT_MAX_MSS,
        }
    }

    /// Switch outbound packets to `P_DATA_V2` with the given peer id
    pub fn set_peer_id(&mut self, peer_id: Option<u32>) {
        self.peer_id = peer_id.map(|id| id & MAX_PEER_ID);
    }

    pub fn peer_id(&self) -> Option<u32> {
        self.peer_id
    }

    pub fn set_max_packet_id(&mut self, max_packet_id: u32) {
        self.max_packet_id = max_packet_id;
    }

    pub fn set_max_mss(&mut self, max_mss: u16) {
        self.max_mss = max_mss;
    }

    /// Last packet id assigned to an outbound packet
    pub fn out_packet_id(&self) -> u32 {
        self.out_packet_id
    }

    fn header(&self, key: u8) -> Vec<u8> {
        match self.peer_id {
            Some(peer_id) => {
                let mut header = Vec::with_capacity(DATA_V2_HEADER_LENGTH);
                header.push(header_byte(PacketCode::DataV2, key));
                header.extend_from_slice(&peer_id.to_be_bytes()[1..]);
                header
            }
            None => vec![header_byte(PacketCode::DataV1, key)],
        }
    }

    /// Encrypt tunnel packets for key `key`
    ///
    /// Fails with [`Error::DataPathOverflow`] once the packet id ceiling is hit.
    pub fn encrypt_packets(&mut self, packets: &[Vec<u8>], key: u8) -> Result<Vec<Vec<u8>>> {
        let header = self.header(key);
        let mut encrypted = Vec::with_capacity(packets.len());

        for packet in packets {
            if self.out_packet_id >= self.max_packet_id {
                log::error!("Data path packet id ceiling reached ({})", self.max_packet_id);
                return Err(Error::DataPathOverflow);
            }
            self.out_packet_id += 1;

            let mut plain = Vec::with_capacity(packet.len() + 1);
            plain.push(NO_COMPRESS);
            plain.extend_from_slice(packet);
            mss_fix(&mut plain[1..], self.max_mss);

            encrypted.push(self.crypto.encrypt(&header, self.out_packet_id, &plain)?);
        }
        Ok(encrypted)
    }

    /// Decrypt link packets for delivery to the tunnel
    ///
    /// Undecryptable and replayed packets are dropped. `keep_alive` is set when
    /// a ping was received. Fails with [`Error::DataPathOverflow`] if a packet
    /// id exceeds the ceiling.
    pub fn decrypt_packets(&mut self, packets: &[Vec<u8>], keep_alive: &mut bool) -> Result<Vec<Vec<u8>>> {
        let mut decrypted = Vec::with_capacity(packets.len());

        for packet in packets {
            let Some(&first) = packet.first() else {
                continue;
            };
            let header_len = if first >> 3 == PacketCode::DataV2.as_u8() {
                DATA_V2_HEADER_LENGTH
            } else {
                DATA_V1_HEADER_LENGTH
            };

            let (packet_id, plain) = match self.crypto.decrypt(packet, header_len) {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("Dropping data packet: {}", e);
                    continue;
                }
            };

            if packet_id > self.max_packet_id {
                log::error!("Inbound packet id {} over ceiling", packet_id);
                return Err(Error::DataPathOverflow);
            }
            if let Some(replay) = &mut self.replay {
                if replay.is_replayed(packet_id) {
                    log::debug!("Dropping replayed data packet {}", packet_id);
                    continue;
                }
            }

            let Some((&marker, payload)) = plain.split_first() else {
                log::warn!("Dropping empty data packet {}", packet_id);
                continue;
            };
            if marker != NO_COMPRESS {
                log::warn!("Dropping data packet {} with compression marker {:#04x}", packet_id, marker);
                continue;
            }
            if payload == PING_STRING {
                log::trace!("Received keep-alive ping");
                *keep_alive = true;
                continue;
            }

            let mut payload = payload.to_vec();
            mss_fix(&mut payload, self.max_mss);
            decrypted.push(payload);
        }
        Ok(decrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherAlgorithm, DigestAlgorithm};
    use crate::keys::KeyMaterial;
    use crate::zeroing::SecretBuffer;

    fn pair(cipher: CipherAlgorithm) -> (DataPath, DataPath) {
        let block: Vec<u8> = (0..=255).collect();
        let keys = KeyMaterial::from_block(SecretBuffer::from_slice(&block)).unwrap();
        let client = CryptoBox::new(cipher, DigestAlgorithm::Sha1, &keys).unwrap();
        let server = CryptoBox::new(cipher, DigestAlgorithm::Sha1, &keys.reversed()).unwrap();
        (DataPath::new(client, true), DataPath::new(server, true))
    }

    #[test]
    fn test_roundtrip_v1() {
        let (mut client, mut server) = pair(CipherAlgorithm::Aes128Cbc);
        let packets = vec![vec![0x45, 1, 2, 3], vec![0x45, 4, 5, 6, 7]];
        let encrypted = client.encrypt_packets(&packets, 3).unwrap();
        assert_eq!(encrypted[0][0], (6 << 3) | 3);
        assert_eq!(client.out_packet_id(), 2);

        let mut keep_alive = false;
        let decrypted = server.decrypt_packets(&encrypted, &mut keep_alive).unwrap();
        assert_eq!(decrypted, packets);
        assert!(!keep_alive);
    }

    #[test]
    fn test_peer_id_header() {
        let (mut client, mut server) = pair(CipherAlgorithm::Aes256Gcm);
        client.set_peer_id(Some(0x0112_3456));
        assert_eq!(client.peer_id(), Some(0x12_3456));

        let encrypted = client.encrypt_packets(&[vec![0x45; 40]], 1).unwrap();
        assert_eq!(&encrypted[0][..4], &[(9 << 3) | 1, 0x12, 0x34, 0x56]);

        let mut keep_alive = false;
        let decrypted = server.decrypt_packets(&encrypted, &mut keep_alive).unwrap();
        assert_eq!(decrypted, vec![vec![0x45; 40]]);
    }

    #[test]
    fn test_ping_is_consumed() {
        let (mut client, mut server) = pair(CipherAlgorithm::Aes128Gcm);
        let encrypted = client.encrypt_packets(&[PING_STRING.to_vec()], 0).unwrap();
        let mut keep_alive = false;
        assert!(server.decrypt_packets(&encrypted, &mut keep_alive).unwrap().is_empty());
        assert!(keep_alive);
    }

    #[test]
    fn test_replay_is_dropped() {
        let (mut client, mut server) = pair(CipherAlgorithm::Aes128Cbc);
        let encrypted = client.encrypt_packets(&[vec![0x45; 20]], 0).unwrap();
        let mut keep_alive = false;
        assert_eq!(server.decrypt_packets(&encrypted, &mut keep_alive).unwrap().len(), 1);
        assert!(server.decrypt_packets(&encrypted, &mut keep_alive).unwrap().is_empty());

        // a fresh id is still accepted
        let next = client.encrypt_packets(&[vec![0x45; 20]], 0).unwrap();
        assert_eq!(server.decrypt_packets(&next, &mut keep_alive).unwrap().len(), 1);
    }

    #[test]
    fn test_replay_disabled_delivers_duplicates() {
        let block: Vec<u8> = (0..=255).collect();
        let keys = KeyMaterial::from_block(SecretBuffer::from_slice(&block)).unwrap();
        let mut client = DataPath::new(
            CryptoBox::new(CipherAlgorithm::Aes128Gcm, DigestAlgorithm::Sha1, &keys).unwrap(),
            false,
        );
        let mut server = DataPath::new(
            CryptoBox::new(CipherAlgorithm::Aes128Gcm, DigestAlgorithm::Sha1, &keys.reversed()).unwrap(),
            false,
        );
        let encrypted = client.encrypt_packets(&[vec![0x45; 20]], 0).unwrap();
        let doubled = vec![encrypted[0].clone(), encrypted[0].clone()];
        let mut keep_alive = false;
        assert_eq!(server.decrypt_packets(&doubled, &mut keep_alive).unwrap().len(), 2);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let (_, mut server) = pair(CipherAlgorithm::Aes128Cbc);
        let mut keep_alive = false;
        let garbage = vec![vec![], vec![0x30], vec![0x30; 80]];
        assert!(server.decrypt_packets(&garbage, &mut keep_alive).unwrap().is_empty());
    }

    #[test]
    fn test_outbound_overflow() {
        let (mut client, _) = pair(CipherAlgorithm::Aes128Gcm);
        client.set_max_packet_id(2);
        assert_eq!(client.encrypt_packets(&[vec![1], vec![2]], 0).unwrap().len(), 2);
        assert!(matches!(
            client.encrypt_packets(&[vec![3]], 0),
            Err(Error::DataPathOverflow)
        ));
    }

    #[test]
    fn test_inbound_overflow() {
        let (mut client, mut server) = pair(CipherAlgorithm::Aes128Gcm);
        let encrypted = client.encrypt_packets(&[vec![1], vec![2]], 0).unwrap();
        server.set_max_packet_id(1);
        let mut keep_alive = false;
        assert!(matches!(
            server.decrypt_packets(&encrypted, &mut keep_alive),
            Err(Error::DataPathOverflow)
        ));
    }
}
