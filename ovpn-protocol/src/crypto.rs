//! Data channel ciphers
//!
//! Two packet layouts are supported, selected by the negotiated cipher.
//!
//! CBC with HMAC (encrypt-then-MAC):
//! ```text
//! +--------+----------------------+---------+------------------------------------+
//! | header | HMAC(iv || ct)       | IV (16) | AES-CBC-PKCS7(packet_id || plain)  |
//! +--------+----------------------+---------+------------------------------------+
//! ```
//!
//! GCM (AEAD):
//! ```text
//! +--------+---------------+----------+---------------------+
//! | header | packet_id (4) | tag (16) | AES-GCM(plain)      |
//! +--------+---------------+----------+---------------------+
//! ```
//!
//! For GCM the nonce is `packet_id || hmac_key[..8]` and the additional data is
//! the packet id, preceded by the 4-byte header for `P_DATA_V2`.

use std::fmt;
use std::str::FromStr;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit as AeadKeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use zeroize::Zeroizing;

use crate::keys::KeyMaterial;
use crate::packet::PACKET_ID_LENGTH;
use crate::random::SecureRandom;
use crate::{Error, Result};

/// AES block size / IV size
const CIPHER_BLOCK_SIZE: usize = 16;

/// GCM authentication tag size
const GCM_TAG_LENGTH: usize = 16;

/// Bytes of the HMAC key used as implicit GCM nonce
const GCM_NONCE_TAIL_LENGTH: usize = 8;

/// Header length of `P_DATA_V2` (opcode + 24-bit peer id)
const DATA_V2_HEADER_LENGTH: usize = 4;

/// Data channel cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherAlgorithm {
    pub const fn key_length(self) -> usize {
        match self {
            Self::Aes128Cbc | Self::Aes128Gcm => 16,
            Self::Aes192Cbc => 24,
            Self::Aes256Cbc | Self::Aes256Gcm => 32,
        }
    }

    pub const fn is_aead(self) -> bool {
        matches!(self, Self::Aes128Gcm | Self::Aes256Gcm)
    }

    /// OpenSSL-style name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aes128Cbc => "AES-128-CBC",
            Self::Aes192Cbc => "AES-192-CBC",
            Self::Aes256Cbc => "AES-256-CBC",
            Self::Aes128Gcm => "AES-128-GCM",
            Self::Aes256Gcm => "AES-256-GCM",
        }
    }
}

impl FromStr for CipherAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AES-128-CBC" => Ok(Self::Aes128Cbc),
            "AES-192-CBC" => Ok(Self::Aes192Cbc),
            "AES-256-CBC" => Ok(Self::Aes256Cbc),
            "AES-128-GCM" => Ok(Self::Aes128Gcm),
            "AES-256-GCM" => Ok(Self::Aes256Gcm),
            _ => Err(Error::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// HMAC digest used with CBC ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub const fn digest_length(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    fn sign(self, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
        match self {
            Self::Sha1 => hmac_sign::<Hmac<Sha1>>(key, parts),
            Self::Sha256 => hmac_sign::<Hmac<Sha256>>(key, parts),
            Self::Sha512 => hmac_sign::<Hmac<Sha512>>(key, parts),
        }
    }

    fn verify(self, key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<()> {
        match self {
            Self::Sha1 => hmac_verify::<Hmac<Sha1>>(key, parts, tag),
            Self::Sha256 => hmac_verify::<Hmac<Sha256>>(key, parts, tag),
            Self::Sha512 => hmac_verify::<Hmac<Sha512>>(key, parts, tag),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(Error::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn hmac_sign<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|e| Error::Encryption(format!("HMAC key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_verify<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<()> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|e| Error::Decryption(format!("HMAC key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag)
        .map_err(|_| Error::Decryption("HMAC mismatch".to_string()))
}

fn cbc_encrypt<E: KeyIvInit + BlockEncryptMut>(key: &[u8], iv: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let cipher = E::new_from_slices(key, iv).map_err(|e| Error::Encryption(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plain))
}

fn cbc_decrypt<D: KeyIvInit + BlockDecryptMut>(key: &[u8], iv: &[u8], ct: &[u8]) -> Result<Vec<u8>> {
    let cipher = D::new_from_slices(key, iv).map_err(|e| Error::Decryption(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ct)
        .map_err(|e| Error::Decryption(e.to_string()))
}

enum Gcm {
    Aes128 { encrypt: Aes128Gcm, decrypt: Aes128Gcm },
    Aes256 { encrypt: Aes256Gcm, decrypt: Aes256Gcm },
}

impl Gcm {
    fn new(cipher: CipherAlgorithm, enc_key: &[u8], dec_key: &[u8]) -> Result<Self> {
        let invalid = |e: aes::cipher::InvalidLength| Error::Encryption(e.to_string());
        Ok(match cipher {
            CipherAlgorithm::Aes128Gcm => Self::Aes128 {
                encrypt: <Aes128Gcm as AeadKeyInit>::new_from_slice(enc_key).map_err(invalid)?,
                decrypt: <Aes128Gcm as AeadKeyInit>::new_from_slice(dec_key).map_err(invalid)?,
            },
            CipherAlgorithm::Aes256Gcm => Self::Aes256 {
                encrypt: <Aes256Gcm as AeadKeyInit>::new_from_slice(enc_key).map_err(invalid)?,
                decrypt: <Aes256Gcm as AeadKeyInit>::new_from_slice(dec_key).map_err(invalid)?,
            },
            other => return Err(Error::UnsupportedAlgorithm(other.to_string())),
        })
    }

    fn seal(&self, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let nonce = Nonce::from_slice(nonce);
        let sealed = match self {
            Self::Aes128 { encrypt, .. } => encrypt.encrypt(nonce, payload),
            Self::Aes256 { encrypt, .. } => encrypt.encrypt(nonce, payload),
        };
        sealed.map_err(|_| Error::Encryption("AES-GCM encryption failed".into()))
    }

    fn open(&self, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let nonce = Nonce::from_slice(nonce);
        let opened = match self {
            Self::Aes128 { decrypt, .. } => decrypt.decrypt(nonce, payload),
            Self::Aes256 { decrypt, .. } => decrypt.decrypt(nonce, payload),
        };
        opened.map_err(|_| Error::Decryption("AES-GCM authentication failed".into()))
    }
}

enum Mode {
    Cbc {
        digest: DigestAlgorithm,
        cipher_enc: Zeroizing<Vec<u8>>,
        cipher_dec: Zeroizing<Vec<u8>>,
        hmac_enc: Zeroizing<Vec<u8>>,
        hmac_dec: Zeroizing<Vec<u8>>,
    },
    Gcm {
        gcm: Gcm,
        nonce_enc: Zeroizing<[u8; GCM_NONCE_TAIL_LENGTH]>,
        nonce_dec: Zeroizing<[u8; GCM_NONCE_TAIL_LENGTH]>,
    },
}

/// Keyed data channel cipher for one session key
pub struct CryptoBox {
    cipher: CipherAlgorithm,
    mode: Mode,
}

impl CryptoBox {
    /// Key the box from derived key material
    ///
    /// The digest is ignored by AEAD ciphers.
    pub fn new(cipher: CipherAlgorithm, digest: DigestAlgorithm, keys: &KeyMaterial) -> Result<Self> {
        let key_len = cipher.key_length();
        let mode = if cipher.is_aead() {
            let mut nonce_enc = Zeroizing::new([0u8; GCM_NONCE_TAIL_LENGTH]);
            let mut nonce_dec = Zeroizing::new([0u8; GCM_NONCE_TAIL_LENGTH]);
            nonce_enc.copy_from_slice(&keys.hmac_encrypt_key()[..GCM_NONCE_TAIL_LENGTH]);
            nonce_dec.copy_from_slice(&keys.hmac_decrypt_key()[..GCM_NONCE_TAIL_LENGTH]);
            Mode::Gcm {
                gcm: Gcm::new(
                    cipher,
                    &keys.cipher_encrypt_key()[..key_len],
                    &keys.cipher_decrypt_key()[..key_len],
                )?,
                nonce_enc,
                nonce_dec,
            }
        } else {
            let digest_len = digest.digest_length();
            Mode::Cbc {
                digest,
                cipher_enc: Zeroizing::new(keys.cipher_encrypt_key()[..key_len].to_vec()),
                cipher_dec: Zeroizing::new(keys.cipher_decrypt_key()[..key_len].to_vec()),
                hmac_enc: Zeroizing::new(keys.hmac_encrypt_key()[..digest_len].to_vec()),
                hmac_dec: Zeroizing::new(keys.hmac_decrypt_key()[..digest_len].to_vec()),
            }
        };
        Ok(Self { cipher, mode })
    }

    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    /// Bytes added to a payload, excluding the header and CBC padding
    pub fn overhead(&self) -> usize {
        match &self.mode {
            Mode::Cbc { digest, .. } => digest.digest_length() + CIPHER_BLOCK_SIZE + PACKET_ID_LENGTH,
            Mode::Gcm { .. } => PACKET_ID_LENGTH + GCM_TAG_LENGTH,
        }
    }

    /// Encrypt `plain` into a complete packet starting with `header`
    pub fn encrypt(&self, header: &[u8], packet_id: u32, plain: &[u8]) -> Result<Vec<u8>> {
        match &self.mode {
            Mode::Cbc { .. } => {
                let mut iv = [0u8; CIPHER_BLOCK_SIZE];
                SecureRandom::fill(&mut iv)?;
                self.encrypt_cbc(header, packet_id, plain, &iv)
            }
            Mode::Gcm { gcm, nonce_enc, .. } => {
                let pid = packet_id.to_be_bytes();
                let nonce = gcm_nonce(&pid, &nonce_enc[..]);
                let aad = gcm_aad(header, &pid);
                let sealed = gcm.seal(&nonce, plain, &aad)?;
                let (ct, tag) = sealed.split_at(sealed.len() - GCM_TAG_LENGTH);

                let mut out = Vec::with_capacity(header.len() + self.overhead() + ct.len());
                out.extend_from_slice(header);
                out.extend_from_slice(&pid);
                out.extend_from_slice(tag);
                out.extend_from_slice(ct);
                Ok(out)
            }
        }
    }

    fn encrypt_cbc(&self, header: &[u8], packet_id: u32, plain: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let Mode::Cbc {
            digest,
            cipher_enc,
            hmac_enc,
            ..
        } = &self.mode
        else {
            return Err(Error::Encryption("not a CBC cipher".into()));
        };

        let mut inner = Zeroizing::new(Vec::with_capacity(PACKET_ID_LENGTH + plain.len()));
        inner.extend_from_slice(&packet_id.to_be_bytes());
        inner.extend_from_slice(plain);

        let ct = match self.cipher {
            CipherAlgorithm::Aes128Cbc => cbc_encrypt::<cbc::Encryptor<aes::Aes128>>(cipher_enc, iv, &inner)?,
            CipherAlgorithm::Aes192Cbc => cbc_encrypt::<cbc::Encryptor<aes::Aes192>>(cipher_enc, iv, &inner)?,
            CipherAlgorithm::Aes256Cbc => cbc_encrypt::<cbc::Encryptor<aes::Aes256>>(cipher_enc, iv, &inner)?,
            other => return Err(Error::UnsupportedAlgorithm(other.to_string())),
        };
        let tag = digest.sign(hmac_enc, &[iv, &ct])?;

        let mut out = Vec::with_capacity(header.len() + tag.len() + iv.len() + ct.len());
        out.extend_from_slice(header);
        out.extend_from_slice(&tag);
        out.extend_from_slice(iv);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Authenticate and decrypt a packet whose first `header_len` bytes are the header
    ///
    /// Returns the packet id and the plaintext.
    pub fn decrypt(&self, packet: &[u8], header_len: usize) -> Result<(u32, Zeroizing<Vec<u8>>)> {
        let min = header_len + self.overhead();
        if packet.len() < min {
            return Err(Error::PacketTooShort {
                expected: min,
                actual: packet.len(),
            });
        }
        let (header, body) = packet.split_at(header_len);

        match &self.mode {
            Mode::Cbc {
                digest,
                cipher_dec,
                hmac_dec,
                ..
            } => {
                let (tag, rest) = body.split_at(digest.digest_length());
                let (iv, ct) = rest.split_at(CIPHER_BLOCK_SIZE);
                digest.verify(hmac_dec, &[iv, ct], tag)?;

                let inner = Zeroizing::new(match self.cipher {
                    CipherAlgorithm::Aes128Cbc => cbc_decrypt::<cbc::Decryptor<aes::Aes128>>(cipher_dec, iv, ct)?,
                    CipherAlgorithm::Aes192Cbc => cbc_decrypt::<cbc::Decryptor<aes::Aes192>>(cipher_dec, iv, ct)?,
                    CipherAlgorithm::Aes256Cbc => cbc_decrypt::<cbc::Decryptor<aes::Aes256>>(cipher_dec, iv, ct)?,
                    other => return Err(Error::UnsupportedAlgorithm(other.to_string())),
                });
                if inner.len() < PACKET_ID_LENGTH {
                    return Err(Error::PacketTooShort {
                        expected: PACKET_ID_LENGTH,
                        actual: inner.len(),
                    });
                }
                let packet_id = u32::from_be_bytes([inner[0], inner[1], inner[2], inner[3]]);
                Ok((packet_id, Zeroizing::new(inner[PACKET_ID_LENGTH..].to_vec())))
            }
            Mode::Gcm { gcm, nonce_dec, .. } => {
                let (pid, rest) = body.split_at(PACKET_ID_LENGTH);
                let (tag, ct) = rest.split_at(GCM_TAG_LENGTH);
                let nonce = gcm_nonce(pid, &nonce_dec[..]);
                let aad = gcm_aad(header, pid);

                let mut sealed = Vec::with_capacity(ct.len() + GCM_TAG_LENGTH);
                sealed.extend_from_slice(ct);
                sealed.extend_from_slice(tag);
                let plain = gcm.open(&nonce, &sealed, &aad)?;

                let packet_id = u32::from_be_bytes([pid[0], pid[1], pid[2], pid[3]]);
                Ok((packet_id, Zeroizing::new(plain)))
            }
        }
    }
}

impl fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoBox").field("cipher", &self.cipher).finish()
    }
}

fn gcm_nonce(pid: &[u8], tail: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..PACKET_ID_LENGTH].copy_from_slice(pid);
    nonce[PACKET_ID_LENGTH..].copy_from_slice(&tail[..GCM_NONCE_TAIL_LENGTH]);
    nonce
}

fn gcm_aad(header: &[u8], pid: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(DATA_V2_HEADER_LENGTH + PACKET_ID_LENGTH);
    if header.len() == DATA_V2_HEADER_LENGTH {
        aad.extend_from_slice(header);
    }
    aad.extend_from_slice(pid);
    aad
}
