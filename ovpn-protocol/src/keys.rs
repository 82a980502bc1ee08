//! Data channel key derivation (TLS 1.0 style PRF)
//!
//! Keys come out of two PRF rounds:
//!
//! 1. `PRF("OpenVPN master secret", preMaster, random1, serverRandom1)` gives a
//!    48-byte master secret.
//! 2. `PRF("OpenVPN key expansion", master, random2, serverRandom2, sessionId,
//!    remoteSessionId)` gives 4 x 64 bytes of key material, laid out as
//!    cipher-encrypt, hmac-encrypt, cipher-decrypt, hmac-decrypt.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::packet::SessionId;
use crate::zeroing::SecretBuffer;
use crate::{Error, Result};

pub const LABEL_MASTER_SECRET: &str = "OpenVPN master secret";
pub const LABEL_KEY_EXPANSION: &str = "OpenVPN key expansion";

pub const PRE_MASTER_LENGTH: usize = 48;
pub const RANDOM_LENGTH: usize = 32;
pub const MASTER_SECRET_LENGTH: usize = 48;

/// Size of each key slot
pub const KEY_LENGTH: usize = 64;

/// Number of key slots
pub const KEYS_COUNT: usize = 4;

/// HMAC-based expansion of `secret` over `seed`, truncated to `size` bytes
fn p_hash<M>(secret: &[u8], seed: &[u8], size: usize) -> Result<SecretBuffer>
where
    M: Mac + hmac::digest::KeyInit + Clone,
{
    let keyed = <M as hmac::digest::KeyInit>::new_from_slice(secret)
        .map_err(|e| Error::Encryption(format!("PRF key: {}", e)))?;

    let mut out = SecretBuffer::with_capacity(size + 64);

    let mut mac = keyed.clone();
    mac.update(seed);
    let mut chain = Zeroizing::new(mac.finalize().into_bytes().to_vec());

    while out.len() < size {
        let mut mac = keyed.clone();
        mac.update(&chain);
        mac.update(seed);
        out.append(&mac.finalize().into_bytes());

        let mut mac = keyed.clone();
        mac.update(&chain);
        chain = Zeroizing::new(mac.finalize().into_bytes().to_vec());
    }
    out.truncate(size);
    Ok(out)
}

/// OpenVPN's PRF: MD5 and SHA1 expansions over the two secret halves, XORed
///
/// The halves overlap by one byte when the secret length is odd.
pub fn prf(
    label: &str,
    secret: &[u8],
    client_seed: &[u8],
    server_seed: &[u8],
    client_session_id: Option<&SessionId>,
    server_session_id: Option<&SessionId>,
    size: usize,
) -> Result<SecretBuffer> {
    let mut seed = SecretBuffer::with_capacity(label.len() + client_seed.len() + server_seed.len() + 16);
    seed.append(label.as_bytes());
    seed.append(client_seed);
    seed.append(server_seed);
    if let Some(id) = client_session_id {
        seed.append(id.as_bytes());
    }
    if let Some(id) = server_session_id {
        seed.append(id.as_bytes());
    }

    let len = secret.len() / 2;
    let lenx = len + (secret.len() & 1);
    let first_half = &secret[..lenx];
    let second_half = &secret[len..len + lenx];

    let mut out = p_hash::<Hmac<Md5>>(first_half, seed.as_bytes(), size)?;
    let sha1 = p_hash::<Hmac<Sha1>>(second_half, seed.as_bytes(), size)?;
    for (a, b) in out.as_mut_bytes().iter_mut().zip(sha1.as_bytes()) {
        *a ^= b;
    }
    Ok(out)
}

/// The four 64-byte data channel keys
pub struct KeyMaterial {
    block: SecretBuffer,
}

impl KeyMaterial {
    /// Run both PRF stages from the client's point of view
    #[allow(clippy::too_many_arguments)]
    pub fn derive(
        pre_master: &[u8],
        random1: &[u8],
        random2: &[u8],
        server_random1: &[u8],
        server_random2: &[u8],
        session_id: &SessionId,
        remote_session_id: &SessionId,
    ) -> Result<Self> {
        let master = prf(
            LABEL_MASTER_SECRET,
            pre_master,
            random1,
            server_random1,
            None,
            None,
            MASTER_SECRET_LENGTH,
        )?;
        let block = prf(
            LABEL_KEY_EXPANSION,
            master.as_bytes(),
            random2,
            server_random2,
            Some(session_id),
            Some(remote_session_id),
            KEY_LENGTH * KEYS_COUNT,
        )?;
        Ok(Self { block })
    }

    /// Wrap an existing 256-byte key block
    pub fn from_block(block: SecretBuffer) -> Result<Self> {
        if block.len() != KEY_LENGTH * KEYS_COUNT {
            return Err(Error::Encryption(format!(
                "key block must be {} bytes, got {}",
                KEY_LENGTH * KEYS_COUNT,
                block.len()
            )));
        }
        Ok(Self { block })
    }

    fn slot(&self, index: usize) -> &[u8] {
        &self.block.as_bytes()[index * KEY_LENGTH..(index + 1) * KEY_LENGTH]
    }

    pub fn cipher_encrypt_key(&self) -> &[u8] {
        self.slot(0)
    }

    pub fn hmac_encrypt_key(&self) -> &[u8] {
        self.slot(1)
    }

    pub fn cipher_decrypt_key(&self) -> &[u8] {
        self.slot(2)
    }

    pub fn hmac_decrypt_key(&self) -> &[u8] {
        self.slot(3)
    }

    /// The same keys seen from the server's side (directions swapped)
    pub fn reversed(&self) -> Self {
        let mut block = SecretBuffer::with_capacity(KEY_LENGTH * KEYS_COUNT);
        block.append(self.cipher_decrypt_key());
        block.append(self.hmac_decrypt_key());
        block.append(self.cipher_encrypt_key());
        block.append(self.hmac_encrypt_key());
        Self { block }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}
