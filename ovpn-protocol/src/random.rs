//! Cryptographically secure random bytes

use rand::rngs::OsRng;
use rand::TryRngCore;

use crate::zeroing::SecretBuffer;
use crate::{Error, Result};

/// Thin wrapper over the operating system CSPRNG
pub struct SecureRandom;

impl SecureRandom {
    pub fn fill(buf: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| Error::RandomGenerator(e.to_string()))
    }

    pub fn bytes(len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        Self::fill(&mut buf)?;
        Ok(buf)
    }

    /// Random bytes in a zero-on-drop buffer
    pub fn secret(len: usize) -> Result<SecretBuffer> {
        let mut buf = SecretBuffer::zeroed(len);
        Self::fill(buf.as_mut_bytes())?;
        Ok(buf)
    }

    pub fn u32() -> Result<u32> {
        OsRng
            .try_next_u32()
            .map_err(|e| Error::RandomGenerator(e.to_string()))
    }
}
