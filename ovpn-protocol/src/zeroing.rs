//! Zero-on-drop byte buffers for key material and credentials

use std::fmt;

use zeroize::{Zeroize, Zeroizing};

/// Growable byte buffer whose contents are wiped when dropped
///
/// Not `Clone`: copies go through [`SecretBuffer::from_slice`].
#[derive(Default)]
pub struct SecretBuffer {
    bytes: Zeroizing<Vec<u8>>,
}

impl SecretBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Zeroizing::new(Vec::with_capacity(capacity)),
        }
    }

    /// Create a zero-filled buffer of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Zeroizing::new(vec![0u8; len]),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::with_capacity(bytes.len());
        buf.append(bytes);
        buf
    }

    /// Copy a string, optionally followed by a NUL byte
    pub fn from_string(s: &str, null_terminated: bool) -> Self {
        let mut buf = Self::with_capacity(s.len() + 1);
        buf.append(s.as_bytes());
        if null_terminated {
            buf.append(&[0]);
        }
        buf
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Append `bytes` preceded by their length as a big-endian u16
    pub fn append_sized(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(u16::MAX as usize) as u16;
        self.append(&len.to_be_bytes());
        self.append(&bytes[..len as usize]);
    }

    /// Copy out `count` bytes starting at `offset`
    pub fn slice(&self, offset: usize, count: usize) -> Option<SecretBuffer> {
        let end = offset.checked_add(count)?;
        self.bytes.get(offset..end).map(SecretBuffer::from_slice)
    }

    pub fn u16_be(&self, offset: usize) -> Option<u16> {
        let b = self.bytes.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Drop the first `offset` bytes, shifting the rest to the front
    pub fn remove_until(&mut self, offset: usize) {
        let offset = offset.min(self.bytes.len());
        let remaining = self.bytes.len() - offset;
        self.bytes.copy_within(offset.., 0);
        self.bytes[remaining..].zeroize();
        self.bytes.truncate(remaining);
    }

    /// Shorten to `len` bytes, wiping the cut tail
    pub fn truncate(&mut self, len: usize) {
        if len < self.bytes.len() {
            self.bytes[len..].zeroize();
            self.bytes.truncate(len);
        }
    }

    /// Read a NUL-terminated UTF-8 string starting at `offset`
    ///
    /// Returns `None` when no terminator is buffered yet.
    pub fn null_terminated_string(&self, offset: usize) -> Option<String> {
        let tail = self.bytes.get(offset..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    /// Wipe and empty the buffer
    pub fn zero(&mut self) {
        self.bytes.zeroize();
    }
}

impl PartialEq for SecretBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.as_slice() == other.bytes.as_slice()
    }
}

impl Eq for SecretBuffer {}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuffer({} bytes)", self.bytes.len())
    }
}
