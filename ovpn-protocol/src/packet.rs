//! Control channel packet structure and serialization
//!
//! Every unit on the link starts with a single opcode byte:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+
//! |   code (5 bits)   |key (3 bits)|
//! +---+---+---+---+---+---+---+---+
//! ```
//!
//! Reliable control units then carry:
//!
//! ```text
//! +-----------+-----------+----------------+------------------+-----------+---------+
//! | sessionId | ack count | acked ids      | remote sessionId | packet id | payload |
//! | 8 bytes   | 1 byte    | count x u32 BE | 8 bytes, if acks | u32 BE    | ...     |
//! +-----------+-----------+----------------+------------------+-----------+---------+
//! ```
//!
//! `AckV1` units stop after the ack block. Over stream transports each unit is
//! prefixed with its length as a big-endian u16 (see [`stream`] and [`parsed`]).

use std::fmt;
use std::time::Instant;

use crate::random::SecureRandom;
use crate::{Error, Result};

/// Length of a session id
pub const SESSION_ID_LENGTH: usize = 8;

/// Length of a control or data packet id
pub const PACKET_ID_LENGTH: usize = 4;

/// Key ids are 3 bits wide
pub const NUMBER_OF_KEYS: u8 = 8;

/// Mask selecting the key id from an opcode byte
pub const KEY_ID_MASK: u8 = 0b111;

/// Opcodes carried in the high 5 bits of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketCode {
    SoftResetV1 = 0x03,
    ControlV1 = 0x04,
    AckV1 = 0x05,
    DataV1 = 0x06,
    HardResetClientV2 = 0x07,
    HardResetServerV2 = 0x08,
    DataV2 = 0x09,
}

impl PacketCode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this code carries data channel traffic
    pub const fn is_data(self) -> bool {
        matches!(self, PacketCode::DataV1 | PacketCode::DataV2)
    }
}

impl TryFrom<u8> for PacketCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x03 => Ok(PacketCode::SoftResetV1),
            0x04 => Ok(PacketCode::ControlV1),
            0x05 => Ok(PacketCode::AckV1),
            0x06 => Ok(PacketCode::DataV1),
            0x07 => Ok(PacketCode::HardResetClientV2),
            0x08 => Ok(PacketCode::HardResetServerV2),
            0x09 => Ok(PacketCode::DataV2),
            other => Err(Error::UnknownPacketCode(other)),
        }
    }
}

impl fmt::Display for PacketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketCode::SoftResetV1 => "SOFT_RESET_V1",
            PacketCode::ControlV1 => "CONTROL_V1",
            PacketCode::AckV1 => "ACK_V1",
            PacketCode::DataV1 => "DATA_V1",
            PacketCode::HardResetClientV2 => "HARD_RESET_CLIENT_V2",
            PacketCode::HardResetServerV2 => "HARD_RESET_SERVER_V2",
            PacketCode::DataV2 => "DATA_V2",
        };
        f.write_str(name)
    }
}

/// Build the opcode byte for `code` and `key`
pub const fn header_byte(code: PacketCode, key: u8) -> u8 {
    (code.as_u8() << 3) | (key & KEY_ID_MASK)
}

/// Split an opcode byte into its raw code and key id
pub const fn split_header(byte: u8) -> (u8, u8) {
    (byte >> 3, byte & KEY_ID_MASK)
}

/// Session identifier (8 random bytes per endpoint)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LENGTH]);

impl SessionId {
    /// Generate a random session id
    pub fn random() -> Result<Self> {
        let mut bytes = [0u8; SESSION_ID_LENGTH];
        SecureRandom::fill(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub const fn new(bytes: [u8; SESSION_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Read a session id from the start of `buf`
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; SESSION_ID_LENGTH] = buf.get(..SESSION_ID_LENGTH)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; SESSION_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

/// One control channel unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub code: PacketCode,
    /// Key id (3 bits)
    pub key: u8,
    /// Session id of the sender
    pub session_id: SessionId,
    /// Packet ids acknowledged by this unit
    pub acks: Vec<u32>,
    /// Session id of the acknowledged peer, present iff `acks` is not empty
    pub remote_session_id: Option<SessionId>,
    /// Control packet id, absent for `AckV1`
    pub packet_id: Option<u32>,
    pub payload: Vec<u8>,
    /// When this packet was last written to the link
    pub sent_at: Option<Instant>,
}

impl ControlPacket {
    /// Create a reliable control packet without piggybacked acks
    pub fn new(
        code: PacketCode,
        key: u8,
        session_id: SessionId,
        packet_id: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            code,
            key: key & KEY_ID_MASK,
            session_id,
            acks: Vec::new(),
            remote_session_id: None,
            packet_id: Some(packet_id),
            payload,
            sent_at: None,
        }
    }

    /// Create a standalone acknowledgement
    pub fn ack(
        key: u8,
        session_id: SessionId,
        acks: Vec<u32>,
        remote_session_id: SessionId,
    ) -> Self {
        Self {
            code: PacketCode::AckV1,
            key: key & KEY_ID_MASK,
            session_id,
            acks,
            remote_session_id: Some(remote_session_id),
            packet_id: None,
            payload: Vec::new(),
            sent_at: None,
        }
    }

    /// Piggyback acknowledgements on this packet
    pub fn with_acks(mut self, acks: Vec<u32>, remote_session_id: SessionId) -> Self {
        self.acks = acks;
        self.remote_session_id = Some(remote_session_id);
        self
    }

    /// Packet id used for ordering; acks sort first
    pub fn sort_id(&self) -> u32 {
        self.packet_id.unwrap_or(0)
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            1 + SESSION_ID_LENGTH
                + 1
                + self.acks.len() * PACKET_ID_LENGTH
                + SESSION_ID_LENGTH
                + PACKET_ID_LENGTH
                + self.payload.len(),
        );
        buf.push(header_byte(self.code, self.key));
        buf.extend_from_slice(self.session_id.as_bytes());

        let acks = &self.acks[..self.acks.len().min(u8::MAX as usize)];
        match (acks.is_empty(), self.remote_session_id) {
            (false, Some(remote)) => {
                buf.push(acks.len() as u8);
                for id in acks {
                    buf.extend_from_slice(&id.to_be_bytes());
                }
                buf.extend_from_slice(remote.as_bytes());
            }
            _ => buf.push(0),
        }

        if self.code != PacketCode::AckV1 {
            buf.extend_from_slice(&self.sort_id().to_be_bytes());
            buf.extend_from_slice(&self.payload);
        }
        buf
    }

    /// Decode one unit from wire bytes
    ///
    /// Returns `Ok(None)` when `buf` is truncated, since the rest may still
    /// arrive. Unknown opcodes and data channel opcodes are errors.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let (raw_code, key) = split_header(first);
        let code = PacketCode::try_from(raw_code)?;
        if code.is_data() {
            return Err(Error::Decryption(format!(
                "{} is not a control packet",
                code
            )));
        }

        let mut offset = 1;
        let Some(session_id) = SessionId::from_slice(&buf[offset..]) else {
            return Ok(None);
        };
        offset += SESSION_ID_LENGTH;

        let Some(&ack_count) = buf.get(offset) else {
            return Ok(None);
        };
        offset += 1;

        let mut acks = Vec::with_capacity(ack_count as usize);
        let mut remote_session_id = None;
        if ack_count > 0 {
            for _ in 0..ack_count {
                let Some(id) = read_u32(buf, offset) else {
                    return Ok(None);
                };
                acks.push(id);
                offset += PACKET_ID_LENGTH;
            }
            let Some(remote) = SessionId::from_slice(&buf[offset..]) else {
                return Ok(None);
            };
            remote_session_id = Some(remote);
            offset += SESSION_ID_LENGTH;
        }

        let mut packet_id = None;
        let mut payload = Vec::new();
        if code != PacketCode::AckV1 {
            let Some(id) = read_u32(buf, offset) else {
                return Ok(None);
            };
            packet_id = Some(id);
            offset += PACKET_ID_LENGTH;
            payload = buf[offset..].to_vec();
        }

        Ok(Some(Self {
            code,
            key,
            session_id,
            acks,
            remote_session_id,
            packet_id,
            payload,
            sent_at: None,
        }))
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let b = buf.get(offset..offset + PACKET_ID_LENGTH)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Frame packets for a stream transport (u16 BE length prefix each)
///
/// Fails without output if any unit exceeds the 16-bit length prefix.
pub fn stream<P: AsRef<[u8]>>(packets: &[P]) -> Result<Vec<u8>> {
    let total: usize = packets.iter().map(|p| 2 + p.as_ref().len()).sum();
    let mut raw = Vec::with_capacity(total);
    for packet in packets {
        let packet = packet.as_ref();
        let len = u16::try_from(packet.len()).map_err(|_| Error::PacketTooLarge {
            max: u16::MAX as usize,
            actual: packet.len(),
        })?;
        raw.extend_from_slice(&len.to_be_bytes());
        raw.extend_from_slice(packet);
    }
    Ok(raw)
}

/// Split a stream into complete units
///
/// Returns the number of bytes consumed and the units found. Trailing bytes
/// of an incomplete unit are not consumed.
pub fn parsed(stream: &[u8]) -> (usize, Vec<Vec<u8>>) {
    let mut consumed = 0;
    let mut packets = Vec::new();
    while consumed + 2 <= stream.len() {
        let len = u16::from_be_bytes([stream[consumed], stream[consumed + 1]]) as usize;
        let start = consumed + 2;
        let end = start + len;
        if end > stream.len() {
            break;
        }
        packets.push(stream[start..end].to_vec());
        consumed = end;
    }
    (consumed, packets)
}

/// Receive buffer for stream transports
///
/// Accumulates partial reads and hands back whole units.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    buf: Vec<u8>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream and return every completed unit
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let (consumed, packets) = parsed(&self.buf);
        self.buf.drain(..consumed);
        packets
    }

    /// Number of buffered bytes not yet forming a unit
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
