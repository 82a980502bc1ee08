//! Control channel reliability: ordered delivery and retransmission

use std::collections::BTreeSet;
use std::ops::Range;
use std::time::{Duration, Instant};

use crate::packet::{ControlPacket, PacketCode, SessionId};

/// Reorders inbound control packets by packet id
///
/// Packets are released strictly in ascending id order, starting at 0.
/// Duplicates and ids already delivered are discarded.
#[derive(Debug, Default)]
pub struct InboundQueue {
    queue: Vec<ControlPacket>,
    next_id: u32,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The packet id expected next
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Number of buffered out-of-order packets
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Buffer `packet` and return every packet that is now deliverable
    pub fn enqueue(&mut self, packet: ControlPacket) -> Vec<ControlPacket> {
        let id = packet.sort_id();
        if id < self.next_id {
            log::debug!("Discard stale control packet {} (expecting {})", id, self.next_id);
            return Vec::new();
        }
        match self.queue.binary_search_by_key(&id, ControlPacket::sort_id) {
            Ok(_) => {
                log::debug!("Discard duplicate control packet {}", id);
            }
            Err(pos) => self.queue.insert(pos, packet),
        }

        let mut ready = Vec::new();
        while self
            .queue
            .first()
            .is_some_and(|p| p.sort_id() == self.next_id)
        {
            ready.push(self.queue.remove(0));
            self.next_id = self.next_id.wrapping_add(1);
        }
        ready
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.next_id = 0;
    }
}

/// Outbound control packets awaiting acknowledgement
#[derive(Debug, Default)]
pub struct OutboundQueue {
    queue: Vec<ControlPacket>,
    pending_acks: BTreeSet<u32>,
    next_id: u32,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `payload` into chunks of at most `max_chunk` bytes and queue them
    ///
    /// An empty payload still produces one packet. Returns the range of
    /// packet ids assigned.
    pub fn enqueue(
        &mut self,
        code: PacketCode,
        key: u8,
        session_id: SessionId,
        payload: &[u8],
        max_chunk: usize,
    ) -> Range<u32> {
        let first_id = self.next_id;
        let max_chunk = max_chunk.max(1);
        let mut offset = 0;
        loop {
            let end = (offset + max_chunk).min(payload.len());
            let packet = ControlPacket::new(
                code,
                key,
                session_id,
                self.next_id,
                payload[offset..end].to_vec(),
            );
            self.queue.push(packet);
            self.next_id = self.next_id.wrapping_add(1);
            offset = end;
            if offset >= payload.len() {
                break;
            }
        }
        first_id..self.next_id
    }

    /// Encode every packet never sent or last sent at least `retransmission` ago
    ///
    /// Returned packets are marked as sent at `now` and tracked as pending
    /// acknowledgement.
    pub fn due(&mut self, now: Instant, retransmission: Duration) -> Vec<Vec<u8>> {
        let mut raw = Vec::new();
        for packet in &mut self.queue {
            if let Some(sent_at) = packet.sent_at {
                if now.saturating_duration_since(sent_at) < retransmission {
                    continue;
                }
            }
            log::debug!(
                "Send control packet {} with code {} ({} bytes payload)",
                packet.sort_id(),
                packet.code,
                packet.payload.len()
            );
            self.pending_acks.insert(packet.sort_id());
            packet.sent_at = Some(now);
            raw.push(packet.encode());
        }
        raw
    }

    /// Drop acknowledged packets
    ///
    /// Returns true when no sent packet is left pending acknowledgement.
    pub fn acknowledge(&mut self, ids: &[u32]) -> bool {
        self.queue.retain(|p| !ids.contains(&p.sort_id()));
        for id in ids {
            self.pending_acks.remove(id);
        }
        self.pending_acks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending_acks(&self) -> usize {
        self.pending_acks.len()
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.pending_acks.clear();
        self.next_id = 0;
    }
}
