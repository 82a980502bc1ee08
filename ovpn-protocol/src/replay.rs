//! Sliding window replay detection for data channel packet ids

/// Window size in packets
pub const REPLAY_WINDOW_SIZE: u32 = 1024;

const WORD_BITS: u32 = u64::BITS;
const WORDS: usize = (REPLAY_WINDOW_SIZE / WORD_BITS) as usize;

/// Tracks the highest packet id seen and a bitmap of the ids just below it
#[derive(Debug, Clone)]
pub struct ReplayProtector {
    highest: u32,
    bitmap: [u64; WORDS],
}

impl Default for ReplayProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayProtector {
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: [0; WORDS],
        }
    }

    /// Record `packet_id`, returning true if it was already seen or is too old
    ///
    /// Packet id 0 is never valid on the data channel.
    pub fn is_replayed(&mut self, packet_id: u32) -> bool {
        if packet_id == 0 {
            return true;
        }

        if packet_id > self.highest {
            let advance = packet_id - self.highest;
            if advance >= REPLAY_WINDOW_SIZE {
                self.bitmap = [0; WORDS];
            } else {
                for id in self.highest + 1..packet_id {
                    self.clear(id);
                }
            }
            self.highest = packet_id;
            self.set(packet_id);
            return false;
        }

        if self.highest - packet_id >= REPLAY_WINDOW_SIZE {
            return true;
        }
        if self.test(packet_id) {
            return true;
        }
        self.set(packet_id);
        false
    }

    fn position(id: u32) -> (usize, u64) {
        let bit = id % REPLAY_WINDOW_SIZE;
        ((bit / WORD_BITS) as usize, 1u64 << (bit % WORD_BITS))
    }

    fn test(&self, id: u32) -> bool {
        let (word, mask) = Self::position(id);
        self.bitmap[word] & mask != 0
    }

    fn set(&mut self, id: u32) {
        let (word, mask) = Self::position(id);
        self.bitmap[word] |= mask;
    }

    fn clear(&mut self, id: u32) {
        let (word, mask) = Self::position(id);
        self.bitmap[word] &= !mask;
    }
}
