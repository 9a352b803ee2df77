//! Sliding-window replay protection.
//!
//! Relays may retransmit, so a receiver sees duplicates and out-of-order
//! frames. The window accepts any sequence it has not seen that is no more
//! than [`WINDOW_SIZE`] - 1 behind the highest sequence observed.

/// Number of sequence numbers tracked behind the highest seen.
pub const WINDOW_SIZE: u64 = 1024;

const WORDS: usize = (WINDOW_SIZE / 64) as usize;

/// Replay window over 64-bit sequence numbers.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    highest: Option<u64>,
    // Bit `seq % WINDOW_SIZE` is set when `seq` was seen.
    bitmap: [u64; WORDS],
}

impl ReplayWindow {
    /// Create an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            highest: None,
            bitmap: [0; WORDS],
        }
    }

    /// Returns true if `seq` has not been seen and is still inside the window.
    #[must_use]
    pub fn check(&self, seq: u64) -> bool {
        match self.highest {
            None => true,
            Some(highest) if seq > highest => true,
            Some(highest) => highest - seq < WINDOW_SIZE && !self.bit(seq),
        }
    }

    /// Record `seq` as seen, advancing the window if needed.
    pub fn mark(&mut self, seq: u64) {
        match self.highest {
            Some(highest) if seq <= highest => {}
            Some(highest) => {
                if seq - highest >= WINDOW_SIZE {
                    self.bitmap = [0; WORDS];
                } else {
                    for stale in highest + 1..=seq {
                        self.clear_bit(stale);
                    }
                }
                self.highest = Some(seq);
            }
            None => self.highest = Some(seq),
        }
        self.set_bit(seq);
    }

    /// Highest sequence number recorded so far.
    #[must_use]
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    fn position(seq: u64) -> (usize, u64) {
        let slot = seq % WINDOW_SIZE;
        ((slot / 64) as usize, 1u64 << (slot % 64))
    }

    fn bit(&self, seq: u64) -> bool {
        let (word, mask) = Self::position(seq);
        self.bitmap[word] & mask != 0
    }

    fn set_bit(&mut self, seq: u64) {
        let (word, mask) = Self::position(seq);
        self.bitmap[word] |= mask;
    }

    fn clear_bit(&mut self, seq: u64) {
        let (word, mask) = Self::position(seq);
        self.bitmap[word] &= !mask;
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
