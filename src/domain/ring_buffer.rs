//! Fixed-capacity byte queue fed by the notification callback.
//!
//! One slot is always left free so that `read == write` means empty. When the
//! producer outruns the consumer the oldest byte is overwritten; latency is
//! bounded by the backlog governor, not by backpressure from this buffer.

/// Circular byte buffer. Not synchronized; the owner serializes access.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    read: usize,
    write: usize,
}

impl RingBuffer {
    /// Create a buffer holding up to `capacity - 1` bytes.
    ///
    /// Capacities below 2 are raised to 2 so the buffer can hold at least one byte.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity.max(2)].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    /// Number of queued bytes.
    pub fn count(&self) -> usize {
        let len = self.storage.len();
        (self.write + len - self.read) % len
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Append one byte, dropping the oldest byte if the buffer is full.
    pub fn push(&mut self, byte: u8) {
        let len = self.storage.len();
        self.storage[self.write] = byte;
        self.write = (self.write + 1) % len;
        if self.write == self.read {
            self.read = (self.read + 1) % len;
        }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.push(byte);
        }
    }

    /// Remove the oldest byte. Callers check [`count`](Self::count) first;
    /// `None` only signals a violated precondition.
    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.storage[self.read];
        self.read = (self.read + 1) % self.storage.len();
        Some(byte)
    }

    /// Fill `out` from the front of the queue. All-or-nothing: returns `false`
    /// and consumes nothing when fewer than `out.len()` bytes are queued.
    pub fn pop_into(&mut self, out: &mut [u8]) -> bool {
        if self.count() < out.len() {
            return false;
        }
        let len = self.storage.len();
        for slot in out.iter_mut() {
            *slot = self.storage[self.read];
            self.read = (self.read + 1) % len;
        }
        true
    }

    /// Drop up to `n` of the oldest bytes, returning how many were dropped.
    pub fn discard(&mut self, n: usize) -> usize {
        let dropped = n.min(self.count());
        self.read = (self.read + dropped) % self.storage.len();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut ring = RingBuffer::new(8);
        ring.extend_from_slice(&[1, 2, 3]);
        assert_eq!(ring.pop(), Some(1));
        ring.push(4);
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(4));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_count_tracks_pushes_and_pops_across_wraparound() {
        let mut ring = RingBuffer::new(5);
        let mut pushed = 0;
        let mut popped = 0;
        for round in 0..20u8 {
            ring.push(round);
            ring.push(round.wrapping_add(100));
            pushed += 2;
            assert_eq!(ring.pop(), Some(round));
            popped += 1;
            assert_eq!(ring.count(), pushed - popped);
            assert_eq!(ring.pop(), Some(round.wrapping_add(100)));
            popped += 1;
            assert_eq!(ring.count(), pushed - popped);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_push_on_full_overwrites_oldest() {
        let mut ring = RingBuffer::new(4);
        ring.extend_from_slice(&[10, 11, 12]);
        assert_eq!(ring.count(), 3);

        ring.push(13);
        assert_eq!(ring.count(), 3);
        assert_eq!(ring.pop(), Some(11));
        assert_eq!(ring.pop(), Some(12));
        assert_eq!(ring.pop(), Some(13));
    }

    #[test]
    fn test_pop_into_is_all_or_nothing() {
        let mut ring = RingBuffer::new(16);
        ring.extend_from_slice(&[1, 2, 3]);

        let mut out = [0u8; 4];
        assert!(!ring.pop_into(&mut out));
        assert_eq!(ring.count(), 3);

        let mut out = [0u8; 2];
        assert!(ring.pop_into(&mut out));
        assert_eq!(out, [1, 2]);
        assert_eq!(ring.count(), 1);
    }

    #[test]
    fn test_discard_is_clamped_to_count() {
        let mut ring = RingBuffer::new(16);
        ring.extend_from_slice(&[1, 2, 3, 4, 5]);
        assert_eq!(ring.discard(2), 2);
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.discard(10), 2);
        assert!(ring.is_empty());
    }
}
