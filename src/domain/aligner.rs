//! Packet boundary recovery for the unframed notification stream.
//!
//! Every byte popped while unaligned is tested against the status-byte
//! signature. Hits are counted per phase (byte position modulo the packet
//! width); a phase that collects enough consecutive hits is taken to be the
//! status byte, so the next byte in the buffer starts a packet.

use super::packet::{Signature, PACKET_SIZE};
use super::ring_buffer::RingBuffer;
use tracing::{debug, info, warn};

/// Outcome of an alignment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignStatus {
    /// Boundary found. `recovered` holds the packet whose status byte
    /// completed the lock, when a full packet's worth of bytes was seen.
    Locked {
        recovered: Option<[u8; PACKET_SIZE]>,
    },
    /// Buffer drained without reaching the threshold.
    NotReady,
    /// Attempt ceiling reached; waits for [`FrameAligner::rearm`].
    GaveUp,
}

#[derive(Debug, Clone)]
pub struct FrameAligner {
    signature: Signature,
    hits_to_align: u32,
    max_attempts: u32,

    hits: [u32; PACKET_SIZE],
    phase: usize,
    attempts: u32,
    aligned: bool,

    // Trailing bytes, oldest first, so a lock can hand back the packet it ended on.
    window: [u8; PACKET_SIZE],
    consumed: usize,
}

impl FrameAligner {
    pub fn new(signature: Signature, hits_to_align: u32, max_attempts: u32) -> Self {
        Self {
            signature,
            hits_to_align: hits_to_align.max(1),
            max_attempts,
            hits: [0; PACKET_SIZE],
            phase: 0,
            attempts: 0,
            aligned: false,
            window: [0; PACKET_SIZE],
            consumed: 0,
        }
    }

    pub fn is_aligned(&self) -> bool {
        self.aligned
    }

    /// Full passes over the packet width since the last reset or rearm.
    #[cfg(test)]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Consume bytes from `ring` until a boundary is found, the ring runs
    /// dry, or the attempt ceiling is hit.
    pub fn align(&mut self, ring: &mut RingBuffer) -> AlignStatus {
        if self.aligned {
            return AlignStatus::Locked { recovered: None };
        }
        if self.attempts > self.max_attempts {
            return AlignStatus::GaveUp;
        }

        while let Some(byte) = ring.pop() {
            self.window.copy_within(1.., 0);
            self.window[PACKET_SIZE - 1] = byte;
            self.consumed = self.consumed.saturating_add(1);

            let hits = &mut self.hits[self.phase];
            if self.signature.matches(byte) {
                *hits += 1;
            } else {
                *hits = 0;
            }

            if *hits >= self.hits_to_align {
                self.aligned = true;
                info!(
                    phase = self.phase,
                    attempts = self.attempts,
                    "Data aligned"
                );
                let recovered = (self.consumed >= PACKET_SIZE).then_some(self.window);
                return AlignStatus::Locked { recovered };
            }

            self.phase += 1;
            if self.phase < PACKET_SIZE {
                continue;
            }
            self.phase = 0;
            self.attempts += 1;

            if self.attempts > self.max_attempts {
                warn!(
                    "Tried to align {} packets with no success, waiting for more data",
                    self.max_attempts
                );
                return AlignStatus::GaveUp;
            }
        }

        debug!(attempts = self.attempts, "Alignment not ready");
        AlignStatus::NotReady
    }

    /// Allow another round of attempts after new data arrived.
    pub fn rearm(&mut self) {
        self.attempts = 0;
    }

    /// A decoded packet failed its signature check: drop the lock and all
    /// phase counters so the next pass starts from scratch.
    pub fn mark_misaligned(&mut self) {
        warn!("Data misaligned! Attempting to realign...");
        self.reset();
    }

    pub fn reset(&mut self) {
        self.aligned = false;
        self.hits = [0; PACKET_SIZE];
        self.phase = 0;
        self.attempts = 0;
        self.window = [0; PACKET_SIZE];
        self.consumed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::packet::{Packet, DEFAULT_SIGNATURE_PATTERN};

    fn packet(seed: i16) -> Packet {
        Packet {
            gyro_x: seed,
            gyro_y: seed + 1,
            gyro_z: seed + 2,
            status: DEFAULT_SIGNATURE_PATTERN,
        }
    }

    fn aligner() -> FrameAligner {
        FrameAligner::new(Signature::default(), 5, 1000)
    }

    #[test]
    fn test_clean_stream_locks_within_threshold_times_width() {
        let mut ring = RingBuffer::new(256);
        for seed in 0..8 {
            ring.extend_from_slice(&packet(seed * 10).to_bytes());
        }
        let total = ring.count();

        let mut aligner = aligner();
        let status = aligner.align(&mut ring);

        assert!(aligner.is_aligned());
        assert_eq!(total - ring.count(), 5 * PACKET_SIZE);
        assert_eq!(
            status,
            AlignStatus::Locked {
                recovered: Some(packet(40).to_bytes())
            }
        );
    }

    #[test]
    fn test_garbage_prefix_locks_on_fifth_status_byte() {
        let mut ring = RingBuffer::new(256);
        ring.extend_from_slice(&[0x00, 0x11, 0x22, 0x33]);
        for seed in 0..5 {
            ring.extend_from_slice(&packet(seed * 10).to_bytes());
        }

        let mut aligner = aligner();
        let status = aligner.align(&mut ring);

        assert_eq!(ring.count(), 0);
        assert_eq!(
            status,
            AlignStatus::Locked {
                recovered: Some(packet(40).to_bytes())
            }
        );
    }

    #[test]
    fn test_not_ready_keeps_progress_across_calls() {
        let mut ring = RingBuffer::new(256);
        let mut aligner = aligner();

        for seed in 0..4 {
            ring.extend_from_slice(&packet(seed).to_bytes());
        }
        assert_eq!(aligner.align(&mut ring), AlignStatus::NotReady);
        assert!(!aligner.is_aligned());

        ring.extend_from_slice(&packet(4).to_bytes());
        assert!(matches!(
            aligner.align(&mut ring),
            AlignStatus::Locked { recovered: Some(_) }
        ));
    }

    #[test]
    fn test_mismatch_resets_phase_counter() {
        let mut ring = RingBuffer::new(256);
        let mut aligner = aligner();
        let mut corrupt = packet(7);
        corrupt.status = 0;

        for seed in 0..4 {
            ring.extend_from_slice(&packet(seed).to_bytes());
        }
        ring.extend_from_slice(&corrupt.to_bytes());
        for seed in 0..4 {
            ring.extend_from_slice(&packet(seed).to_bytes());
        }

        assert_eq!(aligner.align(&mut ring), AlignStatus::NotReady);

        ring.extend_from_slice(&packet(9).to_bytes());
        assert!(matches!(aligner.align(&mut ring), AlignStatus::Locked { .. }));
    }

    #[test]
    fn test_gives_up_after_attempt_ceiling_until_rearmed() {
        let mut ring = RingBuffer::new(256);
        let mut aligner = FrameAligner::new(Signature::default(), 5, 2);

        ring.extend_from_slice(&[0u8; 3 * PACKET_SIZE + 2]);
        assert_eq!(aligner.align(&mut ring), AlignStatus::GaveUp);
        assert_eq!(ring.count(), 2);
        assert_eq!(aligner.align(&mut ring), AlignStatus::GaveUp);
        assert_eq!(ring.count(), 2);

        aligner.rearm();
        assert_eq!(aligner.align(&mut ring), AlignStatus::NotReady);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_mark_misaligned_clears_lock() {
        let mut ring = RingBuffer::new(256);
        let mut aligner = aligner();
        for seed in 0..5 {
            ring.extend_from_slice(&packet(seed).to_bytes());
        }
        aligner.align(&mut ring);
        assert!(aligner.is_aligned());

        aligner.mark_misaligned();
        assert!(!aligner.is_aligned());
        assert_eq!(aligner.attempts(), 0);
    }
}
