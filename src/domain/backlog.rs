//! Latency cap for bursty notification delivery.
//!
//! When more whole packets are queued than `max_backlog`, the oldest ones are
//! dropped so the newest sample is decoded next.

use super::packet::PACKET_SIZE;
use super::ring_buffer::RingBuffer;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct BacklogGovernor {
    max_backlog: usize,
}

impl BacklogGovernor {
    pub fn new(max_backlog: usize) -> Self {
        Self {
            max_backlog: max_backlog.max(1),
        }
    }

    #[cfg(test)]
    pub fn max_backlog(&self) -> usize {
        self.max_backlog
    }

    /// Drop whole packets from the front of an aligned buffer.
    /// Returns the number of bytes dropped.
    pub fn trim(&self, ring: &mut RingBuffer) -> usize {
        let queued = ring.count() / PACKET_SIZE;
        if queued <= self.max_backlog {
            return 0;
        }

        let dropped = ring.discard((queued - self.max_backlog) * PACKET_SIZE);
        debug!(queued, dropped, "Packet backlog trimmed");
        dropped
    }
}
