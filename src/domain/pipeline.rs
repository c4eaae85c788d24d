//! Per-connection framing pipeline: ring buffer, aligner, backlog governor
//! and decoder wired together in delivery order.

use super::aligner::{AlignStatus, FrameAligner};
use super::backlog::BacklogGovernor;
use super::packet::{Packet, PacketDecoder, Signature, PACKET_SIZE};
use super::ring_buffer::RingBuffer;
use tracing::{debug, trace};

/// Framing knobs, built from [`crate::domain::settings::LinkSettings`].
#[derive(Debug, Clone)]
pub struct FramingConfig {
    pub ring_capacity: usize,
    pub signature: Signature,
    pub hits_to_align: u32,
    pub max_align_attempts: u32,
    pub max_backlog: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 256,
            signature: Signature::default(),
            hits_to_align: 5,
            max_align_attempts: 1000,
            max_backlog: 3,
        }
    }
}

/// Something the pipeline observed while ingesting a payload, in stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    Aligned,
    Packet(Packet),
    Misaligned,
}

pub struct FramePipeline {
    ring: RingBuffer,
    aligner: FrameAligner,
    governor: BacklogGovernor,
    decoder: PacketDecoder,
}

impl FramePipeline {
    pub fn new(config: &FramingConfig) -> Self {
        Self {
            ring: RingBuffer::new(config.ring_capacity),
            aligner: FrameAligner::new(
                config.signature,
                config.hits_to_align,
                config.max_align_attempts,
            ),
            governor: BacklogGovernor::new(config.max_backlog),
            decoder: PacketDecoder::new(config.signature),
        }
    }

    #[cfg(test)]
    pub fn is_aligned(&self) -> bool {
        self.aligner.is_aligned()
    }

    /// Bytes waiting in the ring buffer.
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.ring.count()
    }

    /// Queue one notification payload and decode whatever it completes.
    pub fn ingest(&mut self, payload: &[u8]) -> Vec<FrameEvent> {
        self.ring.extend_from_slice(payload);
        self.aligner.rearm();
        trace!(len = payload.len(), buffered = self.ring.count(), "Payload queued");

        let mut events = Vec::new();
        loop {
            let mut recovered = None;
            if !self.aligner.is_aligned() {
                match self.aligner.align(&mut self.ring) {
                    AlignStatus::Locked { recovered: bytes } => {
                        events.push(FrameEvent::Aligned);
                        recovered = bytes;
                    }
                    AlignStatus::NotReady | AlignStatus::GaveUp => break,
                }
            }

            let dropped = self.governor.trim(&mut self.ring);
            // The lock packet is older than everything still queued; only
            // keep it if nothing newer had to be dropped.
            if let (Some(bytes), 0) = (recovered, dropped) {
                if let Ok(packet) = self.decoder.decode(&bytes) {
                    events.push(FrameEvent::Packet(packet));
                }
            }

            if self.decode_aligned(&mut events) {
                break;
            }
        }
        events
    }

    /// Decode every whole packet in the ring. Returns `false` if a packet
    /// failed its signature check and alignment was dropped.
    fn decode_aligned(&mut self, events: &mut Vec<FrameEvent>) -> bool {
        let mut frame = [0u8; PACKET_SIZE];
        while self.ring.pop_into(&mut frame) {
            match self.decoder.decode(&frame) {
                Ok(packet) => events.push(FrameEvent::Packet(packet)),
                Err(e) => {
                    debug!("{}", e);
                    self.aligner.mark_misaligned();
                    events.push(FrameEvent::Misaligned);
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::packet::DEFAULT_SIGNATURE_PATTERN;

    fn packet(seed: i16) -> Packet {
        Packet {
            gyro_x: seed,
            gyro_y: -seed,
            gyro_z: seed / 2,
            status: DEFAULT_SIGNATURE_PATTERN | (seed as u8 & 0b111),
        }
    }

    fn stream(seeds: std::ops::Range<i16>) -> Vec<u8> {
        seeds.flat_map(|s| packet(s).to_bytes()).collect()
    }

    fn packets(events: &[FrameEvent]) -> Vec<Packet> {
        events
            .iter()
            .filter_map(|e| match e {
                FrameEvent::Packet(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_garbage_then_five_packets_yields_last_packet_first() {
        let mut pipeline = FramePipeline::new(&FramingConfig::default());

        let mut bytes = vec![0x01, 0x02, 0x03, 0x04];
        bytes.extend(stream(1..6));
        let events = pipeline.ingest(&bytes);

        assert_eq!(
            events,
            vec![FrameEvent::Aligned, FrameEvent::Packet(packet(5))]
        );
        assert!(pipeline.is_aligned());

        let events = pipeline.ingest(&packet(6).to_bytes());
        assert_eq!(events, vec![FrameEvent::Packet(packet(6))]);
    }

    #[test]
    fn test_partial_packets_across_payloads() {
        let mut pipeline = FramePipeline::new(&FramingConfig::default());
        pipeline.ingest(&stream(1..6));
        assert!(pipeline.is_aligned());

        let next = stream(6..8);
        assert!(pipeline.ingest(&next[..3]).is_empty());
        assert_eq!(
            packets(&pipeline.ingest(&next[3..10])),
            vec![packet(6)]
        );
        assert_eq!(packets(&pipeline.ingest(&next[10..])), vec![packet(7)]);
        assert_eq!(pipeline.buffered(), 0);
    }

    #[test]
    fn test_corrupt_packet_forces_realignment() {
        let mut pipeline = FramePipeline::new(&FramingConfig::default());
        pipeline.ingest(&stream(1..6));

        let mut corrupt = packet(6).to_bytes();
        corrupt[PACKET_SIZE - 1] ^= 0b1111_1000;
        let events = pipeline.ingest(&corrupt);

        assert_eq!(events, vec![FrameEvent::Misaligned]);
        assert!(!pipeline.is_aligned());

        let events = pipeline.ingest(&stream(7..12));
        assert_eq!(
            events,
            vec![FrameEvent::Aligned, FrameEvent::Packet(packet(11))]
        );
    }

    #[test]
    fn test_one_byte_slip_is_detected_and_recovered() {
        let mut pipeline = FramePipeline::new(&FramingConfig::default());
        pipeline.ingest(&stream(1..6));

        let mut bytes = stream(6..20);
        bytes.remove(2);
        let events = pipeline.ingest(&bytes);

        assert!(events.contains(&FrameEvent::Misaligned));
        assert_eq!(events.last(), Some(&FrameEvent::Packet(packet(19))));
        assert!(pipeline.is_aligned());
    }

    #[test]
    fn test_burst_is_trimmed_to_max_backlog() {
        let config = FramingConfig {
            max_backlog: 3,
            ..Default::default()
        };
        let mut pipeline = FramePipeline::new(&config);
        pipeline.ingest(&stream(1..6));

        let events = pipeline.ingest(&stream(6..16));

        assert_eq!(
            packets(&events),
            vec![packet(13), packet(14), packet(15)]
        );
    }
}
