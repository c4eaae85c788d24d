//! Gesture remote wire packet
//!
//! # Packet Structure (7 bytes, no padding)
//!
//! ```text
//! [0-1] : Gyro X (i16 little-endian)
//! [2-3] : Gyro Y (i16 little-endian)
//! [4-5] : Gyro Z (i16 little-endian)
//! [6]   : Status byte
//!         bits 7..3: signature, always 0b10101
//!         bit 0: right button
//!         bit 1: left button (middle on some deployments)
//!         bit 2: middle button
//! ```
//!
//! The stream carries no length or escape framing. The signature bits in the
//! status byte are the only thing that marks where a packet ends.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per packet on the wire.
pub const PACKET_SIZE: usize = 7;

/// Offset of the status byte inside a packet.
pub const STATUS_OFFSET: usize = PACKET_SIZE - 1;

/// Default signature: top five bits of the status byte must read `10101`.
pub const DEFAULT_SIGNATURE_PATTERN: u8 = 0b1010_1000;
pub const DEFAULT_SIGNATURE_MASK: u8 = 0b1111_1000;

/// Gyro full-scale range of the remote's firmware, degrees per second.
pub const DEFAULT_GYRO_RANGE_DPS: f32 = 500.0;

/// Signature matcher for status bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub pattern: u8,
    pub mask: u8,
}

impl Default for Signature {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_SIGNATURE_PATTERN,
            mask: DEFAULT_SIGNATURE_MASK,
        }
    }
}

impl Signature {
    #[inline]
    pub fn matches(&self, byte: u8) -> bool {
        byte & self.mask == self.pattern
    }

    /// A pattern with bits outside its mask can never match.
    pub fn is_satisfiable(&self) -> bool {
        self.pattern & !self.mask == 0
    }
}

/// Raw button bits from the status byte.
///
/// Which physical button each bit means is decided by the input mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Buttons {
    pub right: bool,
    pub left: bool,
    pub middle: bool,
}

/// One decoded motion sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Packet {
    pub gyro_x: i16,
    pub gyro_y: i16,
    pub gyro_z: i16,
    pub status: u8,
}

impl Packet {
    pub fn buttons(&self) -> Buttons {
        Buttons {
            right: self.status & 0b001 != 0,
            left: self.status & 0b010 != 0,
            middle: self.status & 0b100 != 0,
        }
    }

    /// Gyro axes scaled to degrees per second for a firmware range of `range` dps.
    pub fn gyro_dps(&self, range: f32) -> [f32; 3] {
        let scale = range / i16::MAX as f32;
        [
            self.gyro_x as f32 * scale,
            self.gyro_y as f32 * scale,
            self.gyro_z as f32 * scale,
        ]
    }

    /// Wire encoding, mainly for captures and tests.
    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let x = self.gyro_x.to_le_bytes();
        let y = self.gyro_y.to_le_bytes();
        let z = self.gyro_z.to_le_bytes();
        [x[0], x[1], y[0], y[1], z[0], z[1], self.status]
    }
}

/// The status byte did not carry the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid packet signature in status byte {status:#04x}")]
pub struct InvalidSignature {
    pub status: u8,
}

/// Stateless decoder for aligned packet spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketDecoder {
    signature: Signature,
}

impl PacketDecoder {
    pub fn new(signature: Signature) -> Self {
        Self { signature }
    }

    pub fn decode(&self, bytes: &[u8; PACKET_SIZE]) -> Result<Packet, InvalidSignature> {
        let status = bytes[STATUS_OFFSET];
        if !self.signature.matches(status) {
            return Err(InvalidSignature { status });
        }

        Ok(Packet {
            gyro_x: i16::from_le_bytes([bytes[0], bytes[1]]),
            gyro_y: i16::from_le_bytes([bytes[2], bytes[3]]),
            gyro_z: i16::from_le_bytes([bytes[4], bytes[5]]),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_little_endian_axes() {
        let bytes = [0x34, 0x12, 0xFF, 0xFF, 0x00, 0x80, 0b1010_1101];
        let packet = PacketDecoder::default().decode(&bytes).unwrap();

        assert_eq!(packet.gyro_x, 0x1234);
        assert_eq!(packet.gyro_y, -1);
        assert_eq!(packet.gyro_z, i16::MIN);
        assert_eq!(packet.status, 0b1010_1101);
    }

    #[test]
    fn test_decode_rejects_bad_signature() {
        let bytes = [0, 0, 0, 0, 0, 0, 0b1110_1000];
        let err = PacketDecoder::default().decode(&bytes).unwrap_err();
        assert_eq!(err.status, 0b1110_1000);
    }

    #[test]
    fn test_button_bits() {
        let packet = Packet {
            status: DEFAULT_SIGNATURE_PATTERN | 0b101,
            ..Default::default()
        };
        let buttons = packet.buttons();
        assert!(buttons.right);
        assert!(!buttons.left);
        assert!(buttons.middle);
    }

    #[test]
    fn test_gyro_dps_full_scale() {
        let packet = Packet {
            gyro_x: i16::MAX,
            gyro_y: 0,
            gyro_z: -i16::MAX,
            status: DEFAULT_SIGNATURE_PATTERN,
        };
        let [x, y, z] = packet.gyro_dps(DEFAULT_GYRO_RANGE_DPS);
        assert!((x - 500.0).abs() < 1e-3);
        assert_eq!(y, 0.0);
        assert!((z + 500.0).abs() < 1e-3);
    }

    #[test]
    fn test_custom_signature() {
        let decoder = PacketDecoder::new(Signature {
            pattern: 0xA0,
            mask: 0xF0,
        });
        assert!(decoder.decode(&[0, 0, 0, 0, 0, 0, 0xAF]).is_ok());
        assert!(decoder.decode(&[0, 0, 0, 0, 0, 0, 0xB0]).is_err());
        assert!(!Signature { pattern: 0x0F, mask: 0xF0 }.is_satisfiable());
    }
}
