//! Gesture Remote BLE Protocol
//!
//! The remote exposes the generic serial-over-BLE service found on HM-10
//! style modules: one service with a single characteristic that streams
//! 7-byte motion packets as notifications.

use anyhow::Result;

/// Serial service UUID (short id 0xFFE0)
pub const SERVICE_UUID: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";

/// Serial data characteristic UUID (short id 0xFFE1) - notifications carry packet bytes
pub const DATA_CHAR_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

/// Bluetooth base UUID with the 16-bit short id zeroed.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG short id into a full UUID.
pub const fn uuid_from_short_id(short: u16) -> u128 {
    BASE_UUID | ((short as u128) << 96)
}

/// Client Characteristic Configuration Descriptor value as read back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyConfig {
    None,
    Notify,
    Indicate,
}

/// Parse a UUID string (with or without dashes) into its 128-bit value
pub fn parse_uuid(uuid_str: &str) -> Result<u128> {
    let uuid_str = uuid_str.replace('-', "");

    if uuid_str.len() != 32 {
        return Err(anyhow::anyhow!("Invalid UUID format"));
    }

    Ok(u128::from_str_radix(&uuid_str, 16)?)
}
