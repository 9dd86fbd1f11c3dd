//! Short-form GATT UUID expansion
//!
//! Assigned numbers are usually written as 16-bit (`180D`) or 32-bit
//! (`0000180D`) values. They expand into the Bluetooth base UUID, or into a
//! vendor base UUID when a device defines its own namespace.

use crate::error::UuidError;
use uuid::Uuid;

const BASE_BITS: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// The Bluetooth SIG base UUID
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(BASE_BITS);

/// Client Characteristic Configuration descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = from_short(0x2902);

const ZERO_TAIL: &str = "-0000-0000-0000-000000000000";

/// Expand a 16/32-bit assigned number into the Bluetooth base UUID
pub const fn from_short(value: u32) -> Uuid {
    Uuid::from_u128(BASE_BITS | ((value as u128) << 96))
}

/// Expand a full or short-form UUID string against the Bluetooth base UUID
pub fn expand(text: &str) -> Result<Uuid, UuidError> {
    expand_onto(BLUETOOTH_BASE_UUID, text)
}

/// Expand a full or short-form UUID string against a custom base UUID
pub fn expand_with_base(base: &str, text: &str) -> Result<Uuid, UuidError> {
    let base = parse_full(base).ok_or_else(|| UuidError::InvalidBase(base.to_string()))?;
    expand_onto(base, text)
}

fn expand_onto(base: Uuid, text: &str) -> Result<Uuid, UuidError> {
    let text = text.trim();
    if let Some(full) = parse_full(text) {
        return Ok(full);
    }

    let short = text.strip_suffix(ZERO_TAIL).unwrap_or(text);
    if !short.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UuidError::Malformed(text.to_string()));
    }

    // 16-bit values replace characters 4..8 of the base, 32-bit values 0..8
    let mask: u128 = match short.len() {
        4 => 0xFFFF,
        8 => 0xFFFF_FFFF,
        _ => return Err(UuidError::Malformed(text.to_string())),
    };
    let value = u32::from_str_radix(short, 16).map_err(|_| UuidError::Malformed(text.to_string()))?;

    let expanded = (base.as_u128() & !(mask << 96)) | ((value as u128) << 96);
    Ok(Uuid::from_u128(expanded))
}

fn parse_full(text: &str) -> Option<Uuid> {
    // Only the hyphenated 36-character form counts as a full UUID
    if text.len() != 36 {
        return None;
    }
    Uuid::parse_str(text).ok()
}
