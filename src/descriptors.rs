//! Fixed USB descriptor bytes and the literal `READ_STRUCT` payload tables.
//!
//! None of this is computed; it is the constant wire format a real HASP HL
//! 3.25 dongle presents, served verbatim by the transport adapter.

/// 18-byte device descriptor: class 0xFF, max packet 8, VID 0x0529,
/// PID 0x0001, bcdDevice 0x0325, 1 configuration, string indices 1/2.
pub const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 0x01, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x08, 0x29, 0x05, 0x01, 0x00, 0x25, 0x03, 0x01, 0x02,
    0x00, 0x01,
];

/// 18-byte configuration+interface descriptor: 1 interface, 0 endpoints,
/// attributes 0x80, max power 27 (54 / 2).
pub const CONFIGURATION_DESCRIPTOR: [u8; 18] = [
    9, 0x02, 18, 0x00, 1, 1, 0, 0x80, 27, 9, 0x04, 0, 0, 0, 0xFF, 0, 0, 0,
];

/// Language-ID string descriptor: US English (0x0409).
pub const LANGID_STRING_DESCRIPTOR: [u8; 4] = [0x04, 0x03, 0x09, 0x04];

/// Product name, UTF-16LE of `"HASP HL 3.25"`.
pub fn product_name_utf16le() -> Vec<u8> {
    "HASP HL 3.25"
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect()
}

/// The four literal payloads served by `KEY_FN_READ_STRUCT` (`p1` in
/// `0..=3`); any other `p1` yields no payload.
pub fn read_struct_payload(p1: u16) -> Option<&'static [u8]> {
    match p1 {
        0 => Some(&READ_STRUCT_0),
        1 => Some(&READ_STRUCT_1),
        2 => Some(&READ_STRUCT_2),
        3 => Some(&READ_STRUCT_3),
        _ => None,
    }
}

const READ_STRUCT_0: [u8; 3] = [0x01, 0x00, 0x00];

const READ_STRUCT_1: [u8; 47] = [
    0x3b, 0x07, 0xc4, 0x53, 0x06, 0x01, 0x00, 0x00, 0x02, 0xca, 0x00, 0x0b, 0x00, 0x00, 0x3e, 0xdc,
    0x02, 0x54, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x03, 0x19, 0x22, 0xc3, 0x7b, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x34, 0x00, 0x00, 0x60, 0x00, 0x01, 0x16, 0xe1, 0x00, 0x00, 0x00,
];

const READ_STRUCT_2: [u8; 14] = [
    0x62, 0xE4, 0x95, 0x34, 0x00, 0x00, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x01, 0x00,
];

const READ_STRUCT_3: [u8; 8] = [0x00, 0x01, 0xCC, 0x00, 0x00, 0x00, 0x00, 0x00];
