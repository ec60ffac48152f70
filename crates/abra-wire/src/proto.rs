//! Minimal protobuf-style encoding primitives.
//!
//! Only the field shapes the gateway payload actually uses are
//! implemented: varints, length-delimited strings/bytes/sub-messages,
//! and fixed 32-bit floats. No reflection, no schema, no decode path
//! beyond the varint reader used to verify length prefixes.

/// Wire type for varint fields.
pub const WIRE_VARINT: u64 = 0;
/// Wire type for length-delimited fields (strings, bytes, sub-messages).
pub const WIRE_LEN: u64 = 2;
/// Wire type for fixed 32-bit fields.
pub const WIRE_FIXED32: u64 = 5;

/// Append `value` in base-128 varint form: 7 bits per byte, least
/// significant group first, high bit set on every byte except the last.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value > 0x7f {
        buf.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Append a field tag: `(field_number << 3) | wire_type`, as a varint.
pub fn put_tag(buf: &mut Vec<u8>, field: u64, wire_type: u64) {
    put_varint(buf, (field << 3) | wire_type);
}

/// Append a varint field (tag then value).
pub fn put_varint_field(buf: &mut Vec<u8>, field: u64, value: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, value);
}

/// Append a length-delimited UTF-8 string field.
pub fn put_str(buf: &mut Vec<u8>, field: u64, value: &str) {
    put_bytes(buf, field, value.as_bytes());
}

/// Append a length-delimited bytes field: tag, byte-length varint, bytes.
pub fn put_bytes(buf: &mut Vec<u8>, field: u64, value: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Append an already-encoded sub-message as a length-delimited field.
///
/// Identical on the wire to [`put_bytes`]; kept separate so call sites
/// read like the schema they reproduce.
pub fn put_message(buf: &mut Vec<u8>, field: u64, body: &[u8]) {
    put_bytes(buf, field, body);
}

/// Append a fixed 4-byte little-endian IEEE 754 float field.
pub fn put_float(buf: &mut Vec<u8>, field: u64, value: f32) {
    put_tag(buf, field, WIRE_FIXED32);
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Read a varint from the front of `bytes`. Returns the value and the
/// number of bytes consumed, or `None` on truncated input or a varint
/// wider than 64 bits.
pub fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if i == 10 {
            return None;
        }
        value |= u64::from(b & 0x7f) << (7 * i as u32);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
