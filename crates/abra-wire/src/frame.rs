//! Gateway frame codec.
//!
//! The gateway wraps JSON bodies in small fixed binary headers. Outbound
//! there are exactly two frame shapes: a setup frame that binds the
//! socket to a conversation, and a message frame carrying one encoded
//! turn. Inbound frames are opaque; only two markers matter here, the
//! setup acknowledgement and the end-of-response sentinel.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Frame-type byte of the setup frame.
pub const SETUP_FRAME_TYPE: u8 = 0x0f;
/// Frame-type byte of the outbound message frame.
pub const MESSAGE_FRAME_TYPE: u8 = 0x0d;
/// Trailer byte closing the message-frame header.
pub const MESSAGE_FRAME_TRAILER: u8 = 0x80;
/// Byte pair marking end-of-response anywhere in an inbound frame.
pub const END_OF_RESPONSE: [u8; 2] = [0x28, 0x01];
/// Substring acknowledging the setup frame inside an inbound body.
pub const SETUP_ACK_MARKER: &str = "\"code\":200";

/// Build the setup frame binding a socket to `conversation_id`.
///
/// Layout: `[0x0f, 0, 0, body_len, 0, 0]` then a UTF-8 JSON body naming
/// the conversation and declaring the payload type.
pub fn setup_frame(conversation_id: &str) -> Vec<u8> {
    let body = serde_json::json!({
        "x-dgw-app-x-ecto-conversation-id": conversation_id,
        "x-dgw-app-client-payload-type": "PROTO_INSIDE_JSON",
    })
    .to_string();
    debug_assert!(body.len() <= 0xff, "setup body exceeds one length byte");
    let mut frame = Vec::with_capacity(6 + body.len());
    frame.extend_from_slice(&[SETUP_FRAME_TYPE, 0x00, 0x00, body.len() as u8, 0x00, 0x00]);
    frame.extend_from_slice(body.as_bytes());
    frame
}

/// Build the message frame carrying one encoded turn payload.
///
/// Layout: `[0x0d, 0, 0, len_lo, len_hi, 0, 0, 0x80]` then a UTF-8 JSON
/// body with the request id and the payload in base64. The declared
/// little-endian length counts the body plus two bytes of framing
/// overhead, exactly as the upstream parser expects.
pub fn message_frame(request_id: &str, payload: &[u8]) -> Vec<u8> {
    let body = serde_json::json!({
        "req-id": request_id,
        "payload": BASE64.encode(payload),
    })
    .to_string();
    let declared = body.len() + 2;
    debug_assert!(declared <= 0xffff, "message body exceeds two length bytes");
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&[
        MESSAGE_FRAME_TYPE,
        0x00,
        0x00,
        (declared & 0xff) as u8,
        ((declared >> 8) & 0xff) as u8,
        0x00,
        0x00,
        MESSAGE_FRAME_TRAILER,
    ]);
    frame.extend_from_slice(body.as_bytes());
    frame
}

/// Whether an inbound frame acknowledges the setup frame.
pub fn is_setup_ack(frame: &[u8]) -> bool {
    find_subslice(frame, SETUP_ACK_MARKER.as_bytes()).is_some()
}

/// Whether an inbound frame carries the end-of-response sentinel.
pub fn has_end_marker(frame: &[u8]) -> bool {
    find_subslice(frame, &END_OF_RESPONSE).is_some()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
