//! Wire protocol for the meta.ai streaming gateway.
//!
//! Everything in here is pure byte manipulation with no I/O:
//! - Minimal protobuf-style field encoding
//! - Turn payload construction (one user message per turn)
//! - Gateway frame headers and markers
//! - Inbound frame scanning and escape decoding
//!
//! The upstream schema is undocumented; field numbers and constants were
//! recovered from the browser client and must be reproduced exactly.

pub mod frame;
pub mod proto;
pub mod scan;
pub mod turn;

pub use frame::{has_end_marker, is_setup_ack, message_frame, setup_frame};
pub use scan::{decode_escapes, scan_frame, FrameText};
pub use turn::{encode_turn, offline_threading_id, TurnContext};
