//! Turn payload construction.
//!
//! One turn carries one user message. The gateway expects a two-part
//! protobuf-style payload: an envelope describing the requesting client
//! and conversation, then the message itself. Field numbers and literal
//! values below are protocol facts recovered from the web client, not
//! tunables; changing any of them breaks the upstream parser.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use uuid::Uuid;

use crate::proto::{put_bytes, put_float, put_message, put_str, put_varint_field};

/// Entry point the web client reports for the home input bar.
pub const ENTRY_POINT: &str = "KADABRA__HOME__UNIFIED_INPUT_BAR";
/// Application id of the meta.ai web surface.
pub const APP_ID: &str = "1522763855472543";
/// Peer kind claimed for the sender.
pub const AGENT_KIND: &str = "HUMAN_AGENT";
/// Client build codename carried in the request context.
pub const CLIENT_CODENAME: &str = "ECTO1";
/// Key-slot label for logged-out web users.
pub const TEMP_USER_KEY: &str = "Abra Web Temp User Key";
/// Reported OS platform.
pub const PLATFORM: &str = "Linux";
/// Input provenance label.
pub const INPUT_SOURCE: &str = "user_input";
/// Reported client surface.
pub const SURFACE: &str = "desktop_web";

/// Capabilities the web client declares on every turn.
pub const CAPABILITIES: [&str; 5] = [
    "stocks",
    "weather",
    "meta_knowledge_search_carousel",
    "meta_catalog_search_carousel",
    "media_gallery",
];

/// Everything that feeds one encoded turn.
///
/// [`encode_turn`] is a pure function of this struct: all clock reads and
/// entropy live in [`TurnContext::stamped`], so tests can build the whole
/// struct literally and get byte-identical output.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: String,
    pub request_id: String,
    pub offline_threading_id: String,
    /// Upstream user id; empty until token negotiation has supplied one.
    pub user_id: String,
    pub message_text: String,
    pub user_agent: String,
    pub locale: String,
    pub timezone: String,
    /// Unix timestamp in seconds stamped on the envelope.
    pub epoch_seconds: u64,
    /// Fresh uuid shared by the envelope and the message key.
    pub message_id: String,
    /// 64 lowercase hex chars. The upstream requires its presence but
    /// never checks its value.
    pub anti_replay_hash: String,
    /// Random nonce in the envelope's second timestamp block.
    pub envelope_nonce: u16,
    /// Random nonce in the message key.
    pub message_nonce: u32,
}

impl TurnContext {
    /// A context with fresh clock and entropy fields and empty identity
    /// fields. Callers fill the identity fields with a struct update.
    pub fn stamped() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            conversation_id: String::new(),
            request_id: String::new(),
            offline_threading_id: String::new(),
            user_id: String::new(),
            message_text: String::new(),
            user_agent: String::new(),
            locale: String::new(),
            timezone: String::new(),
            epoch_seconds: unix_seconds(),
            message_id: Uuid::new_v4().to_string(),
            anti_replay_hash: random_hash(&mut rng),
            envelope_nonce: rng.gen(),
            message_nonce: rng.gen(),
        }
    }
}

/// Threading id scheme the web client uses: unix millis shifted left 22
/// bits, low 22 bits filled with randomness, rendered in decimal.
pub fn offline_threading_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let random: u64 = rand::thread_rng().gen();
    ((millis << 22) | (random & 0x3f_ffff)).to_string()
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn random_hash(rng: &mut impl Rng) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    (0..64).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

/// Encode one turn into the gateway's payload bytes.
pub fn encode_turn(ctx: &TurnContext) -> Vec<u8> {
    // Request context (envelope field 1).
    let mut conversation_ref = Vec::new();
    put_str(&mut conversation_ref, 1, &ctx.conversation_id);

    let mut identity = Vec::new();
    put_str(&mut identity, 1, &ctx.user_id);
    put_str(&mut identity, 2, &ctx.user_id);

    let mut client_meta = Vec::new();
    let mut meta_a = Vec::new();
    put_varint_field(&mut meta_a, 1, 5);
    let mut meta_b = Vec::new();
    put_varint_field(&mut meta_b, 1, 1);
    put_message(&mut client_meta, 3, &meta_a);
    put_message(&mut client_meta, 4, &meta_b);

    let mut hash_block = Vec::new();
    put_str(&mut hash_block, 1, &ctx.anti_replay_hash);
    put_float(&mut hash_block, 2, 1.0);

    let mut context = Vec::new();
    put_str(&mut context, 1, ENTRY_POINT);
    put_str(&mut context, 2, APP_ID);
    put_str(&mut context, 4, &ctx.offline_threading_id);
    put_message(&mut context, 5, &conversation_ref);
    put_varint_field(&mut context, 6, 5);
    put_str(&mut context, 7, AGENT_KIND);
    put_message(&mut context, 8, &identity);
    put_str(&mut context, 10, CLIENT_CODENAME);
    put_str(&mut context, 11, TEMP_USER_KEY);
    put_message(&mut context, 12, &client_meta);
    put_str(&mut context, 13, PLATFORM);
    put_str(&mut context, 14, INPUT_SOURCE);
    put_str(&mut context, 15, &ctx.user_agent);
    put_str(&mut context, 16, SURFACE);
    put_message(&mut context, 19, &hash_block);

    // Envelope (top-level field 1).
    let mut stamp = Vec::new();
    put_varint_field(&mut stamp, 1, ctx.epoch_seconds);
    put_varint_field(&mut stamp, 2, ctx.epoch_seconds);
    put_varint_field(&mut stamp, 3, 6);

    let mut flags = Vec::new();
    put_varint_field(&mut flags, 4, 1);

    let mut second_stamp = Vec::new();
    put_varint_field(&mut second_stamp, 1, ctx.epoch_seconds);
    put_varint_field(&mut second_stamp, 3, u64::from(ctx.envelope_nonce));

    let mut locale_block = Vec::new();
    put_str(&mut locale_block, 2, &ctx.locale);

    let mut uuid_pair = Vec::new();
    put_str(&mut uuid_pair, 1, &ctx.message_id);
    put_str(&mut uuid_pair, 2, &ctx.conversation_id);

    let mut timezone_block = Vec::new();
    put_str(&mut timezone_block, 1, &ctx.timezone);

    let mut envelope = Vec::new();
    put_message(&mut envelope, 1, &context);
    put_message(&mut envelope, 2, &stamp);
    put_message(&mut envelope, 3, &flags);
    put_bytes(&mut envelope, 4, &[]);
    put_message(&mut envelope, 5, &second_stamp);
    put_str(&mut envelope, 6, &ctx.request_id);
    put_bytes(&mut envelope, 7, &[]);
    put_message(&mut envelope, 9, &locale_block);
    put_bytes(&mut envelope, 10, &uuid_pair);
    put_bytes(&mut envelope, 15, &timezone_block);
    for capability in CAPABILITIES {
        let mut flag = Vec::new();
        put_varint_field(&mut flag, 1, 1);
        let mut entry = Vec::new();
        put_str(&mut entry, 1, capability);
        put_message(&mut entry, 2, &flag);
        put_message(&mut envelope, 18, &entry);
    }

    // User message (top-level field 2).
    let mut thread_ref = Vec::new();
    put_str(&mut thread_ref, 1, &ctx.conversation_id);
    put_varint_field(&mut thread_ref, 2, ctx.epoch_seconds);
    put_varint_field(&mut thread_ref, 3, u64::from(ctx.message_nonce));

    let mut message_key = Vec::new();
    put_str(&mut message_key, 1, &ctx.message_id);
    put_message(&mut message_key, 2, &thread_ref);

    let mut user_message = Vec::new();
    put_message(&mut user_message, 1, &message_key);
    put_str(&mut user_message, 2, &ctx.message_text);
    put_bytes(&mut user_message, 4, &[]);

    let mut payload = Vec::new();
    put_message(&mut payload, 1, &envelope);
    put_message(&mut payload, 2, &user_message);
    payload
}
