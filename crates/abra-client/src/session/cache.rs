//! On-disk session cache.
//!
//! One JSON file holding the cookie map and its validity window. The
//! format matches what the web client's own persistence writes, so the
//! file is interchangeable with caches produced by other tooling:
//! `{"cookies": {...}, "timestamp": ms, "expiresAt": ms}`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Session;

/// Sessions are trusted for one day from acquisition.
pub(crate) const SESSION_TTL_MS: u64 = 86_400_000;

#[derive(Serialize, Deserialize)]
struct CacheFile {
    cookies: HashMap<String, String>,
    timestamp: u64,
    #[serde(rename = "expiresAt")]
    expires_at: u64,
}

/// Load a cached session if one exists and is still usable at `now_ms`.
/// Unreadable, expired, or incomplete caches are deleted on sight.
pub(crate) fn load(path: &Path, now_ms: u64) -> Option<Session> {
    let raw = fs::read_to_string(path).ok()?;
    let parsed: CacheFile = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "discarding unreadable session cache");
            let _ = fs::remove_file(path);
            return None;
        }
    };
    let session = Session {
        cookies: parsed.cookies,
        acquired_at: parsed.timestamp,
        expires_at: parsed.expires_at,
    };
    if !session.is_valid(now_ms) {
        debug!(path = %path.display(), "discarding expired session cache");
        let _ = fs::remove_file(path);
        return None;
    }
    Some(session)
}

/// Persist a session for the next run, overwriting any previous cache.
pub(crate) fn store(path: &Path, session: &Session) -> std::io::Result<()> {
    let file = CacheFile {
        cookies: session.cookies.clone(),
        timestamp: session.acquired_at,
        expires_at: session.expires_at,
    };
    fs::write(path, serde_json::to_string_pretty(&file)?)
}
