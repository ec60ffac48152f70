//! Session acquisition: cookies and page tokens for the web origin.
//!
//! A session is the minimal browser state needed before any API call:
//! the `datr` device cookie and the `lsd` page token, plus whatever
//! auxiliary tokens the page happens to expose. Acquiring one may mean
//! solving the anti-bot challenge the origin serves to cold visitors.

mod cache;
mod extract;


use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Tokens a session must hold to be usable.
pub const REQUIRED_TOKENS: [&str; 2] = ["datr", "lsd"];

/// Cookie names read back from the jar when the page body lacks them.
const JAR_FALLBACK: [&str; 4] = ["datr", "rd_challenge", "abra_csrf", "_js_datr"];

/// Pause after answering a challenge before re-fetching the page.
const CHALLENGE_SETTLE: Duration = Duration::from_secs(1);
/// Challenge rounds attempted before giving up.
const MAX_CHALLENGE_ROUNDS: u32 = 2;

static CHALLENGE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"fetch\('([^']+)',").unwrap());

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Acquired browser state: the cookie/token map plus its validity window.
#[derive(Clone)]
pub struct Session {
    /// Cookie and page-token values by name.
    pub cookies: HashMap<String, String>,
    /// Unix milliseconds when the session was acquired.
    pub acquired_at: u64,
    /// Unix milliseconds after which the session is stale.
    pub expires_at: u64,
}

impl Session {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Whether every required token is present and non-empty.
    pub fn has_required_tokens(&self) -> bool {
        REQUIRED_TOKENS
            .iter()
            .all(|name| self.cookies.get(*name).is_some_and(|v| !v.is_empty()))
    }

    /// Usable at `now_ms`: unexpired and structurally complete.
    pub fn is_valid(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at && self.has_required_tokens()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Token values identify a device; log names only.
        let mut names: Vec<&str> = self.cookies.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Session")
            .field("cookies", &names)
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of sessions.
///
/// The built-in implementation drives the headless challenge flow for
/// logged-out use; alternative backends (for example a credentialed
/// login) can be swapped in without touching the rest of the client.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Produce a usable session, consulting caches unless `force_refresh`.
    async fn acquire(&self, force_refresh: bool) -> Result<Session, SessionError>;
}

// ---------------------------------------------------------------------------
// Headless backend
// ---------------------------------------------------------------------------

/// Logged-out session acquisition through the anti-bot challenge flow.
pub(crate) struct HeadlessBackend {
    /// Client following redirects, for the post-challenge revisit.
    http: reqwest::Client,
    /// Client surfacing 403s and 3xxs directly, for the first contact.
    http_no_redirect: reqwest::Client,
    jar: Arc<Jar>,
    base_url: String,
    cache_path: PathBuf,
}

impl HeadlessBackend {
    pub(crate) fn new(
        http: reqwest::Client,
        http_no_redirect: reqwest::Client,
        jar: Arc<Jar>,
        base_url: impl Into<String>,
        cache_path: PathBuf,
    ) -> Self {
        Self {
            http,
            http_no_redirect,
            jar,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache_path,
        }
    }

    /// POST the challenge endpoint the blocked page points at. The
    /// response body is irrelevant; the reply sets the clearance cookie.
    async fn answer_challenge(&self, path: &str) -> Result<(), SessionError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_no_redirect
            .post(&url)
            .headers(challenge_headers(&self.base_url))
            .body("")
            .send()
            .await?;
        reject_server_error(&response)?;
        Ok(())
    }

    /// Cookies currently in the jar for the base origin.
    fn jar_cookies(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        let Ok(url) = reqwest::Url::parse(&self.base_url) else {
            return map;
        };
        let Some(header) = self.jar.cookies(&url) else {
            return map;
        };
        let Ok(joined) = header.to_str() else {
            return map;
        };
        for pair in joined.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                map.insert(name.to_string(), value.to_string());
            }
        }
        map
    }

    fn fill_from_jar(&self, cookies: &mut HashMap<String, String>) {
        let from_jar = self.jar_cookies();
        for name in JAR_FALLBACK {
            if !cookies.get(name).is_some_and(|v| !v.is_empty()) {
                if let Some(value) = from_jar.get(name) {
                    cookies.insert(name.to_string(), value.clone());
                }
            }
        }
    }

    /// Push cached cookies back into the live jar so HTTP calls made in
    /// this process carry them.
    fn seed_jar(&self, session: &Session) {
        let Ok(url) = reqwest::Url::parse(&self.base_url) else {
            return;
        };
        for name in JAR_FALLBACK {
            if let Some(value) = session.get(name) {
                self.jar.add_cookie_str(&format!("{name}={value}"), &url);
            }
        }
    }
}

#[async_trait]
impl SessionBackend for HeadlessBackend {
    async fn acquire(&self, force_refresh: bool) -> Result<Session, SessionError> {
        let now = unix_millis();
        if !force_refresh {
            if let Some(session) = cache::load(&self.cache_path, now) {
                debug!(expires_at = session.expires_at, "reusing cached session");
                self.seed_jar(&session);
                return Ok(session);
            }
        }

        let response = self
            .http_no_redirect
            .get(&self.base_url)
            .headers(browser_headers())
            .send()
            .await?;
        reject_server_error(&response)?;
        let mut status = response.status();
        let mut body = response.text().await?;

        let mut rounds = 0;
        while status == StatusCode::FORBIDDEN && rounds < MAX_CHALLENGE_ROUNDS {
            let Some(path) = challenge_path(&body) else {
                warn!("blocked page carries no challenge marker");
                break;
            };
            rounds += 1;
            debug!(round = rounds, path = %path, "answering anti-bot challenge");
            self.answer_challenge(&path).await?;
            tokio::time::sleep(CHALLENGE_SETTLE).await;

            let response = self
                .http
                .get(&self.base_url)
                .headers(revisit_headers(&self.base_url))
                .send()
                .await?;
            reject_server_error(&response)?;
            status = response.status();
            body = response.text().await?;
        }

        if status == StatusCode::FORBIDDEN {
            return Err(SessionError::ChallengeUnresolved { attempts: rounds });
        }

        let mut cookies = extract::extract_tokens(&body);
        self.fill_from_jar(&mut cookies);

        let missing = extract::missing_tokens(&cookies);
        if !missing.is_empty() {
            debug!(tokens = ?missing, "tokens still empty after extraction and jar fallback");
        }

        for name in REQUIRED_TOKENS {
            if !cookies.get(name).is_some_and(|v| !v.is_empty()) {
                return Err(SessionError::MissingToken(name));
            }
        }

        let session = Session {
            cookies,
            acquired_at: now,
            expires_at: now + cache::SESSION_TTL_MS,
        };
        if let Err(e) = cache::store(&self.cache_path, &session) {
            warn!(error = %e, path = %self.cache_path.display(), "failed to write session cache");
        }
        debug!(tokens = session.cookies.len(), "session acquired");
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn challenge_path(body: &str) -> Option<String> {
    CHALLENGE_PATH_RE
        .captures(body)
        .map(|captures| captures[1].to_string())
}

fn reject_server_error(response: &reqwest::Response) -> Result<(), reqwest::Error> {
    if response.status().is_server_error() {
        response.error_for_status_ref()?;
    }
    Ok(())
}

/// Header set mirroring a desktop Chrome top-level navigation. The user
/// agent itself is attached at client construction.
fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "accept",
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8",
        ),
    );
    headers.insert(
        "accept-language",
        HeaderValue::from_static("en-US,en;q=0.9,pt-BR;q=0.8,pt;q=0.7"),
    );
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Linux\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("none"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers.insert(
        "upgrade-insecure-requests",
        HeaderValue::from_static("1"),
    );
    headers.insert("dnt", HeaderValue::from_static("1"));
    headers
}

/// Headers for the challenge POST: same browser identity, but shaped
/// like the page's own `fetch` call.
fn challenge_headers(base_url: &str) -> HeaderMap {
    let mut headers = browser_headers();
    if let Ok(origin) = HeaderValue::from_str(base_url) {
        headers.insert("origin", origin);
    }
    if let Ok(referer) = HeaderValue::from_str(&format!("{base_url}/")) {
        headers.insert("referer", referer);
    }
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    headers
}

/// Headers for the post-challenge revisit, a same-site navigation.
fn revisit_headers(base_url: &str) -> HeaderMap {
    let mut headers = browser_headers();
    if let Ok(referer) = HeaderValue::from_str(&format!("{base_url}/")) {
        headers.insert("referer", referer);
    }
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    headers
}
