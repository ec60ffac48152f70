//! Access-token negotiation against the GraphQL endpoint.
//!
//! A fresh browser session carries no API credentials. The web app
//! provisions a temporary user by accepting the terms of service for a
//! logged-out viewer; the response to that mutation carries the bearer
//! token the streaming gateway expects.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::TokenError;
use crate::session::Session;

/// Warm-up queries the web app issues before accepting the terms.
/// Responses are discarded.
const PREP_DOC_IDS: [&str; 3] = [
    "71a9538c7cb4b536f0b59bd14130535e",
    "9ddc0d27be6b8029c988ca2d4d1f2725",
    "c204727df77cb2e34332f8ac2b6832e7",
];

/// Mutation that accepts the terms for a logged-out viewer and returns
/// the temporary-user access token.
const TOS_DOC_ID: &str = "ddce908d24ed917753b713f3b2e377c1";

/// Fixed date of birth submitted with the acceptance.
const DATE_OF_BIRTH: &str = "1999-01-01";

/// Pause between GraphQL calls so server-side visitor state settles.
const SETTLE: Duration = Duration::from_millis(300);

// ---------------------------------------------------------------------------
// Negotiated credentials
// ---------------------------------------------------------------------------

/// Credentials returned by a successful negotiation.
#[derive(Clone)]
pub(crate) struct Negotiated {
    pub(crate) access_token: String,
    pub(crate) user_id: Option<String>,
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiated")
            .field("access_token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Negotiator
// ---------------------------------------------------------------------------

pub(crate) struct TokenNegotiator {
    http: reqwest::Client,
    base_url: String,
    graphql_url: String,
}

impl TokenNegotiator {
    pub(crate) fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let graphql_url = format!("{base_url}/api/graphql");
        Self {
            http,
            base_url,
            graphql_url,
        }
    }

    /// Run the warm-up queries and the terms-of-service mutation,
    /// yielding the temporary-user credentials.
    pub(crate) async fn negotiate(&self, session: &Session) -> Result<Negotiated, TokenError> {
        for doc_id in PREP_DOC_IDS {
            let body = json!({ "doc_id": doc_id, "variables": {} });
            if let Err(err) = self.graphql_request(session, &body).send().await {
                debug!(doc_id, error = %err, "warm-up query failed, continuing");
            }
        }
        tokio::time::sleep(SETTLE).await;

        let body = json!({
            "doc_id": TOS_DOC_ID,
            "variables": { "input": { "dateOfBirth": DATE_OF_BIRTH } },
        });
        let response = self
            .graphql_request(session, &body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: TosResponse = response.json().await?;

        let viewer = parsed
            .data
            .and_then(|data| data.accept_tos)
            .and_then(|accept| accept.viewer)
            .ok_or(TokenError::MissingAccessToken)?;
        let access_token = viewer
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(TokenError::MissingAccessToken)?;

        info!("temporary user provisioned");
        tokio::time::sleep(SETTLE).await;

        Ok(Negotiated {
            access_token,
            user_id: viewer.user_id,
        })
    }

    fn graphql_request(
        &self,
        session: &Session,
        body: &serde_json::Value,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(&self.graphql_url)
            .header("origin", &self.base_url)
            .header("referer", format!("{}/", self.base_url))
            .header("sec-fetch-dest", "empty")
            .header("sec-fetch-mode", "cors")
            .header("sec-fetch-site", "same-origin")
            .json(body);
        if let Some(lsd) = session.get("lsd") {
            request = request.header("x-fb-lsd", lsd);
        }
        request
    }
}

// ---------------------------------------------------------------------------
// Response shape
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TosResponse {
    data: Option<TosData>,
}

#[derive(Deserialize)]
struct TosData {
    #[serde(rename = "acceptTOSForLoggedOut")]
    accept_tos: Option<TosAccept>,
}

#[derive(Deserialize)]
struct TosAccept {
    viewer: Option<TosViewer>,
}

#[derive(Deserialize)]
struct TosViewer {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "abraUserId")]
    user_id: Option<String>,
}
