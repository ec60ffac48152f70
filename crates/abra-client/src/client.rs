//! Top-level client tying session, token, and transport together.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::redirect::Policy;
use tracing::{debug, warn};
use uuid::Uuid;

use abra_wire::TurnContext;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::session::{self, HeadlessBackend, Session, SessionBackend};
use crate::token::{Negotiated, TokenNegotiator};
use crate::transport::TransportSession;
use crate::{PromptOptions, PromptResponse};

/// Timeout for page and GraphQL calls. The streamed answer has its own
/// timeout in the transport.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Conversation {
    id: String,
    established: bool,
}

impl Conversation {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            established: false,
        }
    }
}

/// Client for the conversational service.
///
/// Holds one conversation at a time: [`AbraClient::prompt`] with default
/// options continues it, and `new_conversation` or
/// [`AbraClient::reset_conversation`] starts over.
pub struct AbraClient {
    config: ClientConfig,
    backend: Box<dyn SessionBackend>,
    negotiator: TokenNegotiator,
    transport: TransportSession,
    session: Option<Session>,
    credentials: Option<Negotiated>,
    conversation: Option<Conversation>,
}

impl AbraClient {
    /// Build a client from configuration. Fails only on an unusable
    /// proxy URL.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let proxy = config
            .proxy
            .as_deref()
            .map(reqwest::Proxy::all)
            .transpose()
            .map_err(ClientError::InvalidProxy)?;

        let jar = Arc::new(Jar::default());
        let http = build_http(&config, &jar, proxy.clone(), Policy::limited(5));
        let http_no_redirect = build_http(&config, &jar, proxy, Policy::none());

        let backend = HeadlessBackend::new(
            http.clone(),
            http_no_redirect,
            jar,
            config.base_url.clone(),
            config.cache_path.clone(),
        );
        let negotiator = TokenNegotiator::new(http, config.base_url.clone());
        let transport = TransportSession::new(
            config.gateway_url.clone(),
            config.base_url.clone(),
            config.user_agent.clone(),
            config.response_timeout,
        );

        Ok(Self {
            config,
            backend: Box::new(backend),
            negotiator,
            transport,
            session: None,
            credentials: None,
            conversation: None,
        })
    }

    /// Send one message and wait for the complete answer.
    ///
    /// Transient failures are retried up to `max_attempts`, with the
    /// access token renegotiated between attempts.
    pub async fn prompt(
        &mut self,
        message: &str,
        options: PromptOptions,
    ) -> Result<PromptResponse, ClientError> {
        if message.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if options.new_conversation {
            self.conversation = None;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_turn(message).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < max_attempts => {
                    warn!(attempt, error = %err, "turn failed, renegotiating before retry");
                    self.credentials = None;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Forget the current conversation; the next prompt starts fresh.
    pub fn reset_conversation(&mut self) {
        self.conversation = None;
    }

    /// Id of the active conversation, if one has been started.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation.as_ref().map(|c| c.id.as_str())
    }

    async fn try_turn(&mut self, message: &str) -> Result<PromptResponse, ClientError> {
        let credentials = self.ensure_ready().await?;

        let conversation = self.conversation.get_or_insert_with(Conversation::new);
        let conversation_id = conversation.id.clone();
        let request_id = Uuid::new_v4().to_string();

        let context = TurnContext {
            conversation_id: conversation_id.clone(),
            request_id: request_id.clone(),
            offline_threading_id: abra_wire::offline_threading_id(),
            user_id: credentials.user_id.clone().unwrap_or_default(),
            message_text: message.to_string(),
            user_agent: self.config.user_agent.clone(),
            locale: self.config.locale.clone(),
            timezone: self.config.timezone.clone(),
            ..TurnContext::stamped()
        };
        let payload = abra_wire::encode_turn(&context);

        debug!(conversation = %conversation_id, "sending turn");
        let answer = self
            .transport
            .run_turn(
                &conversation_id,
                &request_id,
                &payload,
                &credentials.access_token,
            )
            .await?;

        if let Some(conversation) = &mut self.conversation {
            conversation.established = true;
        }
        Ok(PromptResponse {
            message: answer,
            sources: Vec::new(),
            media: Vec::new(),
        })
    }

    /// Make sure a usable session and access token exist, returning the
    /// credentials for this turn.
    ///
    /// An established conversation keeps its session even past the
    /// validity window.
    async fn ensure_ready(&mut self) -> Result<Negotiated, ClientError> {
        let now = session::unix_millis();
        let established = self.conversation.as_ref().is_some_and(|c| c.established);

        let session = match self.session.take() {
            Some(session) if session.is_valid(now) || established => session,
            _ => {
                self.credentials = None;
                self.backend.acquire(false).await?
            }
        };

        let credentials = match self.credentials.clone() {
            Some(credentials) => credentials,
            None => match self.negotiator.negotiate(&session).await {
                Ok(negotiated) => {
                    self.credentials = Some(negotiated.clone());
                    negotiated
                }
                Err(err) => {
                    // Only the token call failed; the session stays usable.
                    self.session = Some(session);
                    return Err(err.into());
                }
            },
        };

        self.session = Some(session);
        Ok(credentials)
    }
}

fn build_http(
    config: &ClientConfig,
    jar: &Arc<Jar>,
    proxy: Option<reqwest::Proxy>,
    redirect: Policy,
) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .cookie_provider(jar.clone())
        .user_agent(config.user_agent.as_str())
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(HTTP_TIMEOUT)
        .redirect(redirect);
    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }
    builder.build().expect("failed to build HTTP client")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const PAGE: &str = r#"<script>{"datr":{"value":"DATR-E2E","expires":1},["LSD",[],{"token":"LSD-E2E"}]}</script>"#;

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    fn token_response() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "acceptTOSForLoggedOut": {
                    "viewer": { "accessToken": "TOKEN-E2E", "abraUserId": "USER-E2E" }
                }
            }
        }))
    }

    /// Serve one full turn: setup, ack, turn frame, answer, close. The
    /// conversation id the client claimed is pushed into `seen`.
    async fn serve_turn(stream: TcpStream, seen: Arc<StdMutex<Vec<String>>>) {
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();

        let setup = socket.next().await.unwrap().unwrap().into_data();
        assert_eq!(setup[0], 0x0f);
        let setup_body: serde_json::Value = serde_json::from_slice(&setup[6..]).unwrap();
        let conversation = setup_body["x-dgw-app-x-ecto-conversation-id"]
            .as_str()
            .unwrap()
            .to_string();
        seen.lock().unwrap().push(conversation.clone());

        socket
            .send(Message::Text(r#"{"status":{"code":200}}"#.into()))
            .await
            .unwrap();

        let turn = socket.next().await.unwrap().unwrap().into_data();
        assert_eq!(turn[0], 0x0d);
        let turn_body: serde_json::Value = serde_json::from_slice(&turn[8..]).unwrap();
        let payload = BASE64
            .decode(turn_body["payload"].as_str().unwrap())
            .unwrap();
        assert!(contains(&payload, b"mock question"));
        assert!(contains(&payload, conversation.as_bytes()));

        let mut frame = Vec::from(&br#""GenAIMarkdownTextUXPrimitive","text":"mock answer""#[..]);
        frame.extend_from_slice(&[0x28, 0x01]);
        socket.send(Message::Binary(frame.into())).await.unwrap();

        while let Some(Ok(message)) = socket.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    }

    /// Local gateway accepting any number of turns. With `fail_first`
    /// the first connection is dropped before the handshake finishes.
    async fn spawn_gateway(seen: Arc<StdMutex<Vec<String>>>, fail_first: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut failed_once = !fail_first;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                if !failed_once {
                    failed_once = true;
                    drop(stream);
                    continue;
                }
                let seen = seen.clone();
                tokio::spawn(serve_turn(stream, seen));
            }
        });
        url
    }

    #[tokio::test]
    async fn prompt_reuses_the_conversation_until_reset() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(token_response())
            .expect(4)
            .mount(&server)
            .await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let gateway_url = spawn_gateway(seen.clone(), false).await;

        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            base_url: server.uri(),
            gateway_url,
            cache_path: dir.path().join("cookies.json"),
            response_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        };

        let mut client = AbraClient::new(config).unwrap();
        let first = client
            .prompt("mock question", PromptOptions::default())
            .await
            .unwrap();
        assert_eq!(first.message, "mock answer");
        assert!(first.sources.is_empty());
        assert!(first.media.is_empty());
        assert!(client.conversation_id().is_some());

        let second = client
            .prompt("mock question", PromptOptions::default())
            .await
            .unwrap();
        assert_eq!(second.message, "mock answer");

        let third = client
            .prompt(
                "mock question",
                PromptOptions {
                    new_conversation: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(third.message, "mock answer");

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 3);
            assert_eq!(seen[0], seen[1]);
            assert_ne!(seen[1], seen[2]);
        }

        client.reset_conversation();
        assert!(client.conversation_id().is_none());
    }

    #[tokio::test]
    async fn failed_turn_retries_with_a_fresh_token() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(token_response())
            .expect(8)
            .mount(&server)
            .await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let gateway_url = spawn_gateway(seen.clone(), true).await;

        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            base_url: server.uri(),
            gateway_url,
            cache_path: dir.path().join("cookies.json"),
            response_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(50),
            ..ClientConfig::default()
        };

        let mut client = AbraClient::new(config).unwrap();
        let reply = client
            .prompt("mock question", PromptOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.message, "mock answer");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&server)
            .await;
        // One negotiation per attempt: the token is discarded before
        // every retry.
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(token_response())
            .expect(12)
            .mount(&server)
            .await;

        // A gateway that drops every connection before the handshake.
        let connects = Arc::new(AtomicUsize::new(0));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_url = format!("ws://{}", listener.local_addr().unwrap());
        {
            let connects = connects.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    connects.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                }
            });
        }

        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            base_url: server.uri(),
            gateway_url,
            cache_path: dir.path().join("cookies.json"),
            response_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(10),
            max_attempts: 3,
            ..ClientConfig::default()
        };

        let mut client = AbraClient::new(config).unwrap();
        let err = client
            .prompt("mock question", PromptOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn expired_session_is_kept_while_the_conversation_is_open() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(token_response())
            .expect(4)
            .mount(&server)
            .await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let gateway_url = spawn_gateway(seen.clone(), false).await;

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cookies.json");
        let config = ClientConfig {
            base_url: server.uri(),
            gateway_url,
            cache_path: cache_path.clone(),
            response_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        };

        let mut client = AbraClient::new(config).unwrap();
        let first = client
            .prompt("mock question", PromptOptions::default())
            .await
            .unwrap();
        assert_eq!(first.message, "mock answer");

        // Expire the in-memory session mid-conversation and drop the
        // disk cache; a re-acquisition would now have to hit the
        // landing page and rewrite the cache file.
        client.session.as_mut().unwrap().expires_at = 0;
        std::fs::remove_file(&cache_path).unwrap();

        let second = client
            .prompt("mock question", PromptOptions::default())
            .await
            .unwrap();
        assert_eq!(second.message, "mock answer");
        assert!(!cache_path.exists());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn failed_negotiation_keeps_the_session() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&server)
            .await;
        // The whole first negotiation fails; the one after the failed
        // prompt succeeds.
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(4)
            .expect(4)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(token_response())
            .expect(4)
            .mount(&server)
            .await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let gateway_url = spawn_gateway(seen.clone(), false).await;

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cookies.json");
        let config = ClientConfig {
            base_url: server.uri(),
            gateway_url,
            cache_path: cache_path.clone(),
            response_timeout: Duration::from_secs(5),
            max_attempts: 1,
            ..ClientConfig::default()
        };

        let mut client = AbraClient::new(config).unwrap();
        let err = client
            .prompt("mock question", PromptOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Token(_)));

        // Drop the disk cache; if the failed negotiation had discarded
        // the in-memory session, the next prompt would have to hit the
        // landing page and rewrite the cache file.
        std::fs::remove_file(&cache_path).unwrap();

        let reply = client
            .prompt("mock question", PromptOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.message, "mock answer");
        assert!(!cache_path.exists());
    }

    #[tokio::test]
    async fn empty_messages_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            gateway_url: "ws://127.0.0.1:9".to_string(),
            cache_path: dir.path().join("unused.json"),
            ..ClientConfig::default()
        };
        let mut client = AbraClient::new(config).unwrap();

        let err = client
            .prompt("   ", PromptOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::EmptyMessage));
    }
}
