//! WebSocket transport for one conversational turn.
//!
//! The gateway multiplexes DGW frames over a single socket. A turn is:
//! connect with auth in the query string, bind the conversation with a
//! setup frame, wait for the `"code":200` acknowledgement, send the
//! encoded turn, then fold streamed frames into the final answer text.
//! Each streamed frame carries the full text so far, so a later frame
//! replaces the accumulator instead of appending to it.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use abra_wire::{has_end_marker, is_setup_ack, message_frame, scan_frame, setup_frame, FrameText};

use crate::error::TransportError;

type GatewaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One websocket connection parameter set, reused across turns.
pub(crate) struct TransportSession {
    gateway_url: String,
    origin: String,
    user_agent: String,
    response_timeout: Duration,
}

impl TransportSession {
    pub(crate) fn new(
        gateway_url: impl Into<String>,
        origin: impl Into<String>,
        user_agent: impl Into<String>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            origin: origin.into(),
            user_agent: user_agent.into(),
            response_timeout,
        }
    }

    /// Gateway URL with the DGW handshake parameters in the query
    /// string. The gateway reads auth from the query, not a header, so
    /// the token must survive percent-encoding.
    fn request_url(&self, access_token: &str) -> Result<String, TransportError> {
        let mut url = reqwest::Url::parse(&self.gateway_url)
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("x-dgw-appid", abra_wire::turn::APP_ID)
            .append_pair("x-dgw-appversion", "1.0.0")
            .append_pair("x-dgw-authtype", "15:0")
            .append_pair("x-dgw-version", "5")
            .append_pair("x-dgw-uuid", "0")
            .append_pair("x-dgw-tier", "prod")
            .append_pair("Authorization", access_token)
            .append_pair("x-dgw-app-origin", "meta.ai")
            .append_pair("x-dgw-app-clippy-request-id", &Uuid::new_v4().to_string());
        Ok(url.into())
    }

    /// Connect, run one turn, and return the final answer text.
    ///
    /// The response timeout bounds the whole turn, connection and
    /// upgrade handshake included. A timeout with partial text yields
    /// that text; a timeout with nothing accumulated is an error.
    pub(crate) async fn run_turn(
        &self,
        conversation_id: &str,
        request_id: &str,
        payload: &[u8],
        access_token: &str,
    ) -> Result<String, TransportError> {
        let url = self.request_url(access_token)?;
        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Origin",
            HeaderValue::from_str(&self.origin)
                .map_err(|err| TransportError::InvalidRequest(err.to_string()))?,
        );
        headers.insert(
            "User-Agent",
            HeaderValue::from_str(&self.user_agent)
                .map_err(|err| TransportError::InvalidRequest(err.to_string()))?,
        );

        debug!(conversation = %conversation_id, request = %request_id, "connecting to gateway");
        let mut answer = String::new();
        let turn = async {
            let (mut socket, _) = connect_async(request).await?;
            socket
                .send(Message::Binary(setup_frame(conversation_id).into()))
                .await?;
            drive(&mut socket, &mut answer, request_id, payload).await
        };
        let outcome = tokio::time::timeout(self.response_timeout, turn).await;
        match outcome {
            Ok(Ok(())) => Ok(answer),
            Ok(Err(err)) => Err(err),
            Err(_) if !answer.is_empty() => {
                warn!("gateway response timed out, returning partial text");
                Ok(answer)
            }
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// Pump frames until the answer is complete or the socket ends.
async fn drive(
    socket: &mut GatewaySocket,
    answer: &mut String,
    request_id: &str,
    payload: &[u8],
) -> Result<(), TransportError> {
    let mut acked = false;
    while let Some(next) = socket.next().await {
        let message = match next {
            Ok(message) => message,
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(err) => return Err(TransportError::Ws(err)),
        };
        let frame = match message {
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => other.into_data(),
        };

        if !acked {
            if is_setup_ack(&frame) {
                acked = true;
                socket
                    .send(Message::Binary(message_frame(request_id, payload).into()))
                    .await?;
                debug!("gateway acknowledged setup, turn sent");
            }
            continue;
        }

        match scan_frame(&frame) {
            FrameText::Primary(text) => *answer = text,
            FrameText::SideChannel => debug!("side-channel frame skipped"),
            FrameText::Absent => {}
        }
        if !answer.is_empty() && has_end_marker(&frame) {
            socket.close(None).await.ok();
            return Ok(());
        }
    }

    if answer.is_empty() {
        Err(TransportError::ClosedWithoutResponse)
    } else {
        Ok(())
    }
}
