//! Error types, one enum per protocol layer.

use tokio_tungstenite::tungstenite;

/// Errors while acquiring a browsing session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("anti-bot challenge still blocking after {attempts} rounds")]
    ChallengeUnresolved { attempts: u32 },

    #[error("required session token {0:?} not found")]
    MissingToken(&'static str),

    #[error("session http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors while negotiating an access token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("no access token in the negotiation response")]
    MissingAccessToken,

    #[error("token http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors on the gateway WebSocket.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid gateway request: {0}")]
    InvalidRequest(String),

    #[error("gateway websocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("timed out waiting for a gateway response")]
    Timeout,

    #[error("gateway closed before any response text")]
    ClosedWithoutResponse,
}

/// Top-level client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("invalid proxy configuration: {0}")]
    InvalidProxy(reqwest::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_display() {
        let err = SessionError::ChallengeUnresolved { attempts: 2 };
        assert_eq!(
            err.to_string(),
            "anti-bot challenge still blocking after 2 rounds"
        );

        let err = SessionError::MissingToken("datr");
        assert_eq!(err.to_string(), "required session token \"datr\" not found");
    }

    #[test]
    fn token_error_display() {
        let err = TokenError::MissingAccessToken;
        assert_eq!(
            err.to_string(),
            "no access token in the negotiation response"
        );
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(
            TransportError::Timeout.to_string(),
            "timed out waiting for a gateway response"
        );
        assert_eq!(
            TransportError::ClosedWithoutResponse.to_string(),
            "gateway closed before any response text"
        );
    }

    #[test]
    fn client_error_is_transparent_for_layers() {
        let err = ClientError::from(TransportError::Timeout);
        assert_eq!(err.to_string(), "timed out waiting for a gateway response");

        let err = ClientError::from(SessionError::MissingToken("lsd"));
        assert_eq!(err.to_string(), "required session token \"lsd\" not found");
    }

    #[test]
    fn empty_message_display() {
        assert_eq!(ClientError::EmptyMessage.to_string(), "message must not be empty");
    }
}
