//! Programmatic client for the meta.ai conversational service.
//!
//! The service only ships a browser UI; this crate reproduces what that
//! UI does over the wire so the model can be prompted from Rust:
//! - Session acquisition through the anti-bot challenge flow, with an
//!   on-disk cookie cache
//! - Access-token negotiation for logged-out use
//! - Turn delivery over the streaming WebSocket gateway
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use abra_client::{AbraClient, ClientConfig, PromptOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = AbraClient::new(ClientConfig::default())?;
//!     let reply = client
//!         .prompt("What is the capital of France?", PromptOptions::default())
//!         .await?;
//!     println!("{}", reply.message);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod session;

mod token;
mod transport;

use serde::{Deserialize, Serialize};

pub use client::AbraClient;
pub use config::{ClientConfig, DEFAULT_USER_AGENT};
pub use error::{ClientError, SessionError, TokenError, TransportError};
pub use session::{Session, SessionBackend};

/// Options for a single prompt call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptOptions {
    /// Drop the current conversation and start a fresh one before
    /// sending this message.
    pub new_conversation: bool,
}

/// One complete model answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResponse {
    /// Final answer text with JSON escapes decoded.
    pub message: String,
    /// Citations attached to the answer.
    pub sources: Vec<Source>,
    /// Generated or referenced media attached to the answer.
    pub media: Vec<Media>,
}

/// Citation attached to an answer. The upstream shape is free-form, so
/// it is carried as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source(pub serde_json::Value);

/// Media item attached to an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}
