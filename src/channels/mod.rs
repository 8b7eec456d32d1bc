//! Chat-channel boundary: wire types and the transport trait.
//!
//! The transport itself (webhook vs. long-poll, provider specifics) lives
//! behind [`ChannelSender`]; everything in this module and below is
//! transport-agnostic.

pub mod dedupe;
pub mod limits;
pub mod outbound;
pub mod web;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;
use crate::error::ChannelError;

/// What kind of user interaction produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    Button,
}

/// One inbound user event from the chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub conversation_id: i64,
    pub user_id: String,
    pub kind: EventKind,
    pub payload: String,
}

/// One outbound reply toward the chat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingReply {
    pub conversation_id: i64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<String>,
}

impl OutgoingReply {
    pub fn text(conversation_id: i64, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(
        conversation_id: i64,
        text: impl Into<String>,
        buttons: &[&str],
    ) -> Self {
        Self {
            conversation_id,
            text: text.into(),
            buttons: buttons.iter().map(|b| b.to_string()).collect(),
        }
    }
}

/// Transport seam: delivers one reply to the channel.
///
/// Implementations must surface the platform's throttle signal as
/// [`ChannelError::RateLimited`] so the governor's backoff can honor it.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn deliver(&self, reply: &OutgoingReply) -> Result<(), ChannelError>;
}

/// HTTP sender for a Telegram-style bot API.
pub struct HttpChannelSender {
    client: reqwest::Client,
    send_url: String,
}

impl HttpChannelSender {
    pub fn new(config: &ChannelConfig) -> Result<Self, ChannelError> {
        let token = config
            .bot_token
            .as_ref()
            .ok_or_else(|| ChannelError::StartupFailed {
                reason: "PARCELFLOW_BOT_TOKEN is not set".to_string(),
            })?;
        let client = reqwest::Client::builder()
            .timeout(config.send_timeout)
            .build()?;
        let send_url = format!(
            "{}/bot{}/sendMessage",
            config.api_base_url.trim_end_matches('/'),
            token.expose_secret()
        );
        Ok(Self { client, send_url })
    }
}

#[async_trait]
impl ChannelSender for HttpChannelSender {
    async fn deliver(&self, reply: &OutgoingReply) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(&self.send_url)
            .json(&serde_json::json!({
                "chat_id": reply.conversation_id,
                "text": reply.text,
                "buttons": reply.buttons,
            }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Err(ChannelError::RateLimited { retry_after });
        }
        if !response.status().is_success() {
            return Err(ChannelError::DeliveryFailed {
                conversation_id: reply.conversation_id,
                reason: format!("channel API returned {}", response.status()),
            });
        }
        Ok(())
    }
}
