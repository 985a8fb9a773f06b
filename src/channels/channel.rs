//! Messenger trait and the message types that cross it.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::Identity;
use crate::error::ChannelError;

/// Stream of incoming messages from one subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A resolved chat, user or channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatHandle {
    pub id: i64,
    /// Human-readable name for logs (username or title).
    pub label: String,
}

impl ChatHandle {
    pub fn new(id: i64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }
}

impl fmt::Display for ChatHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.id)
    }
}

/// Reference to a message that was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Markup applied to outgoing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
}

impl ParseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "HTML",
        }
    }
}

/// Per-send formatting and threading options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub parse_mode: Option<ParseMode>,
    /// Message id (in the target chat) this send replies to.
    pub reply_to: Option<i64>,
}

impl SendOptions {
    /// HTML-formatted send.
    pub fn html() -> Self {
        Self {
            parse_mode: Some(ParseMode::Html),
            reply_to: None,
        }
    }

    /// Thread this send as a reply to `message_id`.
    pub fn replying_to(mut self, message_id: i64) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

/// A message received from the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Platform message id, unique within `chat`.
    pub id: i64,
    /// Chat the message arrived in (where replies go).
    pub chat: ChatHandle,
    /// Who sent it.
    pub sender: ChatHandle,
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(id: i64, chat: ChatHandle, sender: ChatHandle, text: impl Into<String>) -> Self {
        Self {
            id,
            chat,
            sender,
            raw_text: text.into(),
            received_at: Utc::now(),
        }
    }

    /// Set the receive timestamp.
    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Text with surrounding whitespace removed, as used for classification.
    pub fn text(&self) -> &str {
        self.raw_text.trim()
    }
}

/// Messaging platform client.
///
/// Session management, entity lookup and raw send/receive live behind this
/// trait; the relay pipeline only ever talks to it.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Transport name (e.g. "telegram").
    fn name(&self) -> &str;

    /// Establish the session and start receiving updates.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Resolve a configured identity to a chat handle.
    async fn resolve_entity(&self, identity: &Identity) -> Result<ChatHandle, ChannelError>;

    /// Send a text message.
    async fn send_message(
        &self,
        chat: &ChatHandle,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageRef, ChannelError>;

    /// Messages sent by `from`, starting from the moment of subscription.
    async fn subscribe(&self, from: &ChatHandle) -> Result<MessageStream, ChannelError>;

    /// Stop receiving updates.
    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Wait up to `timeout` for the next message on a subscription.
///
/// `Ok(None)` means the deadline passed. A stream that ends is a transport
/// failure.
pub async fn await_reply(
    stream: &mut MessageStream,
    timeout: Duration,
) -> Result<Option<IncomingMessage>, ChannelError> {
    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(message)) => Ok(Some(message)),
        Ok(None) => Err(ChannelError::Disconnected {
            name: "subscription".into(),
            reason: "message stream ended".into(),
        }),
        Err(_) => Ok(None),
    }
}
