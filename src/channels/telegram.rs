//! Telegram messenger — talks to the Bot API over HTTPS.
//!
//! A single long-poll loop reads `getUpdates` and fans every text message out
//! on a broadcast channel; `subscribe` filters that fan-out by sender, so the
//! source stream and any number of consultation waits share one poller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::channels::{ChatHandle, IncomingMessage, MessageRef, MessageStream, Messenger, SendOptions};
use crate::config::Identity;
use crate::error::ChannelError;

/// Maximum sendMessage text length, in UTF-16 code units.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout passed to getUpdates, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed poll before trying again.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

const UPDATE_BUFFER: usize = 256;

const CHANNEL_NAME: &str = "telegram";

/// Telegram messenger backed by the Bot API.
pub struct TelegramMessenger {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
    updates: broadcast::Sender<IncomingMessage>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// A failed Bot API call.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ApiFailure {
    /// Bot API `error_code`, or the HTTP status when the body had none.
    code: Option<u16>,
    description: String,
}

impl ApiFailure {
    fn transport(err: reqwest::Error) -> Self {
        Self {
            code: None,
            description: err.to_string(),
        }
    }

    /// The bot lacks rights to post in the target chat.
    fn is_permission_denied(&self) -> bool {
        let description = self.description.to_lowercase();
        self.code == Some(403)
            || description.contains("not enough rights")
            || description.contains("chat_admin_required")
            || description.contains("have no rights")
    }

    fn is_markup_error(&self) -> bool {
        self.code == Some(400) && self.description.to_lowercase().contains("can't parse entities")
    }

    fn into_send_error(self) -> ChannelError {
        if self.is_permission_denied() {
            ChannelError::PermissionDenied {
                name: CHANNEL_NAME.into(),
                reason: self.description,
            }
        } else {
            ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: self.description,
            }
        }
    }
}

impl TelegramMessenger {
    pub fn new(bot_token: SecretString, api_base: impl Into<String>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            bot_token,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            updates,
            poller: Mutex::new(None),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Call a Bot API method and return its `result` field.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ApiFailure> {
        call_api(&self.client, &self.api_url(method), body).await
    }

    /// Send a single message chunk (≤4096 chars).
    ///
    /// HTML that Telegram refuses to parse is retried as plain text.
    async fn send_chunk(
        &self,
        chat_id: i64,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageRef, ChannelError> {
        let body = send_message_body(chat_id, text, options);
        let result = match self.call("sendMessage", &body).await {
            Ok(result) => result,
            Err(failure) if options.parse_mode.is_some() && failure.is_markup_error() => {
                tracing::warn!(
                    chat_id,
                    reason = %failure.description,
                    "Telegram rejected message markup; retrying without parse_mode"
                );
                let plain = SendOptions {
                    parse_mode: None,
                    ..options
                };
                self.call("sendMessage", &send_message_body(chat_id, text, plain))
                    .await
                    .map_err(ApiFailure::into_send_error)?
            }
            Err(failure) => return Err(failure.into_send_error()),
        };

        let message_id = result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChannelError::InvalidMessage("sendMessage result without message_id".into()))?;

        Ok(MessageRef {
            chat_id,
            message_id,
        })
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let url = self.api_url("getUpdates");
        let updates = self.updates.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram messenger listening for updates...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message", "channel_post"]
                });

                let result = match call_api(&client, &url, &body).await {
                    Ok(r) => r,
                    Err(failure) => {
                        tracing::warn!("Telegram poll error: {}", failure.description);
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let Some(batch) = result.as_array() else {
                    continue;
                };

                for update in batch {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(message) = parse_update(update) else {
                        continue;
                    };

                    tracing::debug!(
                        chat = %message.chat,
                        sender = %message.sender,
                        id = message.id,
                        "Telegram update received"
                    );

                    // Err only means nobody is subscribed right now.
                    let _ = updates.send(message);
                }
            }
        })
    }
}

// ── Messenger trait implementation ──────────────────────────────────

#[async_trait]
impl Messenger for TelegramMessenger {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let me = self
            .call("getMe", &serde_json::json!({}))
            .await
            .map_err(|f| ChannelError::StartupFailed {
                name: CHANNEL_NAME.into(),
                reason: f.description,
            })?;

        let username = me.get("username").and_then(Value::as_str).unwrap_or("unknown");
        tracing::info!(bot = %username, "Telegram session established");

        let mut poller = self.poller.lock().await;
        if poller.is_none() {
            *poller = Some(self.spawn_poller());
        }
        Ok(())
    }

    async fn resolve_entity(&self, identity: &Identity) -> Result<ChatHandle, ChannelError> {
        let chat_id = match identity {
            Identity::Username(name) => Value::String(format!("@{name}")),
            Identity::Id(id) => Value::from(*id),
        };

        let chat = self
            .call("getChat", &serde_json::json!({ "chat_id": chat_id }))
            .await
            .map_err(|f| ChannelError::ResolutionFailed {
                identity: identity.to_string(),
                reason: f.description,
            })?;

        let id = chat
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChannelError::ResolutionFailed {
                identity: identity.to_string(),
                reason: "getChat result without id".into(),
            })?;

        Ok(ChatHandle::new(id, chat_label(&chat, id)))
    }

    async fn send_message(
        &self,
        chat: &ChatHandle,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageRef, ChannelError> {
        // Markup can't be split safely; only plain text is chunked.
        if options.parse_mode.is_some() {
            return self.send_chunk(chat.id, text, options).await;
        }

        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let mut last = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let chunk_options = if i == 0 {
                options
            } else {
                SendOptions {
                    reply_to: None,
                    ..options
                }
            };
            last = Some(self.send_chunk(chat.id, chunk, chunk_options).await?);
        }

        last.ok_or_else(|| ChannelError::InvalidMessage("message produced no chunks".into()))
    }

    async fn subscribe(&self, from: &ChatHandle) -> Result<MessageStream, ChannelError> {
        let sender_id = from.id;
        let stream = BroadcastStream::new(self.updates.subscribe()).filter_map(move |item| async move {
            match item {
                Ok(message) if message.sender.id == sender_id => Some(message),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Telegram subscriber lagged behind updates");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.abort();
        }
        tracing::info!("Telegram messenger shutting down");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn call_api(client: &reqwest::Client, url: &str, body: &Value) -> Result<Value, ApiFailure> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(ApiFailure::transport)?;

    let status = resp.status();
    let data: Value = resp.json().await.map_err(|e| ApiFailure {
        code: Some(status.as_u16()),
        description: format!("unreadable response: {e}"),
    })?;

    if data.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(data.get("result").cloned().unwrap_or(Value::Null));
    }

    let code = data
        .get("error_code")
        .and_then(Value::as_u64)
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(status.as_u16());
    let description = data
        .get("description")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("request failed with {status}"));

    Err(ApiFailure {
        code: Some(code),
        description,
    })
}

fn send_message_body(chat_id: i64, text: &str, options: SendOptions) -> Value {
    let mut body = serde_json::json!({
        "chat_id": chat_id,
        "text": text,
    });
    if let Some(mode) = options.parse_mode {
        body["parse_mode"] = Value::String(mode.as_str().to_string());
    }
    if let Some(reply_to) = options.reply_to {
        body["reply_parameters"] = serde_json::json!({
            "message_id": reply_to,
            "allow_sending_without_reply": true
        });
    }
    body
}

/// Convert a `getUpdates` entry into an incoming message.
///
/// Only text messages and channel posts are relayed; everything else
/// (stickers, edits, service messages) yields `None`.
fn parse_update(update: &Value) -> Option<IncomingMessage> {
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;

    let text = message.get("text").and_then(Value::as_str)?;
    let id = message.get("message_id").and_then(Value::as_i64)?;

    let chat_value = message.get("chat")?;
    let chat_id = chat_value.get("id").and_then(Value::as_i64)?;
    let chat = ChatHandle::new(chat_id, chat_label(chat_value, chat_id));

    // Channel posts have no `from`; the posting chat is the sender.
    let sender = message
        .get("from")
        .or_else(|| message.get("sender_chat"))
        .and_then(|s| {
            let sid = s.get("id").and_then(Value::as_i64)?;
            Some(ChatHandle::new(sid, chat_label(s, sid)))
        })
        .unwrap_or_else(|| chat.clone());

    let mut incoming = IncomingMessage::new(id, chat, sender, text);
    if let Some(sent_at) = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
    {
        incoming = incoming.with_received_at(sent_at);
    }
    Some(incoming)
}

/// Best display name for a chat or user object.
fn chat_label(chat: &Value, id: i64) -> String {
    chat.get("username")
        .and_then(Value::as_str)
        .map(|u| format!("@{u}"))
        .or_else(|| chat.get("title").and_then(Value::as_str).map(String::from))
        .or_else(|| chat.get("first_name").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| id.to_string())
}

/// Split a message into chunks that fit Telegram's length limit.
///
/// Telegram counts UTF-16 code units. Splits after the last newline, then
/// the last space, then hard-cuts on a char boundary. Chunks concatenate back
/// to `text` exactly.
fn split_message(text: &str, max_units: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while utf16_len(remaining) > max_units {
        // Byte offset of the first char that would overflow the limit.
        let mut units = 0;
        let cut = remaining
            .char_indices()
            .find(|(_, c)| {
                units += c.len_utf16();
                units > max_units
            })
            .map_or(remaining.len(), |(i, _)| i);

        // Find a good split point
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .map_or(cut, |i| i + 1);

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }

    if !remaining.is_empty() || chunks.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

// ── Tests ───────────────────────────────────────────────────────────
