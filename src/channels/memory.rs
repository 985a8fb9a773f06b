//! In-process messenger.
//!
//! Keeps a directory of known chats, records every send attempt, and can be
//! scripted: a chat can be told to answer the next message it receives, or to
//! reject sends. Used to exercise the relay without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;

use crate::channels::{ChatHandle, IncomingMessage, MessageRef, MessageStream, Messenger, SendOptions};
use crate::config::Identity;
use crate::error::ChannelError;

const CHANNEL_NAME: &str = "memory";

/// One recorded send attempt.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat: ChatHandle,
    pub text: String,
    pub options: SendOptions,
    /// `None` when the send was rejected.
    pub delivered: Option<MessageRef>,
}

/// In-process [`Messenger`].
pub struct MemoryMessenger {
    directory: Mutex<HashMap<String, ChatHandle>>,
    sent: Mutex<Vec<SentMessage>>,
    replies: Mutex<HashMap<i64, VecDeque<String>>>,
    failures: Mutex<HashMap<i64, ChannelError>>,
    updates: broadcast::Sender<IncomingMessage>,
    next_message_id: AtomicI64,
    connected: AtomicBool,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            directory: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            updates,
            next_message_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    /// Make `username` resolvable to chat `id`.
    pub async fn register(&self, username: &str, id: i64) -> ChatHandle {
        let name = username.trim_start_matches('@').to_string();
        let handle = ChatHandle::new(id, name.clone());
        self.directory.lock().await.insert(name, handle.clone());
        handle
    }

    /// Queue a reply that `chat` sends back after the next message it receives.
    pub async fn reply_on_next_message(&self, chat: &ChatHandle, text: &str) {
        self.replies
            .lock()
            .await
            .entry(chat.id)
            .or_default()
            .push_back(text.to_string());
    }

    /// Reject every send to `chat` with `error`.
    pub async fn fail_sends_to(&self, chat: &ChatHandle, error: ChannelError) {
        self.failures.lock().await.insert(chat.id, error);
    }

    /// Deliver a message from `sender` in `chat` to subscribers.
    pub fn inject(&self, chat: &ChatHandle, sender: &ChatHandle, text: &str) -> IncomingMessage {
        let message = IncomingMessage::new(self.next_id(), chat.clone(), sender.clone(), text);
        // No subscribers is fine: nobody is listening yet.
        let _ = self.updates.send(message.clone());
        message
    }

    /// Every send attempt so far, in order.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    /// Send attempts addressed to `chat`.
    pub async fn sent_to(&self, chat: &ChatHandle) -> Vec<SentMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| m.chat.id == chat.id)
            .cloned()
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> i64 {
        self.next_message_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MemoryMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resolve_entity(&self, identity: &Identity) -> Result<ChatHandle, ChannelError> {
        let directory = self.directory.lock().await;
        let found = match identity {
            Identity::Username(name) => directory.get(name).cloned(),
            Identity::Id(id) => directory.values().find(|h| h.id == *id).cloned(),
        };
        found.ok_or_else(|| ChannelError::ResolutionFailed {
            identity: identity.to_string(),
            reason: "unknown chat".into(),
        })
    }

    async fn send_message(
        &self,
        chat: &ChatHandle,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageRef, ChannelError> {
        let failure = self.failures.lock().await.get(&chat.id).cloned();
        let result = match failure {
            Some(err) => Err(err),
            None => Ok(MessageRef {
                chat_id: chat.id,
                message_id: self.next_id(),
            }),
        };

        self.sent.lock().await.push(SentMessage {
            chat: chat.clone(),
            text: text.to_string(),
            options,
            delivered: result.as_ref().ok().copied(),
        });

        if result.is_ok() {
            let reply = self
                .replies
                .lock()
                .await
                .get_mut(&chat.id)
                .and_then(VecDeque::pop_front);
            if let Some(reply) = reply {
                self.inject(chat, chat, &reply);
            }
        }

        result
    }

    async fn subscribe(&self, from: &ChatHandle) -> Result<MessageStream, ChannelError> {
        let sender_id = from.id;
        let stream = BroadcastStream::new(self.updates.subscribe()).filter_map(move |item| async move {
            match item {
                Ok(message) if message.sender.id == sender_id => Some(message),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Memory subscriber lagged");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
