//! Shared types for the relay pipeline.

use serde::{Deserialize, Serialize};

use crate::channels::{ChatHandle, MessageRef};

// ── Classification ──────────────────────────────────────────────────

/// A structured "new transition" report pulled out of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Username including the leading `@`.
    pub username: String,
    pub id: String,
    pub action: String,
}

impl Transition {
    /// Fixed template posted to the destination channel.
    pub fn render(&self) -> String {
        format!(
            "🎯 Новый переход!\n\n👤 Пользователь: {} (ID: {})\n💻 Действие: {}",
            self.username, self.id, self.action
        )
    }
}

/// What the relay does with a message.
///
/// Produced by the classifier; exactly one per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    /// Send the text to the destination unchanged.
    ForwardRaw,
    /// Send the transition template to the destination.
    ForwardStructured(Transition),
    /// Forward, then ask the counterpart about `username` and post the profit.
    ForwardWithConversation { username: Option<String> },
    /// Drop silently. Log only.
    Ignore,
}

impl ActionKind {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ForwardRaw => "forward_raw",
            Self::ForwardStructured(_) => "forward_structured",
            Self::ForwardWithConversation { .. } => "forward_with_conversation",
            Self::Ignore => "ignore",
        }
    }
}

// ── Outbound sends ──────────────────────────────────────────────────

/// Where an outbound message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendTarget {
    Destination,
    Counterpart,
    /// Threaded reply to the triggering message, in the chat it came from.
    ReplyToSource,
}

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered(MessageRef),
    Failed(String),
}

/// A send the relay performed while handling a message.
#[derive(Debug, Clone)]
pub struct OutboundSend {
    pub target: SendTarget,
    pub chat: ChatHandle,
    pub text: String,
    pub outcome: SendOutcome,
}

impl OutboundSend {
    pub fn delivered(&self) -> bool {
        matches!(self.outcome, SendOutcome::Delivered(_))
    }
}
