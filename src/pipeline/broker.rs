//! Conversation broker — one request, one reply, bounded by a deadline.
//!
//! The broker subscribes to the counterpart before sending, so a reply that
//! arrives immediately is never missed. Consultations with one counterpart
//! are exclusive: a second caller waits until the first has its reply (or
//! its deadline), so every reply is consumed by exactly one consultation.
//! Transport faults are reported as values and never propagate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::channels::{ChatHandle, MessageRef, Messenger, SendOptions, await_reply};

/// Outcome of a consultation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsultResult {
    /// The counterpart answered with this text.
    Replied(String),
    /// No reply before the deadline.
    TimedOut,
    /// Sending or receiving failed.
    TransportError(String),
}

impl ConsultResult {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied(_) => "replied",
            Self::TimedOut => "timed_out",
            Self::TransportError(_) => "transport_error",
        }
    }
}

/// Lifecycle of a consultation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Resolved(ConsultResult),
}

/// A single consultation with the counterpart.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub id: Uuid,
    pub counterpart: ChatHandle,
    pub sent_text: String,
    pub deadline: Duration,
    pub state: SessionState,
    /// The query message, once it was accepted by the transport.
    pub query: Option<MessageRef>,
    opened_at: Instant,
}

impl ConversationSession {
    fn open(counterpart: &ChatHandle, sent_text: &str, deadline: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            counterpart: counterpart.clone(),
            sent_text: sent_text.to_string(),
            deadline,
            state: SessionState::Open,
            query: None,
            opened_at: Instant::now(),
        }
    }

    fn resolve(mut self, result: ConsultResult) -> Self {
        info!(
            outcome = result.label(),
            elapsed_ms = self.opened_at.elapsed().as_millis() as u64,
            "Consultation resolved"
        );
        self.state = SessionState::Resolved(result);
        self
    }

    /// The outcome; `TimedOut` is never reported for an open session.
    pub fn result(&self) -> Option<&ConsultResult> {
        match &self.state {
            SessionState::Open => None,
            SessionState::Resolved(result) => Some(result),
        }
    }

    /// Time since the session opened.
    pub fn elapsed(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

/// Sends one message to a counterpart and waits for its reply.
pub struct ConversationBroker {
    messenger: Arc<dyn Messenger>,
    /// One lock per counterpart chat, held for a whole consultation.
    conversations: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ConversationBroker {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            messenger,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    async fn conversation_lock(&self, counterpart: &ChatHandle) -> Arc<Mutex<()>> {
        let mut conversations = self.conversations.lock().await;
        Arc::clone(conversations.entry(counterpart.id).or_default())
    }

    /// Send `outgoing_text` to `counterpart` and wait up to `deadline` for
    /// one reply.
    pub async fn consult(
        &self,
        counterpart: &ChatHandle,
        outgoing_text: &str,
        deadline: Duration,
    ) -> ConsultResult {
        match self.open_session(counterpart, outgoing_text, deadline).await.state {
            SessionState::Resolved(result) => result,
            SessionState::Open => ConsultResult::TransportError("session left open".into()),
        }
    }

    /// Like [`consult`](Self::consult), but returns the whole resolved
    /// session, including the query's message reference.
    ///
    /// The deadline starts once the session owns the counterpart; time spent
    /// queued behind another consultation does not count against it.
    pub async fn open_session(
        &self,
        counterpart: &ChatHandle,
        outgoing_text: &str,
        deadline: Duration,
    ) -> ConversationSession {
        let session = ConversationSession::open(counterpart, outgoing_text, deadline);
        let span = info_span!(
            "consultation",
            session = %session.id,
            counterpart = %counterpart,
        );
        let lock = self.conversation_lock(counterpart).await;
        async move {
            let _exclusive = lock.lock().await;
            debug!("Counterpart conversation acquired");
            self.run(session).await
        }
        .instrument(span)
        .await
    }

    async fn run(&self, mut session: ConversationSession) -> ConversationSession {
        let mut replies = match self.messenger.subscribe(&session.counterpart).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Could not listen for counterpart replies");
                return session.resolve(ConsultResult::TransportError(e.to_string()));
            }
        };

        match self
            .messenger
            .send_message(&session.counterpart, &session.sent_text, SendOptions::default())
            .await
        {
            Ok(sent) => {
                debug!(message_id = sent.message_id, text = %session.sent_text, "Query sent to counterpart");
                session.query = Some(sent);
            }
            Err(e) => {
                warn!(error = %e, "Could not send query to counterpart");
                return session.resolve(ConsultResult::TransportError(e.to_string()));
            }
        }

        let result = match await_reply(&mut replies, session.deadline).await {
            Ok(Some(reply)) => ConsultResult::Replied(reply.raw_text),
            Ok(None) => {
                warn!(deadline_secs = session.deadline.as_secs_f64(), "No reply from counterpart in time");
                ConsultResult::TimedOut
            }
            Err(e) => {
                warn!(error = %e, "Counterpart subscription failed while waiting");
                ConsultResult::TransportError(e.to_string())
            }
        };
        session.resolve(result)
    }
}
