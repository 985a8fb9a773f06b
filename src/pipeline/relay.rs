//! Relay engine — executes the classifier's decision for each message.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::channels::{ChatHandle, IncomingMessage, Messenger, SendOptions};
use crate::pipeline::broker::{ConsultResult, ConversationBroker};
use crate::pipeline::rules::Classifier;
use crate::pipeline::types::{ActionKind, OutboundSend, SendOutcome, SendTarget, Transition};

/// Marker prepended to the enrichment produced by the startup self-test.
pub const SELF_TEST_PREFIX: &str = "ТЕСТОВАЯ проверка профита\n";

/// Enrichment posted after a successful consultation (HTML).
pub fn format_enrichment(phrase: &str) -> String {
    format!("<b>💸 Возможный <u>ПРОФИТ: {phrase}</u></b>")
}

/// Result of the startup self-test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfTestOutcome {
    /// Not attempted.
    Skipped(String),
    /// The counterpart did not answer in time.
    NoReply,
    /// The counterpart answered without a conversion phrase.
    NoPhrase,
    /// A phrase was found and a report was sent to the destination.
    Reported { phrase: String, delivered: bool },
    /// Consultation failed at the transport level.
    Failed(String),
}

/// Turns classified messages into outbound sends.
pub struct RelayEngine {
    messenger: Arc<dyn Messenger>,
    classifier: Classifier,
    broker: ConversationBroker,
    destination: ChatHandle,
    counterpart: Option<ChatHandle>,
    consult_timeout: Duration,
}

impl RelayEngine {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        classifier: Classifier,
        destination: ChatHandle,
        counterpart: Option<ChatHandle>,
        consult_timeout: Duration,
    ) -> Self {
        let broker = ConversationBroker::new(Arc::clone(&messenger));
        Self {
            messenger,
            classifier,
            broker,
            destination,
            counterpart,
            consult_timeout,
        }
    }

    pub fn destination(&self) -> &ChatHandle {
        &self.destination
    }

    /// `None` when consultation is disabled.
    pub fn counterpart(&self) -> Option<&ChatHandle> {
        self.counterpart.as_ref()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Classify `msg` and perform the resulting sends.
    ///
    /// Never fails: every send outcome, good or bad, is in the returned list.
    pub async fn handle(&self, msg: &IncomingMessage) -> Vec<OutboundSend> {
        let action = self.classifier.classify(msg);
        info!(
            message_id = msg.id,
            chat = %msg.chat,
            action = action.label(),
            "Handling message"
        );

        match action {
            ActionKind::Ignore => {
                info!(message_id = msg.id, "Message matched no rule, ignoring");
                Vec::new()
            }
            ActionKind::ForwardRaw => vec![self.forward_raw(msg).await],
            ActionKind::ForwardStructured(transition) => {
                vec![self.forward_structured(&transition).await]
            }
            ActionKind::ForwardWithConversation { username } => {
                self.forward_with_conversation(msg, username.as_deref()).await
            }
        }
    }

    async fn forward_raw(&self, msg: &IncomingMessage) -> OutboundSend {
        self.send(
            SendTarget::Destination,
            &self.destination,
            &msg.raw_text,
            SendOptions::default(),
        )
        .await
    }

    async fn forward_structured(&self, transition: &Transition) -> OutboundSend {
        self.send(
            SendTarget::Destination,
            &self.destination,
            &transition.render(),
            SendOptions::default(),
        )
        .await
    }

    async fn forward_with_conversation(
        &self,
        msg: &IncomingMessage,
        username: Option<&str>,
    ) -> Vec<OutboundSend> {
        let mut sends = vec![self.forward_raw(msg).await];

        let Some(username) = username else {
            warn!(message_id = msg.id, "No username in message, skipping consultation");
            return sends;
        };
        let Some(counterpart) = &self.counterpart else {
            warn!(message_id = msg.id, "Consultation disabled, counterpart unresolved");
            return sends;
        };

        let session = self
            .broker
            .open_session(counterpart, username, self.consult_timeout)
            .await;
        sends.push(OutboundSend {
            target: SendTarget::Counterpart,
            chat: counterpart.clone(),
            text: username.to_string(),
            outcome: match session.query {
                Some(sent) => SendOutcome::Delivered(sent),
                None => SendOutcome::Failed(
                    session
                        .result()
                        .map(|r| match r {
                            ConsultResult::TransportError(reason) => reason.clone(),
                            other => other.label().to_string(),
                        })
                        .unwrap_or_default(),
                ),
            },
        });

        let reply = match session.result() {
            Some(ConsultResult::Replied(text)) => text,
            Some(other) => {
                info!(message_id = msg.id, outcome = other.label(), "No enrichment");
                return sends;
            }
            None => return sends,
        };

        let Some(phrase) = self.classifier.patterns().extract_conversion_phrase(reply) else {
            info!(message_id = msg.id, "Counterpart reply has no conversion phrase");
            debug!(reply = %reply, "Unmatched counterpart reply");
            return sends;
        };

        let enrichment = format_enrichment(&phrase);
        let (to_source, to_destination) = tokio::join!(
            self.send(
                SendTarget::ReplyToSource,
                &msg.chat,
                &enrichment,
                SendOptions::html().replying_to(msg.id),
            ),
            self.send(
                SendTarget::Destination,
                &self.destination,
                &enrichment,
                SendOptions::html(),
            ),
        );
        sends.push(to_source);
        sends.push(to_destination);
        sends
    }

    /// Consult the counterpart about `identity` once and report any profit
    /// to the destination, prefixed with [`SELF_TEST_PREFIX`].
    pub async fn run_self_test(&self, identity: &str, placeholder: &str) -> SelfTestOutcome {
        let Some(counterpart) = &self.counterpart else {
            warn!("Self-test skipped, counterpart unresolved");
            return SelfTestOutcome::Skipped("counterpart unresolved".into());
        };

        let query = format!("@{}", identity.trim_start_matches('@'));
        info!(query = %query, placeholder, "Running startup self-test");

        let reply = match self
            .broker
            .consult(counterpart, &query, self.consult_timeout)
            .await
        {
            ConsultResult::Replied(text) => text,
            ConsultResult::TimedOut => {
                warn!("Self-test: counterpart did not reply");
                return SelfTestOutcome::NoReply;
            }
            ConsultResult::TransportError(reason) => {
                warn!(error = %reason, "Self-test consultation failed");
                return SelfTestOutcome::Failed(reason);
            }
        };

        let Some(phrase) = self.classifier.patterns().extract_conversion_phrase(&reply) else {
            info!("Self-test: reply has no conversion phrase");
            return SelfTestOutcome::NoPhrase;
        };

        let text = format!("{SELF_TEST_PREFIX}{}", format_enrichment(&phrase));
        let sent = self
            .send(SendTarget::Destination, &self.destination, &text, SendOptions::html())
            .await;
        info!(phrase = %phrase, delivered = sent.delivered(), "Self-test finished");
        SelfTestOutcome::Reported {
            phrase,
            delivered: sent.delivered(),
        }
    }

    async fn send(
        &self,
        target: SendTarget,
        chat: &ChatHandle,
        text: &str,
        options: SendOptions,
    ) -> OutboundSend {
        let outcome = match self.messenger.send_message(chat, text, options).await {
            Ok(sent) => {
                debug!(?target, chat = %chat, message_id = sent.message_id, "Sent");
                SendOutcome::Delivered(sent)
            }
            Err(e) if e.is_permission_denied() => {
                warn!(?target, chat = %chat, error = %e, "No permission to send");
                SendOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!(?target, chat = %chat, error = %e, "Send failed");
                SendOutcome::Failed(e.to_string())
            }
        };

        OutboundSend {
            target,
            chat: chat.clone(),
            text: text.to_string(),
            outcome,
        }
    }
}
