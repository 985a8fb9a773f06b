//! Relay bootstrap: connect, resolve chats, self-test, then serve the source.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinSet;

use crate::channels::{ChatHandle, MessageStream, Messenger};
use crate::config::RelayConfig;
use crate::error::Result;
use crate::pipeline::patterns::PatternLibrary;
use crate::pipeline::relay::{RelayEngine, SelfTestOutcome};
use crate::pipeline::rules::Classifier;

/// A started relay, listening to its source.
pub struct Relay {
    messenger: Arc<dyn Messenger>,
    engine: Arc<RelayEngine>,
    source: ChatHandle,
    stream: MessageStream,
    self_test: Option<SelfTestOutcome>,
}

impl Relay {
    /// Connect and resolve every configured chat.
    ///
    /// Source and destination must resolve; an unresolved counterpart only
    /// disables consultation. The self-test, when enabled, runs before this
    /// returns and never fails startup.
    pub async fn start(config: &RelayConfig, messenger: Arc<dyn Messenger>) -> Result<Self> {
        tracing::info!(session = %config.session_name, transport = messenger.name(), "Starting relay");
        messenger.connect().await?;

        let source = messenger.resolve_entity(&config.source).await?;
        let destination = messenger.resolve_entity(&config.destination).await?;
        let counterpart = match messenger.resolve_entity(&config.counterpart).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(
                    counterpart = %config.counterpart,
                    error = %e,
                    "Counterpart unresolved, consultation disabled"
                );
                None
            }
        };
        tracing::info!(
            source = %source,
            destination = %destination,
            counterpart = counterpart.as_ref().map(ToString::to_string).unwrap_or_default(),
            "Chats resolved"
        );

        let classifier = Classifier::default_rules(PatternLibrary::new(config.id_fallback));
        let engine = Arc::new(RelayEngine::new(
            Arc::clone(&messenger),
            classifier,
            destination,
            counterpart,
            config.consult_timeout,
        ));

        // Listen before the self-test so nothing sent meanwhile is lost.
        let stream = messenger.subscribe(&source).await?;

        let self_test = if !config.self_test.enabled {
            tracing::info!("Self-test disabled");
            None
        } else if let Some(identity) = &config.self_test.identity {
            Some(
                engine
                    .run_self_test(identity, &config.self_test.placeholder)
                    .await,
            )
        } else {
            tracing::warn!("Self-test enabled but RELAY_SELF_TEST_IDENTITY is not set, skipping");
            Some(SelfTestOutcome::Skipped("no identity configured".into()))
        };

        Ok(Self {
            messenger,
            engine,
            source,
            stream,
            self_test,
        })
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    pub fn source(&self) -> &ChatHandle {
        &self.source
    }

    /// Outcome of the startup self-test, if one was attempted.
    pub fn self_test(&self) -> Option<&SelfTestOutcome> {
        self.self_test.as_ref()
    }

    /// Handle source messages until `shutdown` resolves or the stream ends.
    ///
    /// Each message gets its own task so a consultation wait never holds up
    /// the next message. In-flight messages finish before this returns.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tracing::info!(source = %self.source, "Relay ready and listening");

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Message task panicked");
                    }
                }
                msg = self.stream.next() => {
                    let Some(message) = msg else {
                        tracing::info!("Source stream ended");
                        break;
                    };
                    let engine = Arc::clone(&self.engine);
                    tasks.spawn(async move {
                        let sends = engine.handle(&message).await;
                        let failed = sends.iter().filter(|s| !s.delivered()).count();
                        tracing::debug!(
                            message_id = message.id,
                            sends = sends.len(),
                            failed,
                            "Message handled"
                        );
                    });
                }
            }
        }

        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "Waiting for in-flight messages");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Message task panicked");
            }
        }

        self.messenger.shutdown().await?;
        tracing::info!("Relay stopped");
        Ok(())
    }
}
