//! Relay pipeline.
//!
//! Every message from the monitored source flows through:
//! 1. `Classifier::classify()` — ordered pattern rules, first match wins
//! 2. `RelayEngine::handle()` — performs the sends the action calls for
//! 3. `ConversationBroker::consult()` — one bounded request/reply with the
//!    counterpart, only for authorization reports
//!
//! Nothing here fails outright: send and consultation faults are logged and
//! reported in the returned `OutboundSend` list.

pub mod broker;
pub mod patterns;
pub mod relay;
pub mod rules;
pub mod types;
