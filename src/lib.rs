//! Telegram relay — classify a source's messages and relay them to a channel.

pub mod app;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
