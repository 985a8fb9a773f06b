//! Messaging transports.

pub mod channel;
pub mod memory;
pub mod telegram;

pub use channel::*;
pub use memory::MemoryMessenger;
pub use telegram::TelegramMessenger;
