//! Channels: where contact messages come from and how responses leave.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;
use crate::inbound::InboundMessage;

pub mod cli;
pub mod telegram;

pub use cli::{CliChannel, StdoutTransport};
pub use telegram::TelegramTransport;

/// A message from a contact, as produced by a channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub contact_id: String,
    pub message: InboundMessage,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// An inbound message source.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start producing messages. A channel can only be started once.
    async fn start(&self) -> Result<MessageStream, ChannelError>;
}
