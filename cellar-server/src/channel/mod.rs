//! The chat surface the bot talks to.
//!
//! `NotificationChannel` is the narrow slice of the chat platform this
//! service needs: post and delete plain-text messages, and add or remove the
//! bot's own reactions.

mod discord;

pub use discord::DiscordChannel;

use async_trait::async_trait;

use cellar_core::{ChannelId, MemberId, MessageId};

/// Errors from the chat surface.
///
/// `NotFound` and `Forbidden` are distinguished because callers often treat
/// them as "already resolved" rather than as failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("message or channel not found")]
    NotFound,

    #[error("missing permission for this action")]
    Forbidden,

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// True for outcomes that mean the target no longer needs acting on.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::NotFound | Self::Forbidden)
    }
}

/// Send/delete messages and manage reactions on the chat surface.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Post a message, returning its id.
    ///
    /// Only the members in `ping` are notified by mentions in `text`; any
    /// other mention renders as a name without a notification.
    async fn send(
        &self,
        channel: ChannelId,
        text: &str,
        ping: &[MemberId],
    ) -> Result<MessageId, TransportError>;

    async fn delete(&self, channel: ChannelId, message: MessageId) -> Result<(), TransportError>;

    async fn add_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), TransportError>;

    async fn remove_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), TransportError>;
}
