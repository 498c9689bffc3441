//! Reaction vocabulary used on status messages.

pub const APPROVE_EMOJI: &str = "✅";
pub const CANCEL_EMOJI: &str = "❌";
pub const PAID_EMOJI: &str = "💰";
pub const DELIVERED_EMOJI: &str = "📦";
pub const REMINDER_EMOJI: &str = "⏰";
/// Added by the bot while a reaction is being processed.
pub const PROCESSING_EMOJI: &str = "⏳";

/// What a member asked for by reacting to a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactionKind {
    Approve,
    Cancel,
    MarkPaid,
    MarkDelivered,
    RequestReminder,
}

impl ReactionKind {
    /// Map an emoji to an action. Unrelated emoji map to `None`.
    pub fn from_emoji(emoji: &str) -> Option<Self> {
        // Some clients append the emoji presentation selector.
        match emoji.trim_end_matches('\u{FE0F}') {
            APPROVE_EMOJI => Some(Self::Approve),
            CANCEL_EMOJI => Some(Self::Cancel),
            PAID_EMOJI => Some(Self::MarkPaid),
            DELIVERED_EMOJI => Some(Self::MarkDelivered),
            REMINDER_EMOJI => Some(Self::RequestReminder),
            _ => None,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Approve => APPROVE_EMOJI,
            Self::Cancel => CANCEL_EMOJI,
            Self::MarkPaid => PAID_EMOJI,
            Self::MarkDelivered => DELIVERED_EMOJI,
            Self::RequestReminder => REMINDER_EMOJI,
        }
    }
}
