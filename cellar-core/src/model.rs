//! Data model for tracked sales.
//!
//! A `Transaction` is a sale between a seller and a buyer. Approval, payment
//! and delivery are confirmed independently by each party; the lifecycle
//! state is derived from those flags rather than stored.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransactionError;

/// Newtype for a chat member (user) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub u64);

impl MemberId {
    /// Mention syntax understood by the chat surface.
    pub fn mention(&self) -> String {
        format!("<@{}>", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MemberId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Newtype for a transaction id. Assigned once by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TransactionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Newtype for a chat channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for a chat message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for a chat guild (server) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuildId(pub u64);

/// A price in minor units (pence).
///
/// Always strictly positive. Parsed from decimal text with at most two
/// fractional digits, with or without a leading `£`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Price(i64);

impl Price {
    pub fn from_pence(pence: i64) -> Result<Self, TransactionError> {
        if pence <= 0 {
            return Err(TransactionError::InvalidPrice(format!("{}p", pence)));
        }
        Ok(Self(pence))
    }

    pub fn pence(&self) -> i64 {
        self.0
    }
}

impl FromStr for Price {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransactionError::InvalidPrice(s.to_string());
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix('£').unwrap_or(trimmed).trim();

        let (whole, fraction) = match digits.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (digits, ""),
        };

        if whole.is_empty()
            || fraction.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let pounds: i64 = whole.parse().map_err(|_| invalid())?;
        let pence: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => fraction.parse().map_err(|_| invalid())?,
        };

        let total = pounds
            .checked_mul(100)
            .and_then(|p| p.checked_add(pence))
            .ok_or_else(invalid)?;
        Self::from_pence(total)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "£{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Price {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}.{:02}", self.0 / 100, self.0 % 100))
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Derived lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Open,
    Approved,
    Completed,
    Cancelled,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Approved => write!(f, "approved"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Mutable columns of a transaction.
///
/// State machine calls report which of these changed so callers can persist
/// only what moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionField {
    Wine,
    Price,
    SaleApproved,
    ApprovedDate,
    BuyerPaid,
    SellerPaid,
    PaidDate,
    BuyerDelivered,
    SellerDelivered,
    DeliveredDate,
    Cancelled,
    CancelledDate,
    CompletedDate,
}

impl TransactionField {
    pub const ALL: [TransactionField; 13] = [
        Self::Wine,
        Self::Price,
        Self::SaleApproved,
        Self::ApprovedDate,
        Self::BuyerPaid,
        Self::SellerPaid,
        Self::PaidDate,
        Self::BuyerDelivered,
        Self::SellerDelivered,
        Self::DeliveredDate,
        Self::Cancelled,
        Self::CancelledDate,
        Self::CompletedDate,
    ];

    /// Column name in persistent storage.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Wine => "wine",
            Self::Price => "price_pence",
            Self::SaleApproved => "sale_approved",
            Self::ApprovedDate => "approved_date",
            Self::BuyerPaid => "buyer_paid",
            Self::SellerPaid => "seller_paid",
            Self::PaidDate => "paid_date",
            Self::BuyerDelivered => "buyer_delivered",
            Self::SellerDelivered => "seller_delivered",
            Self::DeliveredDate => "delivered_date",
            Self::Cancelled => "cancelled",
            Self::CancelledDate => "cancelled_date",
            Self::CompletedDate => "completed_date",
        }
    }
}

/// A sale that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub seller: MemberId,
    pub buyer: MemberId,
    pub wine: String,
    pub price: Price,
    pub creation_date: DateTime<Utc>,
}

/// A tracked sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub seller: MemberId,
    pub buyer: MemberId,
    pub wine: String,
    pub price: Price,
    pub sale_approved: bool,
    pub buyer_paid: bool,
    pub seller_paid: bool,
    pub buyer_delivered: bool,
    pub seller_delivered: bool,
    pub cancelled: bool,
    pub approved_date: Option<DateTime<Utc>>,
    pub paid_date: Option<DateTime<Utc>>,
    pub delivered_date: Option<DateTime<Utc>>,
    pub cancelled_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
    pub creation_date: DateTime<Utc>,
}

impl Transaction {
    /// Materialize a stored sale from its draft and the id the store assigned.
    pub fn from_new(id: TransactionId, new: NewTransaction) -> Self {
        Self {
            id,
            seller: new.seller,
            buyer: new.buyer,
            wine: new.wine,
            price: new.price,
            sale_approved: false,
            buyer_paid: false,
            seller_paid: false,
            buyer_delivered: false,
            seller_delivered: false,
            cancelled: false,
            approved_date: None,
            paid_date: None,
            delivered_date: None,
            cancelled_date: None,
            completed_date: None,
            creation_date: new.creation_date,
        }
    }

    pub fn fully_paid(&self) -> bool {
        self.buyer_paid && self.seller_paid
    }

    pub fn fully_delivered(&self) -> bool {
        self.buyer_delivered && self.seller_delivered
    }

    /// Approved, fully paid and fully delivered. An unapproved sale is never
    /// complete, so it stays cancellable.
    pub fn is_completed(&self) -> bool {
        self.sale_approved && self.fully_paid() && self.fully_delivered()
    }

    /// True if nothing has been confirmed by either party yet.
    pub fn is_untouched(&self) -> bool {
        !(self.sale_approved
            || self.buyer_paid
            || self.seller_paid
            || self.buyer_delivered
            || self.seller_delivered
            || self.cancelled)
    }

    pub fn is_party(&self, member: MemberId) -> bool {
        member == self.buyer || member == self.seller
    }

    pub fn state(&self) -> TransactionState {
        if self.cancelled {
            TransactionState::Cancelled
        } else if self.is_completed() {
            TransactionState::Completed
        } else if self.sale_approved {
            TransactionState::Approved
        } else {
            TransactionState::Open
        }
    }
}

/// A status message the bot posted for a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotMessage {
    pub id: i64,
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub transaction_id: TransactionId,
    pub creation_date: DateTime<Utc>,
}

/// A status message that has been sent but not yet recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBotMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub transaction_id: TransactionId,
    pub creation_date: DateTime<Utc>,
}

/// Condition under which a reminder is suppressed at fire time.
///
/// A reminder with a filter only notifies if the transaction has *not* yet
/// reached the named status when the reminder fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Approved,
    Paid,
    Delivered,
    Completed,
    Cancelled,
}

impl StatusFilter {
    /// True if the transaction currently satisfies this status.
    pub fn is_satisfied_by(&self, tx: &Transaction) -> bool {
        match self {
            Self::Approved => tx.sale_approved,
            Self::Paid => tx.fully_paid(),
            Self::Delivered => tx.fully_delivered(),
            Self::Completed => tx.is_completed(),
            Self::Cancelled => tx.cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Paid => "paid",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approved" => Ok(Self::Approved),
            "paid" => Ok(Self::Paid),
            "delivered" => Ok(Self::Delivered),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown status filter '{}'", other)),
        }
    }
}

/// A stored, one-shot notification requested by a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    pub member: MemberId,
    pub transaction_id: TransactionId,
    pub channel_id: ChannelId,
    pub status_filter: Option<StatusFilter>,
    pub fire_at: DateTime<Utc>,
    pub creation_date: DateTime<Utc>,
}

/// A reminder that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReminder {
    pub member: MemberId,
    pub transaction_id: TransactionId,
    pub channel_id: ChannelId,
    pub status_filter: Option<StatusFilter>,
    pub fire_at: DateTime<Utc>,
    pub creation_date: DateTime<Utc>,
}
