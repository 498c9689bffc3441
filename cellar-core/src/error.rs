//! Domain errors.
//!
//! These describe legal-but-inapplicable requests (the wrong person reacting,
//! cancelling an approved sale, ...). They are reported back to the member and
//! never retried.

/// A requested transition that the transaction's current state or the acting
/// member does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("this sale has been cancelled")]
    Cancelled,

    #[error("this sale has already been approved and can no longer be changed or cancelled")]
    Approved,

    #[error("only the buyer can do that")]
    InvalidBuyer,

    #[error("only the seller can do that")]
    InvalidSeller,

    #[error("only the buyer or the seller can do that")]
    InvalidMember,

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("the wine name must not be empty")]
    EmptyWine,
}
