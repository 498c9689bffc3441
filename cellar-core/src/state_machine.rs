//! Pure transaction lifecycle decisions.
//!
//! Every function here takes the current transaction, the acting member and
//! the current time, and returns either a domain error or the updated
//! transaction together with the fields that changed. Nothing here performs
//! I/O; callers persist the changed fields and re-render the status message.
//!
//! Repeated calls by the correct party are no-ops (duplicate reaction events
//! are common), while calls by the wrong party are rejected explicitly.

use chrono::{DateTime, Utc};

use crate::error::TransactionError;
use crate::model::{MemberId, NewTransaction, Price, Transaction, TransactionField};

/// Result of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    /// The transaction after the transition.
    pub transaction: Transaction,
    /// Fields that differ from the input transaction. Empty for a no-op.
    pub changed: Vec<TransactionField>,
}

impl TransitionResult {
    pub fn new(transaction: Transaction, changed: Vec<TransactionField>) -> Self {
        Self {
            transaction,
            changed,
        }
    }

    pub fn no_change(transaction: Transaction) -> Self {
        Self {
            transaction,
            changed: vec![],
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.changed.is_empty()
    }
}

/// The two confirmations that need both parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pair {
    Paid,
    Delivered,
}

impl Pair {
    fn buyer_flag(self, tx: &mut Transaction) -> (&mut bool, TransactionField) {
        match self {
            Pair::Paid => (&mut tx.buyer_paid, TransactionField::BuyerPaid),
            Pair::Delivered => (&mut tx.buyer_delivered, TransactionField::BuyerDelivered),
        }
    }

    fn seller_flag(self, tx: &mut Transaction) -> (&mut bool, TransactionField) {
        match self {
            Pair::Paid => (&mut tx.seller_paid, TransactionField::SellerPaid),
            Pair::Delivered => (&mut tx.seller_delivered, TransactionField::SellerDelivered),
        }
    }

    fn date(self, tx: &mut Transaction) -> (&mut Option<DateTime<Utc>>, TransactionField) {
        match self {
            Pair::Paid => (&mut tx.paid_date, TransactionField::PaidDate),
            Pair::Delivered => (&mut tx.delivered_date, TransactionField::DeliveredDate),
        }
    }

    fn complete(self, tx: &Transaction) -> bool {
        match self {
            Pair::Paid => tx.fully_paid(),
            Pair::Delivered => tx.fully_delivered(),
        }
    }
}

/// Build a new sale listed by `seller` for `buyer`.
pub fn open_sale(
    seller: MemberId,
    buyer: MemberId,
    wine: &str,
    price: Price,
    now: DateTime<Utc>,
) -> Result<NewTransaction, TransactionError> {
    if seller == buyer {
        return Err(TransactionError::InvalidBuyer);
    }
    let wine = wine.trim();
    if wine.is_empty() {
        return Err(TransactionError::EmptyWine);
    }
    Ok(NewTransaction {
        seller,
        buyer,
        wine: wine.to_string(),
        price,
        creation_date: now,
    })
}

/// The buyer approves the sale.
pub fn approve(
    tx: &Transaction,
    actor: MemberId,
    now: DateTime<Utc>,
) -> Result<TransitionResult, TransactionError> {
    if tx.cancelled {
        return Err(TransactionError::Cancelled);
    }
    if actor != tx.buyer {
        return Err(TransactionError::InvalidBuyer);
    }
    if tx.sale_approved {
        return Ok(TransitionResult::no_change(tx.clone()));
    }

    let mut next = tx.clone();
    next.sale_approved = true;
    next.approved_date = Some(now);
    let mut changed = vec![TransactionField::SaleApproved, TransactionField::ApprovedDate];

    // Payment and delivery may already be confirmed on both sides.
    if next.is_completed() && next.completed_date.is_none() {
        next.completed_date = Some(now);
        changed.push(TransactionField::CompletedDate);
    }

    Ok(TransitionResult::new(next, changed))
}

/// Either party cancels the sale. Only possible before approval.
pub fn cancel(
    tx: &Transaction,
    actor: MemberId,
    now: DateTime<Utc>,
) -> Result<TransitionResult, TransactionError> {
    if tx.sale_approved {
        return Err(TransactionError::Approved);
    }
    if !tx.is_party(actor) {
        return Err(TransactionError::InvalidMember);
    }
    if tx.cancelled {
        return Ok(TransitionResult::no_change(tx.clone()));
    }

    let mut next = tx.clone();
    next.cancelled = true;
    next.cancelled_date = Some(now);
    Ok(TransitionResult::new(
        next,
        vec![TransactionField::Cancelled, TransactionField::CancelledDate],
    ))
}

/// The acting party confirms payment on their side.
pub fn mark_paid(
    tx: &Transaction,
    actor: MemberId,
    now: DateTime<Utc>,
) -> Result<TransitionResult, TransactionError> {
    mark(tx, actor, now, Pair::Paid)
}

/// The acting party confirms delivery on their side.
pub fn mark_delivered(
    tx: &Transaction,
    actor: MemberId,
    now: DateTime<Utc>,
) -> Result<TransitionResult, TransactionError> {
    mark(tx, actor, now, Pair::Delivered)
}

fn mark(
    tx: &Transaction,
    actor: MemberId,
    now: DateTime<Utc>,
    pair: Pair,
) -> Result<TransitionResult, TransactionError> {
    if tx.cancelled {
        return Err(TransactionError::Cancelled);
    }
    let is_buyer = actor == tx.buyer;
    let is_seller = actor == tx.seller;
    if !is_buyer && !is_seller {
        return Err(TransactionError::InvalidMember);
    }

    let mut next = tx.clone();
    let mut changed = Vec::new();

    if is_buyer {
        let (flag, field) = pair.buyer_flag(&mut next);
        if !*flag {
            *flag = true;
            changed.push(field);
        }
    }
    if is_seller {
        let (flag, field) = pair.seller_flag(&mut next);
        if !*flag {
            *flag = true;
            changed.push(field);
        }
    }

    if changed.is_empty() {
        return Ok(TransitionResult::no_change(next));
    }

    // The shared date records the moment the second side confirmed.
    if pair.complete(&next) {
        let (date, field) = pair.date(&mut next);
        if date.is_none() {
            *date = Some(now);
            changed.push(field);
        }
    }
    if next.is_completed() && next.completed_date.is_none() {
        next.completed_date = Some(now);
        changed.push(TransactionField::CompletedDate);
    }

    Ok(TransitionResult::new(next, changed))
}

/// The seller amends the item or price before the buyer has approved.
pub fn revise(
    tx: &Transaction,
    actor: MemberId,
    wine: Option<&str>,
    price: Option<Price>,
) -> Result<TransitionResult, TransactionError> {
    if tx.cancelled {
        return Err(TransactionError::Cancelled);
    }
    if tx.sale_approved {
        return Err(TransactionError::Approved);
    }
    if actor != tx.seller {
        return Err(TransactionError::InvalidSeller);
    }

    let mut next = tx.clone();
    let mut changed = Vec::new();

    if let Some(wine) = wine {
        let wine = wine.trim();
        if wine.is_empty() {
            return Err(TransactionError::EmptyWine);
        }
        if wine != next.wine {
            next.wine = wine.to_string();
            changed.push(TransactionField::Wine);
        }
    }
    if let Some(price) = price {
        if price != next.price {
            next.price = price;
            changed.push(TransactionField::Price);
        }
    }

    Ok(TransitionResult::new(next, changed))
}
