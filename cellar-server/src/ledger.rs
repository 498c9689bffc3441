//! Applies lifecycle transitions to stored transactions.
//!
//! Every write goes through `Ledger` so that the read -> decide -> persist ->
//! publish sequence for one transaction is serialized, the cache is
//! invalidated after each persisted change, and the status message follows.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::TransactionCache;
use crate::locks::KeyedLocks;
use crate::repository::{BotMessageStore, RepositoryError, TransactionStore};
use crate::synchronizer::{PublishError, StatusMessageSynchronizer};
use cellar_core::state_machine::{self, TransitionResult};
use cellar_core::{
    BotMessage, ChannelId, GuildId, MemberId, MessageId, Price, ReactionKind, Transaction,
    TransactionError, TransactionId,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Domain(#[from] TransactionError),

    #[error("storage failure: {0}")]
    Repository(#[from] RepositoryError),

    #[error("publish failure: {0}")]
    Publish(#[from] PublishError),

    #[error("transaction {0} not found")]
    NotFound(TransactionId),
}

/// A lifecycle transition requested by a party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Approve,
    Cancel,
    Paid,
    Delivered,
}

impl Action {
    pub fn from_reaction(kind: ReactionKind) -> Option<Self> {
        match kind {
            ReactionKind::Approve => Some(Self::Approve),
            ReactionKind::Cancel => Some(Self::Cancel),
            ReactionKind::MarkPaid => Some(Self::Paid),
            ReactionKind::MarkDelivered => Some(Self::Delivered),
            ReactionKind::RequestReminder => None,
        }
    }

    fn decide(
        &self,
        tx: &Transaction,
        actor: MemberId,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, TransactionError> {
        match self {
            Self::Approve => state_machine::approve(tx, actor, now),
            Self::Cancel => state_machine::cancel(tx, actor, now),
            Self::Paid => state_machine::mark_paid(tx, actor, now),
            Self::Delivered => state_machine::mark_delivered(tx, actor, now),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Cancel => write!(f, "cancel"),
            Self::Paid => write!(f, "paid"),
            Self::Delivered => write!(f, "delivered"),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "cancel" => Ok(Self::Cancel),
            "paid" => Ok(Self::Paid),
            "delivered" => Ok(Self::Delivered),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Where a status message should be posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub channel: ChannelId,
    pub guild: Option<GuildId>,
}

impl From<&BotMessage> for Destination {
    fn from(message: &BotMessage) -> Self {
        Self {
            channel: message.channel_id,
            guild: message.guild_id,
        }
    }
}

/// Result of a ledger operation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub transaction: Transaction,
    /// The new status message, if one was posted.
    pub published: Option<BotMessage>,
}

pub struct Ledger {
    transactions: Arc<dyn TransactionStore>,
    messages: Arc<dyn BotMessageStore>,
    synchronizer: StatusMessageSynchronizer,
    cache: Arc<TransactionCache>,
    locks: KeyedLocks<TransactionId>,
}

impl Ledger {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        messages: Arc<dyn BotMessageStore>,
        synchronizer: StatusMessageSynchronizer,
        cache: Arc<TransactionCache>,
    ) -> Self {
        Self {
            transactions,
            messages,
            synchronizer,
            cache,
            locks: KeyedLocks::new(),
        }
    }

    /// Look up a transaction, preferring the cache.
    pub async fn lookup(&self, id: TransactionId) -> Result<Option<Transaction>, LedgerError> {
        if let Some(tx) = self.cache.get(id).await {
            return Ok(Some(tx));
        }
        let tx = self.transactions.get(id).await?;
        if let Some(tx) = &tx {
            self.cache.insert(tx.clone()).await;
        }
        Ok(tx)
    }

    /// The status message a reaction was placed on, if it is one of ours.
    pub async fn message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<BotMessage>, LedgerError> {
        Ok(self
            .messages
            .find_by_platform_message_id(message_id)
            .await?)
    }

    /// The current status message for a transaction.
    pub async fn latest_message(
        &self,
        id: TransactionId,
    ) -> Result<Option<BotMessage>, LedgerError> {
        Ok(self.messages.latest_for_transaction(id).await?)
    }

    /// List a new sale and post its first status message.
    pub async fn open_sale(
        &self,
        seller: MemberId,
        buyer: MemberId,
        wine: &str,
        price: Price,
        destination: Destination,
    ) -> Result<Outcome, LedgerError> {
        let draft = state_machine::open_sale(seller, buyer, wine, price, Utc::now())?;
        let tx = self.transactions.insert(draft).await?;
        info!(
            "Opened transaction {}: {} selling {} to {} for {}",
            tx.id, tx.seller, tx.wine, tx.buyer, tx.price
        );

        let _guard = self.locks.lock(tx.id).await;
        let published = self
            .synchronizer
            .publish(&tx, destination.channel, destination.guild, None)
            .await?;
        Ok(Outcome {
            transaction: tx,
            published: Some(published),
        })
    }

    /// Apply a party's transition and republish the status.
    ///
    /// With no `destination`, the status is posted wherever the latest status
    /// message lives.
    pub async fn apply(
        &self,
        id: TransactionId,
        action: Action,
        actor: MemberId,
        destination: Option<Destination>,
    ) -> Result<Outcome, LedgerError> {
        debug!("Applying {} to transaction {} for {}", action, id, actor);
        self.commit(id, destination, |tx, now| action.decide(tx, actor, now))
            .await
    }

    /// Amend the wine or price of a sale that is still open.
    pub async fn revise(
        &self,
        id: TransactionId,
        actor: MemberId,
        wine: Option<&str>,
        price: Option<Price>,
        destination: Option<Destination>,
    ) -> Result<Outcome, LedgerError> {
        self.commit(id, destination, |tx, _now| {
            state_machine::revise(tx, actor, wine, price)
        })
        .await
    }

    /// Remove a transaction and the records of its status messages.
    pub async fn purge(&self, id: TransactionId) -> Result<usize, LedgerError> {
        let _guard = self.locks.lock(id).await;
        let removed = self.messages.delete_for_transaction(id).await?;
        self.transactions.delete(id).await?;
        self.cache.invalidate(id).await;
        Ok(removed)
    }

    async fn commit<F>(
        &self,
        id: TransactionId,
        destination: Option<Destination>,
        decide: F,
    ) -> Result<Outcome, LedgerError>
    where
        F: FnOnce(&Transaction, DateTime<Utc>) -> Result<TransitionResult, TransactionError>,
    {
        let _guard = self.locks.lock(id).await;

        // Read fresh under the lock; the cache may be stale.
        let current = self
            .transactions
            .get(id)
            .await?
            .ok_or(LedgerError::NotFound(id))?;

        let result = decide(&current, Utc::now())?;
        if result.is_no_op() {
            debug!("Transaction {} unchanged, not republishing", id);
            return Ok(Outcome {
                transaction: current,
                published: None,
            });
        }

        let saved = self
            .transactions
            .save(&result.transaction, Some(&result.changed))
            .await?;
        self.cache.invalidate(id).await;
        info!(
            "Transaction {} is now {} (changed: {:?})",
            id,
            saved.state(),
            result.changed
        );

        let previous = self.messages.latest_for_transaction(id).await?;
        let Some(destination) = destination.or_else(|| previous.as_ref().map(Destination::from))
        else {
            warn!(
                "Transaction {} has no status message and no destination, not publishing",
                id
            );
            return Ok(Outcome {
                transaction: saved,
                published: None,
            });
        };

        let published = self
            .synchronizer
            .publish(&saved, destination.channel, destination.guild, previous.as_ref())
            .await?;
        Ok(Outcome {
            transaction: saved,
            published: Some(published),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::FakeChannel;
    use crate::repository::InMemoryRepository;
    use cellar_core::TransactionState;
    use std::time::Duration;

    const SELLER: MemberId = MemberId(1);
    const BUYER: MemberId = MemberId(2);
    const STRANGER: MemberId = MemberId(3);

    fn destination() -> Destination {
        Destination {
            channel: ChannelId(10),
            guild: Some(GuildId(99)),
        }
    }

    fn setup() -> (Arc<FakeChannel>, Arc<InMemoryRepository>, Arc<Ledger>) {
        let channel = Arc::new(FakeChannel::new());
        let repo = Arc::new(InMemoryRepository::new());
        let sync = StatusMessageSynchronizer::new(channel.clone(), repo.clone(), true);
        let cache = Arc::new(TransactionCache::new(Duration::from_secs(60), 16));
        let ledger = Arc::new(Ledger::new(repo.clone(), repo.clone(), sync, cache));
        (channel, repo, ledger)
    }

    async fn open(ledger: &Ledger) -> Outcome {
        ledger
            .open_sale(SELLER, BUYER, "Chianti", "12.50".parse().unwrap(), destination())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_sale_persists_and_publishes() {
        let (channel, repo, ledger) = setup();
        let outcome = open(&ledger).await;

        assert_eq!(outcome.transaction.state(), TransactionState::Open);
        let published = outcome.published.unwrap();
        assert_eq!(published.guild_id, Some(GuildId(99)));
        assert!(channel.is_live(published.message_id).await);
        assert!(TransactionStore::get(&*repo, outcome.transaction.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_open_sale_rejects_self_dealing() {
        let (_channel, _repo, ledger) = setup();
        let result = ledger
            .open_sale(SELLER, SELLER, "Chianti", "12.50".parse().unwrap(), destination())
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::Domain(TransactionError::InvalidBuyer))
        ));
    }

    #[tokio::test]
    async fn test_apply_replaces_status_message() {
        let (channel, _repo, ledger) = setup();
        let opened = open(&ledger).await;
        let first = opened.published.unwrap();

        let approved = ledger
            .apply(opened.transaction.id, Action::Approve, BUYER, None)
            .await
            .unwrap();

        assert_eq!(approved.transaction.state(), TransactionState::Approved);
        let second = approved.published.unwrap();
        assert_eq!(second.channel_id, first.channel_id);
        assert!(!channel.is_live(first.message_id).await);
        assert!(channel.is_live(second.message_id).await);
    }

    #[tokio::test]
    async fn test_no_op_does_not_republish() {
        let (channel, _repo, ledger) = setup();
        let opened = open(&ledger).await;
        let id = opened.transaction.id;

        ledger.apply(id, Action::Approve, BUYER, None).await.unwrap();
        let sends_before = channel.sent_texts().await.len();

        let again = ledger.apply(id, Action::Approve, BUYER, None).await.unwrap();
        assert!(again.published.is_none());
        assert_eq!(channel.sent_texts().await.len(), sends_before);
    }

    #[tokio::test]
    async fn test_domain_error_leaves_store_untouched() {
        let (_channel, repo, ledger) = setup();
        let opened = open(&ledger).await;
        let id = opened.transaction.id;

        let result = ledger.apply(id, Action::Approve, STRANGER, None).await;
        assert!(matches!(
            result,
            Err(LedgerError::Domain(TransactionError::InvalidBuyer))
        ));
        let stored = TransactionStore::get(&*repo, id).await.unwrap().unwrap();
        assert!(!stored.sale_approved);
    }

    #[tokio::test]
    async fn test_missing_transaction() {
        let (_channel, _repo, ledger) = setup();
        let result = ledger
            .apply(TransactionId(404), Action::Paid, BUYER, None)
            .await;
        assert!(matches!(result, Err(LedgerError::NotFound(TransactionId(404)))));
    }

    #[tokio::test]
    async fn test_apply_invalidates_cache() {
        let (_channel, _repo, ledger) = setup();
        let opened = open(&ledger).await;
        let id = opened.transaction.id;

        let cached = ledger.lookup(id).await.unwrap().unwrap();
        assert!(!cached.sale_approved);

        ledger.apply(id, Action::Approve, BUYER, None).await.unwrap();
        let fresh = ledger.lookup(id).await.unwrap().unwrap();
        assert!(fresh.sale_approved);
    }

    #[tokio::test]
    async fn test_revise_by_seller() {
        let (channel, _repo, ledger) = setup();
        let opened = open(&ledger).await;
        let id = opened.transaction.id;

        let revised = ledger
            .revise(id, SELLER, Some("Brunello"), None, None)
            .await
            .unwrap();
        assert_eq!(revised.transaction.wine, "Brunello");
        let texts = channel.sent_texts().await;
        assert!(texts.last().unwrap().contains("Brunello"));

        let result = ledger.revise(id, BUYER, Some("Barolo"), None, None).await;
        assert!(matches!(
            result,
            Err(LedgerError::Domain(TransactionError::InvalidSeller))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_marks_publish_one_live_message() {
        let (channel, repo, ledger) = setup();
        let opened = open(&ledger).await;
        let id = opened.transaction.id;
        ledger.apply(id, Action::Approve, BUYER, None).await.unwrap();

        let a = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.apply(id, Action::Paid, BUYER, None).await })
        };
        let b = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.apply(id, Action::Paid, SELLER, None).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let stored = TransactionStore::get(&*repo, id).await.unwrap().unwrap();
        assert!(stored.fully_paid());
        assert!(stored.paid_date.is_some());
        assert_eq!(channel.live.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_removes_transaction_and_messages() {
        let (_channel, repo, ledger) = setup();
        let opened = open(&ledger).await;
        let id = opened.transaction.id;

        assert_eq!(ledger.purge(id).await.unwrap(), 1);
        assert!(TransactionStore::get(&*repo, id).await.unwrap().is_none());
        assert!(repo.latest_for_transaction(id).await.unwrap().is_none());
        assert!(ledger.lookup(id).await.unwrap().is_none());
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("approve".parse::<Action>(), Ok(Action::Approve));
        assert_eq!("delivered".parse::<Action>(), Ok(Action::Delivered));
        assert!("refund".parse::<Action>().is_err());
        assert_eq!(Action::from_reaction(ReactionKind::RequestReminder), None);
        assert_eq!(
            Action::from_reaction(ReactionKind::MarkPaid),
            Some(Action::Paid)
        );
    }
}
