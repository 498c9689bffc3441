//! In-memory implementation of the store traits.
//!
//! All state is held in memory and lost on restart. Used by tests and as a
//! reference for the semantics the SQLite backend must match.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use super::{BotMessageStore, ReminderStore, RepositoryError, TransactionStore};
use cellar_core::{
    BotMessage, MessageId, NewBotMessage, NewReminder, NewTransaction, Reminder, Transaction,
    TransactionField, TransactionId,
};

/// Rows keyed by id, plus the next id to hand out.
#[derive(Debug)]
struct Table<T> {
    rows: BTreeMap<i64, T>,
    next_id: i64,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl<T> Table<T> {
    fn allocate(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// In-memory repository backing all three stores.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    transactions: RwLock<Table<Transaction>>,
    reminders: RwLock<Table<Reminder>>,
    bot_messages: RwLock<Table<BotMessage>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Copy the named columns from `src` onto `dst`.
fn apply_fields(dst: &mut Transaction, src: &Transaction, fields: &[TransactionField]) {
    for field in fields {
        match field {
            TransactionField::Wine => dst.wine = src.wine.clone(),
            TransactionField::Price => dst.price = src.price,
            TransactionField::SaleApproved => dst.sale_approved = src.sale_approved,
            TransactionField::ApprovedDate => dst.approved_date = src.approved_date,
            TransactionField::BuyerPaid => dst.buyer_paid = src.buyer_paid,
            TransactionField::SellerPaid => dst.seller_paid = src.seller_paid,
            TransactionField::PaidDate => dst.paid_date = src.paid_date,
            TransactionField::BuyerDelivered => dst.buyer_delivered = src.buyer_delivered,
            TransactionField::SellerDelivered => dst.seller_delivered = src.seller_delivered,
            TransactionField::DeliveredDate => dst.delivered_date = src.delivered_date,
            TransactionField::Cancelled => dst.cancelled = src.cancelled,
            TransactionField::CancelledDate => dst.cancelled_date = src.cancelled_date,
            TransactionField::CompletedDate => dst.completed_date = src.completed_date,
        }
    }
}

#[async_trait]
impl TransactionStore for InMemoryRepository {
    async fn insert(&self, new: NewTransaction) -> Result<Transaction, RepositoryError> {
        let mut table = self.transactions.write().await;
        let id = table.allocate();
        let tx = Transaction::from_new(TransactionId(id), new);
        table.rows.insert(id, tx.clone());
        Ok(tx)
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, RepositoryError> {
        let table = self.transactions.read().await;
        Ok(table.rows.get(&id.0).cloned())
    }

    async fn save(
        &self,
        tx: &Transaction,
        changed: Option<&[TransactionField]>,
    ) -> Result<Transaction, RepositoryError> {
        let mut table = self.transactions.write().await;
        let stored = table
            .rows
            .get_mut(&tx.id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", tx.id)))?;
        apply_fields(stored, tx, changed.unwrap_or(&TransactionField::ALL));
        Ok(stored.clone())
    }

    async fn delete(&self, id: TransactionId) -> Result<(), RepositoryError> {
        let mut table = self.transactions.write().await;
        table.rows.remove(&id.0);
        Ok(())
    }

    async fn list_completed_older_than(
        &self,
        hours: i64,
    ) -> Result<Vec<Transaction>, RepositoryError> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let table = self.transactions.read().await;
        Ok(table
            .rows
            .values()
            .filter(|tx| tx.completed_date.is_some_and(|done| done < cutoff))
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<Transaction>, RepositoryError> {
        let table = self.transactions.read().await;
        Ok(table.rows.values().cloned().collect())
    }
}

#[async_trait]
impl ReminderStore for InMemoryRepository {
    async fn get(&self, id: i64) -> Result<Option<Reminder>, RepositoryError> {
        let table = self.reminders.read().await;
        Ok(table.rows.get(&id).cloned())
    }

    async fn save(&self, new: NewReminder) -> Result<Reminder, RepositoryError> {
        let mut table = self.reminders.write().await;
        let id = table.allocate();
        let reminder = Reminder {
            id,
            member: new.member,
            transaction_id: new.transaction_id,
            channel_id: new.channel_id,
            status_filter: new.status_filter,
            fire_at: new.fire_at,
            creation_date: new.creation_date,
        };
        table.rows.insert(id, reminder.clone());
        Ok(reminder)
    }

    async fn list(&self) -> Result<Vec<Reminder>, RepositoryError> {
        let table = self.reminders.read().await;
        Ok(table.rows.values().cloned().collect())
    }

    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        let mut table = self.reminders.write().await;
        table.rows.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl BotMessageStore for InMemoryRepository {
    async fn add(&self, new: NewBotMessage) -> Result<BotMessage, RepositoryError> {
        let mut table = self.bot_messages.write().await;
        let id = table.allocate();
        let message = BotMessage {
            id,
            message_id: new.message_id,
            channel_id: new.channel_id,
            guild_id: new.guild_id,
            transaction_id: new.transaction_id,
            creation_date: new.creation_date,
        };
        table.rows.insert(id, message.clone());
        Ok(message)
    }

    async fn find_by_platform_message_id(
        &self,
        message_id: MessageId,
    ) -> Result<Option<BotMessage>, RepositoryError> {
        let table = self.bot_messages.read().await;
        Ok(table
            .rows
            .values()
            .find(|m| m.message_id == message_id)
            .cloned())
    }

    async fn latest_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<BotMessage>, RepositoryError> {
        let table = self.bot_messages.read().await;
        // Ids are allocated in insertion order, so the highest id is the newest.
        Ok(table
            .rows
            .values()
            .rev()
            .find(|m| m.transaction_id == transaction_id)
            .cloned())
    }

    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        let mut table = self.bot_messages.write().await;
        table.rows.remove(&id);
        Ok(())
    }

    async fn delete_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<usize, RepositoryError> {
        let mut table = self.bot_messages.write().await;
        let before = table.rows.len();
        table.rows.retain(|_, m| m.transaction_id != transaction_id);
        Ok(before - table.rows.len())
    }
}
