//! Repository abstraction for durable state.
//!
//! This module defines the store traits for the three persisted entities
//! (transactions, status messages, reminders). Implementations provide
//! different backends (in-memory for tests, SQLite for deployment).

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;

use cellar_core::{
    BotMessage, MessageId, NewBotMessage, NewReminder, NewTransaction, Reminder, Transaction,
    TransactionField, TransactionId,
};

/// Errors from a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("corrupted {0} in storage")]
    Corruption(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl RepositoryError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption(what.into())
    }
}

/// Durable storage for transactions.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Store a new transaction, assigning its id.
    async fn insert(&self, new: NewTransaction) -> Result<Transaction, RepositoryError>;

    /// Get a transaction, returning None if not found.
    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, RepositoryError>;

    /// Persist a transaction.
    ///
    /// With `changed` set, only those columns are written; otherwise every
    /// mutable column is. Returns the transaction as stored.
    async fn save(
        &self,
        tx: &Transaction,
        changed: Option<&[TransactionField]>,
    ) -> Result<Transaction, RepositoryError>;

    /// Delete a transaction.
    async fn delete(&self, id: TransactionId) -> Result<(), RepositoryError>;

    /// Completed transactions whose completion is older than `hours`.
    async fn list_completed_older_than(
        &self,
        hours: i64,
    ) -> Result<Vec<Transaction>, RepositoryError>;

    /// All transactions (for the status endpoint).
    async fn list(&self) -> Result<Vec<Transaction>, RepositoryError>;
}

/// Durable storage for reminders.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Reminder>, RepositoryError>;

    /// Store a new reminder, assigning its id.
    async fn save(&self, new: NewReminder) -> Result<Reminder, RepositoryError>;

    async fn list(&self) -> Result<Vec<Reminder>, RepositoryError>;

    async fn delete(&self, id: i64) -> Result<(), RepositoryError>;
}

/// Durable record of status messages posted by the bot.
#[async_trait]
pub trait BotMessageStore: Send + Sync {
    async fn add(&self, new: NewBotMessage) -> Result<BotMessage, RepositoryError>;

    async fn find_by_platform_message_id(
        &self,
        message_id: MessageId,
    ) -> Result<Option<BotMessage>, RepositoryError>;

    /// The most recently recorded message for a transaction.
    async fn latest_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<BotMessage>, RepositoryError>;

    async fn delete(&self, id: i64) -> Result<(), RepositoryError>;

    /// Delete every message recorded for a transaction. Returns the count removed.
    async fn delete_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<usize, RepositoryError>;
}
