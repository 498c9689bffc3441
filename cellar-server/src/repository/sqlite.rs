//! SQLite implementation of the store traits.
//!
//! This provides persistent storage that survives service restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{BotMessageStore, ReminderStore, RepositoryError, TransactionStore};
use cellar_core::{
    BotMessage, ChannelId, GuildId, MemberId, MessageId, NewBotMessage, NewReminder,
    NewTransaction, Price, Reminder, StatusFilter, Transaction, TransactionField, TransactionId,
};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

const TRANSACTION_COLUMNS: &str = "id, seller, buyer, wine, price_pence, sale_approved, \
     buyer_paid, seller_paid, buyer_delivered, seller_delivered, cancelled, approved_date, \
     paid_date, delivered_date, cancelled_date, completed_date, creation_date";

const BOT_MESSAGE_COLUMNS: &str =
    "id, message_id, channel_id, guild_id, transaction_id, creation_date";

const REMINDER_COLUMNS: &str =
    "id, member, transaction_id, channel_id, status_filter, fire_at, creation_date";

/// SQLite-backed repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Create a new SQLite repository at the given path.
    ///
    /// Creates the database file and schema if they don't exist and runs any
    /// pending migrations.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for better concurrency and crash safety
    /// - `synchronous = FULL` for maximum durability
    /// - `busy_timeout = 5000ms` to handle concurrent access gracefully
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory support; in-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for tests).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS transactions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    seller INTEGER NOT NULL,
                    buyer INTEGER NOT NULL,
                    wine TEXT NOT NULL,
                    price_pence INTEGER NOT NULL CHECK (price_pence > 0),
                    sale_approved INTEGER NOT NULL DEFAULT 0,
                    buyer_paid INTEGER NOT NULL DEFAULT 0,
                    seller_paid INTEGER NOT NULL DEFAULT 0,
                    buyer_delivered INTEGER NOT NULL DEFAULT 0,
                    seller_delivered INTEGER NOT NULL DEFAULT 0,
                    cancelled INTEGER NOT NULL DEFAULT 0,
                    approved_date TEXT,
                    paid_date TEXT,
                    delivered_date TEXT,
                    cancelled_date TEXT,
                    completed_date TEXT,
                    creation_date TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_transactions_completed
                    ON transactions(completed_date) WHERE completed_date IS NOT NULL;

                CREATE TABLE IF NOT EXISTS bot_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    message_id INTEGER NOT NULL,
                    channel_id INTEGER NOT NULL,
                    guild_id INTEGER,
                    transaction_id INTEGER NOT NULL,
                    creation_date TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_bot_messages_message_id
                    ON bot_messages(message_id);
                CREATE INDEX IF NOT EXISTS idx_bot_messages_transaction
                    ON bot_messages(transaction_id);

                CREATE TABLE IF NOT EXISTS reminders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    member INTEGER NOT NULL,
                    transaction_id INTEGER NOT NULL,
                    channel_id INTEGER NOT NULL,
                    status_filter TEXT,
                    fire_at TEXT NOT NULL,
                    creation_date TEXT NOT NULL
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

fn storage(operation: &'static str) -> impl Fn(rusqlite::Error) -> RepositoryError {
    move |e| RepositoryError::storage(operation, e.to_string())
}

// =============================================================================
// Row conversion
// =============================================================================

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn optional_timestamp(value: Option<DateTime<Utc>>) -> Value {
    match value {
        Some(ts) => Value::Text(timestamp(&ts)),
        None => Value::Null,
    }
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(idx, row.get(idx)?)
}

fn get_optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_timestamp(idx, raw))
        .transpose()
}

fn get_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)? as u64)
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let price = Price::from_pence(row.get(4)?).map_err(|e| conversion_error(4, e))?;
    Ok(Transaction {
        id: TransactionId(row.get(0)?),
        seller: MemberId(get_id(row, 1)?),
        buyer: MemberId(get_id(row, 2)?),
        wine: row.get(3)?,
        price,
        sale_approved: row.get(5)?,
        buyer_paid: row.get(6)?,
        seller_paid: row.get(7)?,
        buyer_delivered: row.get(8)?,
        seller_delivered: row.get(9)?,
        cancelled: row.get(10)?,
        approved_date: get_optional_timestamp(row, 11)?,
        paid_date: get_optional_timestamp(row, 12)?,
        delivered_date: get_optional_timestamp(row, 13)?,
        cancelled_date: get_optional_timestamp(row, 14)?,
        completed_date: get_optional_timestamp(row, 15)?,
        creation_date: get_timestamp(row, 16)?,
    })
}

fn row_to_bot_message(row: &Row<'_>) -> rusqlite::Result<BotMessage> {
    Ok(BotMessage {
        id: row.get(0)?,
        message_id: MessageId(get_id(row, 1)?),
        channel_id: ChannelId(get_id(row, 2)?),
        guild_id: row.get::<_, Option<i64>>(3)?.map(|g| GuildId(g as u64)),
        transaction_id: TransactionId(row.get(4)?),
        creation_date: get_timestamp(row, 5)?,
    })
}

fn row_to_reminder(row: &Row<'_>) -> rusqlite::Result<Reminder> {
    let status_filter = row
        .get::<_, Option<String>>(4)?
        .map(|raw| {
            raw.parse::<StatusFilter>().map_err(|e| {
                conversion_error(4, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })
        })
        .transpose()?;
    Ok(Reminder {
        id: row.get(0)?,
        member: MemberId(get_id(row, 1)?),
        transaction_id: TransactionId(row.get(2)?),
        channel_id: ChannelId(get_id(row, 3)?),
        status_filter,
        fire_at: get_timestamp(row, 5)?,
        creation_date: get_timestamp(row, 6)?,
    })
}

fn field_value(tx: &Transaction, field: TransactionField) -> Value {
    match field {
        TransactionField::Wine => Value::Text(tx.wine.clone()),
        TransactionField::Price => Value::Integer(tx.price.pence()),
        TransactionField::SaleApproved => Value::Integer(tx.sale_approved as i64),
        TransactionField::ApprovedDate => optional_timestamp(tx.approved_date),
        TransactionField::BuyerPaid => Value::Integer(tx.buyer_paid as i64),
        TransactionField::SellerPaid => Value::Integer(tx.seller_paid as i64),
        TransactionField::PaidDate => optional_timestamp(tx.paid_date),
        TransactionField::BuyerDelivered => Value::Integer(tx.buyer_delivered as i64),
        TransactionField::SellerDelivered => Value::Integer(tx.seller_delivered as i64),
        TransactionField::DeliveredDate => optional_timestamp(tx.delivered_date),
        TransactionField::Cancelled => Value::Integer(tx.cancelled as i64),
        TransactionField::CancelledDate => optional_timestamp(tx.cancelled_date),
        TransactionField::CompletedDate => optional_timestamp(tx.completed_date),
    }
}

fn select_transaction(
    conn: &Connection,
    id: TransactionId,
) -> Result<Option<Transaction>, RepositoryError> {
    conn.query_row(
        &format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLUMNS),
        params![id.0],
        row_to_transaction,
    )
    .optional()
    .map_err(storage("get transaction"))
}

fn select_bot_message(conn: &Connection, id: i64) -> Result<BotMessage, RepositoryError> {
    conn.query_row(
        &format!("SELECT {} FROM bot_messages WHERE id = ?1", BOT_MESSAGE_COLUMNS),
        params![id],
        row_to_bot_message,
    )
    .map_err(storage("get bot message"))
}

// =============================================================================
// Store implementations
// =============================================================================

#[async_trait]
impl TransactionStore for SqliteRepository {
    async fn insert(&self, new: NewTransaction) -> Result<Transaction, RepositoryError> {
        self.with_conn("insert transaction", move |conn| {
            conn.execute(
                "INSERT INTO transactions (seller, buyer, wine, price_pence, creation_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.seller.0 as i64,
                    new.buyer.0 as i64,
                    new.wine,
                    new.price.pence(),
                    timestamp(&new.creation_date)
                ],
            )
            .map_err(storage("insert transaction"))?;
            let id = TransactionId(conn.last_insert_rowid());
            Ok(Transaction::from_new(id, new))
        })
        .await
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, RepositoryError> {
        self.with_conn("get transaction", move |conn| select_transaction(conn, id))
            .await
    }

    async fn save(
        &self,
        tx: &Transaction,
        changed: Option<&[TransactionField]>,
    ) -> Result<Transaction, RepositoryError> {
        let fields: Vec<TransactionField> = changed
            .map(|c| c.to_vec())
            .unwrap_or_else(|| TransactionField::ALL.to_vec());
        let id = tx.id;
        let mut values: Vec<Value> = fields.iter().map(|f| field_value(tx, *f)).collect();

        self.with_conn("save transaction", move |conn| {
            if !fields.is_empty() {
                let assignments: Vec<String> = fields
                    .iter()
                    .enumerate()
                    .map(|(i, f)| format!("{} = ?{}", f.column(), i + 1))
                    .collect();
                values.push(Value::Integer(id.0));
                let sql = format!(
                    "UPDATE transactions SET {} WHERE id = ?{}",
                    assignments.join(", "),
                    fields.len() + 1
                );
                let updated = conn
                    .execute(&sql, params_from_iter(values))
                    .map_err(storage("save transaction"))?;
                if updated == 0 {
                    return Err(RepositoryError::NotFound(format!("transaction {}", id)));
                }
            }
            select_transaction(conn, id)?
                .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", id)))
        })
        .await
    }

    async fn delete(&self, id: TransactionId) -> Result<(), RepositoryError> {
        self.with_conn("delete transaction", move |conn| {
            conn.execute("DELETE FROM transactions WHERE id = ?1", params![id.0])
                .map_err(storage("delete transaction"))?;
            Ok(())
        })
        .await
    }

    async fn list_completed_older_than(
        &self,
        hours: i64,
    ) -> Result<Vec<Transaction>, RepositoryError> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let completed = self
            .with_conn("list completed transactions", |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM transactions WHERE completed_date IS NOT NULL",
                        TRANSACTION_COLUMNS
                    ))
                    .map_err(storage("list completed transactions"))?;
                let rows = stmt
                    .query_map([], row_to_transaction)
                    .map_err(storage("list completed transactions"))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(storage("list completed transactions"))
            })
            .await?;

        // Compared in Rust rather than SQL: stored offsets need not be uniform.
        Ok(completed
            .into_iter()
            .filter(|tx| tx.completed_date.is_some_and(|done| done < cutoff))
            .collect())
    }

    async fn list(&self) -> Result<Vec<Transaction>, RepositoryError> {
        self.with_conn("list transactions", |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM transactions ORDER BY id",
                    TRANSACTION_COLUMNS
                ))
                .map_err(storage("list transactions"))?;
            let rows = stmt
                .query_map([], row_to_transaction)
                .map_err(storage("list transactions"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage("list transactions"))
        })
        .await
    }
}

#[async_trait]
impl ReminderStore for SqliteRepository {
    async fn get(&self, id: i64) -> Result<Option<Reminder>, RepositoryError> {
        self.with_conn("get reminder", move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM reminders WHERE id = ?1", REMINDER_COLUMNS),
                params![id],
                row_to_reminder,
            )
            .optional()
            .map_err(storage("get reminder"))
        })
        .await
    }

    async fn save(&self, new: NewReminder) -> Result<Reminder, RepositoryError> {
        self.with_conn("save reminder", move |conn| {
            conn.execute(
                "INSERT INTO reminders
                     (member, transaction_id, channel_id, status_filter, fire_at, creation_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.member.0 as i64,
                    new.transaction_id.0,
                    new.channel_id.0 as i64,
                    new.status_filter.map(|f| f.as_str()),
                    timestamp(&new.fire_at),
                    timestamp(&new.creation_date)
                ],
            )
            .map_err(storage("save reminder"))?;
            Ok(Reminder {
                id: conn.last_insert_rowid(),
                member: new.member,
                transaction_id: new.transaction_id,
                channel_id: new.channel_id,
                status_filter: new.status_filter,
                fire_at: new.fire_at,
                creation_date: new.creation_date,
            })
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Reminder>, RepositoryError> {
        self.with_conn("list reminders", |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM reminders ORDER BY id",
                    REMINDER_COLUMNS
                ))
                .map_err(storage("list reminders"))?;
            let rows = stmt
                .query_map([], row_to_reminder)
                .map_err(storage("list reminders"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage("list reminders"))
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        self.with_conn("delete reminder", move |conn| {
            conn.execute("DELETE FROM reminders WHERE id = ?1", params![id])
                .map_err(storage("delete reminder"))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BotMessageStore for SqliteRepository {
    async fn add(&self, new: NewBotMessage) -> Result<BotMessage, RepositoryError> {
        self.with_conn("add bot message", move |conn| {
            conn.execute(
                "INSERT INTO bot_messages
                     (message_id, channel_id, guild_id, transaction_id, creation_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.message_id.0 as i64,
                    new.channel_id.0 as i64,
                    new.guild_id.map(|g| g.0 as i64),
                    new.transaction_id.0,
                    timestamp(&new.creation_date)
                ],
            )
            .map_err(storage("add bot message"))?;
            select_bot_message(conn, conn.last_insert_rowid())
        })
        .await
    }

    async fn find_by_platform_message_id(
        &self,
        message_id: MessageId,
    ) -> Result<Option<BotMessage>, RepositoryError> {
        self.with_conn("find bot message", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM bot_messages WHERE message_id = ?1 ORDER BY id DESC LIMIT 1",
                    BOT_MESSAGE_COLUMNS
                ),
                params![message_id.0 as i64],
                row_to_bot_message,
            )
            .optional()
            .map_err(storage("find bot message"))
        })
        .await
    }

    async fn latest_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<BotMessage>, RepositoryError> {
        self.with_conn("latest bot message", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM bot_messages WHERE transaction_id = ?1
                     ORDER BY id DESC LIMIT 1",
                    BOT_MESSAGE_COLUMNS
                ),
                params![transaction_id.0],
                row_to_bot_message,
            )
            .optional()
            .map_err(storage("latest bot message"))
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        self.with_conn("delete bot message", move |conn| {
            conn.execute("DELETE FROM bot_messages WHERE id = ?1", params![id])
                .map_err(storage("delete bot message"))?;
            Ok(())
        })
        .await
    }

    async fn delete_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<usize, RepositoryError> {
        self.with_conn("delete bot messages", move |conn| {
            conn.execute(
                "DELETE FROM bot_messages WHERE transaction_id = ?1",
                params![transaction_id.0],
            )
            .map_err(storage("delete bot messages"))
        })
        .await
    }
}
