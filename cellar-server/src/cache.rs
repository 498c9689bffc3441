//! Bounded, time-limited cache of transactions for the reaction path.
//!
//! Writers must call `invalidate` after persisting a change; the cache never
//! refreshes entries on its own.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use cellar_core::{Transaction, TransactionId};

pub struct TransactionCache {
    entries: RwLock<HashMap<TransactionId, (Transaction, Instant)>>,
    ttl: Duration,
    capacity: usize,
}

impl TransactionCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Get a cached transaction if present and not expired.
    pub async fn get(&self, id: TransactionId) -> Option<Transaction> {
        let entries = self.entries.read().await;
        match entries.get(&id) {
            Some((tx, inserted)) if inserted.elapsed() < self.ttl => Some(tx.clone()),
            _ => None,
        }
    }

    /// Cache a transaction, evicting expired entries and then the oldest if full.
    pub async fn insert(&self, tx: Transaction) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, (_, inserted)| inserted.elapsed() < ttl);

        if entries.len() >= self.capacity && !entries.contains_key(&tx.id) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, inserted))| *inserted)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(tx.id, (tx, Instant::now()));
    }

    pub async fn invalidate(&self, id: TransactionId) {
        self.entries.write().await.remove(&id);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
