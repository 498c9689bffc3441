//! Periodic removal of completed sales.
//!
//! A completed transaction is kept for a configurable number of hours after
//! completion, then deleted along with the records of its status messages.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{error, info};

use crate::ledger::{Ledger, LedgerError};
use crate::repository::TransactionStore;
use crate::scheduler::{Job, JobScheduler};

/// Scheduler key of the sweep job.
pub const RETENTION_JOB_KEY: &str = "retention";

pub struct RetentionSweeper {
    transactions: Arc<dyn TransactionStore>,
    ledger: Arc<Ledger>,
    retention_hours: i64,
}

impl RetentionSweeper {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        ledger: Arc<Ledger>,
        retention_hours: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            transactions,
            ledger,
            retention_hours,
        })
    }

    /// Delete every transaction completed more than `retention_hours` ago.
    ///
    /// Returns the number of transactions removed. A failure on one
    /// transaction is logged and does not stop the sweep.
    pub async fn sweep(&self) -> Result<usize, LedgerError> {
        let expired = self
            .transactions
            .list_completed_older_than(self.retention_hours)
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for tx in expired {
            match self.ledger.purge(tx.id).await {
                Ok(messages) => {
                    info!(
                        "Removed transaction {} and {} status message record(s)",
                        tx.id, messages
                    );
                    removed += 1;
                }
                Err(e) => error!("Failed to remove transaction {}: {}", tx.id, e),
            }
        }
        Ok(removed)
    }

    /// Run the sweep on a fixed interval, starting immediately.
    pub fn schedule(self: &Arc<Self>, scheduler: &dyn JobScheduler, every: Duration) {
        let this = self.clone();
        let job: Job = Arc::new(move || {
            let this = this.clone();
            async move {
                if let Err(e) = this.sweep().await {
                    error!("Retention sweep failed: {}", e);
                }
            }
            .boxed()
        });
        scheduler.schedule_interval(RETENTION_JOB_KEY, every, job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TransactionCache;
    use crate::channel::testing::FakeChannel;
    use crate::ledger::Destination;
    use crate::repository::{BotMessageStore, InMemoryRepository};
    use crate::scheduler::TokioScheduler;
    use crate::synchronizer::StatusMessageSynchronizer;
    use cellar_core::{ChannelId, MemberId, TransactionId};
    use chrono::Utc;

    fn setup() -> (Arc<InMemoryRepository>, Arc<Ledger>, Arc<RetentionSweeper>) {
        let channel = Arc::new(FakeChannel::new());
        let repo = Arc::new(InMemoryRepository::new());
        let sync = StatusMessageSynchronizer::new(channel, repo.clone(), true);
        let cache = Arc::new(TransactionCache::new(Duration::from_secs(60), 16));
        let ledger = Arc::new(Ledger::new(repo.clone(), repo.clone(), sync, cache));
        let sweeper = RetentionSweeper::new(repo.clone(), ledger.clone(), 168);
        (repo, ledger, sweeper)
    }

    async fn sale(ledger: &Ledger) -> TransactionId {
        ledger
            .open_sale(
                MemberId(1),
                MemberId(2),
                "Rioja",
                "15".parse().unwrap(),
                Destination {
                    channel: ChannelId(10),
                    guild: None,
                },
            )
            .await
            .unwrap()
            .transaction
            .id
    }

    async fn complete_at(repo: &InMemoryRepository, id: TransactionId, hours_ago: i64) {
        let mut tx = TransactionStore::get(repo, id).await.unwrap().unwrap();
        tx.sale_approved = true;
        tx.buyer_paid = true;
        tx.seller_paid = true;
        tx.buyer_delivered = true;
        tx.seller_delivered = true;
        tx.completed_date = Some(Utc::now() - chrono::Duration::hours(hours_ago));
        TransactionStore::save(repo, &tx, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (repo, ledger, sweeper) = setup();
        let old = sale(&ledger).await;
        let recent = sale(&ledger).await;
        let open = sale(&ledger).await;
        complete_at(&repo, old, 200).await;
        complete_at(&repo, recent, 2).await;

        assert_eq!(sweeper.sweep().await.unwrap(), 1);

        assert!(TransactionStore::get(&*repo, old).await.unwrap().is_none());
        assert!(repo.latest_for_transaction(old).await.unwrap().is_none());
        assert!(TransactionStore::get(&*repo, recent).await.unwrap().is_some());
        assert!(TransactionStore::get(&*repo, open).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_expired() {
        let (_repo, ledger, sweeper) = setup();
        sale(&ledger).await;
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schedule_registers_interval_job() {
        let (repo, ledger, sweeper) = setup();
        let old = sale(&ledger).await;
        complete_at(&repo, old, 500).await;

        let scheduler = TokioScheduler::new(Duration::from_secs(60));
        sweeper.schedule(&scheduler, Duration::from_secs(3600));
        assert!(scheduler.is_scheduled(RETENTION_JOB_KEY));

        // The first run happens straight away.
        for _ in 0..50 {
            if TransactionStore::get(&*repo, old).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(TransactionStore::get(&*repo, old).await.unwrap().is_none());
        scheduler.cancel(RETENTION_JOB_KEY);
    }
}
