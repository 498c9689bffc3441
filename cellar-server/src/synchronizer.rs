//! Keeps one live status message per transaction.
//!
//! Publishing is a short saga: send the new message, record it, then retire
//! the previous one. A failure to record is compensated by withdrawing the
//! message that was just sent. A failure to retire the previous message is
//! tolerated; the new status always wins.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::channel::{NotificationChannel, TransportError};
use crate::repository::{BotMessageStore, RepositoryError};
use cellar_core::{render_status, BotMessage, ChannelId, GuildId, NewBotMessage, Transaction};

/// Errors surfaced by `publish`.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to send status message: {0}")]
    Send(#[source] TransportError),

    #[error("failed to record status message, message withdrawn: {0}")]
    Record(#[source] RepositoryError),

    #[error(
        "failed to record status message ({record}) and failed to withdraw it ({delete})"
    )]
    Compensation {
        record: RepositoryError,
        delete: TransportError,
    },
}

pub struct StatusMessageSynchronizer {
    channel: Arc<dyn NotificationChannel>,
    messages: Arc<dyn BotMessageStore>,
    replace_previous: bool,
}

impl StatusMessageSynchronizer {
    pub fn new(
        channel: Arc<dyn NotificationChannel>,
        messages: Arc<dyn BotMessageStore>,
        replace_previous: bool,
    ) -> Self {
        Self {
            channel,
            messages,
            replace_previous,
        }
    }

    /// Post the current status of `tx` to `channel` and retire `previous`.
    ///
    /// Makes at most one send, one record, one delete and one row delete.
    /// Returns the newly recorded message.
    pub async fn publish(
        &self,
        tx: &Transaction,
        channel: ChannelId,
        guild: Option<GuildId>,
        previous: Option<&BotMessage>,
    ) -> Result<BotMessage, PublishError> {
        let text = render_status(tx);

        let message_id = self
            .channel
            .send(channel, &text, &[])
            .await
            .map_err(PublishError::Send)?;
        debug!(
            "Posted status message {} for transaction {}",
            message_id, tx.id
        );

        let recorded = self
            .messages
            .add(NewBotMessage {
                message_id,
                channel_id: channel,
                guild_id: guild,
                transaction_id: tx.id,
                creation_date: Utc::now(),
            })
            .await;

        let recorded = match recorded {
            Ok(recorded) => recorded,
            Err(record) => {
                warn!(
                    "Failed to record status message {} for transaction {}: {}; withdrawing it",
                    message_id, tx.id, record
                );
                return Err(match self.channel.delete(channel, message_id).await {
                    Ok(()) | Err(TransportError::NotFound) => PublishError::Record(record),
                    Err(delete) => {
                        error!(
                            "Failed to withdraw unrecorded status message {}: {}",
                            message_id, delete
                        );
                        PublishError::Compensation { record, delete }
                    }
                });
            }
        };

        if let Some(previous) = previous.filter(|_| self.replace_previous) {
            self.retire(previous).await;
        }

        info!(
            "Published status for transaction {} ({})",
            tx.id,
            tx.state()
        );
        Ok(recorded)
    }

    /// Delete a superseded message and its row. Never fails the publish.
    async fn retire(&self, previous: &BotMessage) {
        match self
            .channel
            .delete(previous.channel_id, previous.message_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_resolved() => {
                info!(
                    "Previous status message {} already gone ({}), dropping its record",
                    previous.message_id, e
                );
            }
            Err(e) => {
                warn!(
                    "Failed to delete previous status message {}: {}; keeping its record",
                    previous.message_id, e
                );
                return;
            }
        }

        if let Err(e) = self.messages.delete(previous.id).await {
            warn!(
                "Failed to delete record of status message {}: {}",
                previous.message_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{ChannelCall, FakeChannel};
    use crate::repository::InMemoryRepository;
    use async_trait::async_trait;
    use cellar_core::{MemberId, MessageId, NewTransaction, TransactionId};

    /// Message store whose `add` always fails.
    struct FailingMessages;

    #[async_trait]
    impl BotMessageStore for FailingMessages {
        async fn add(&self, _new: NewBotMessage) -> Result<BotMessage, RepositoryError> {
            Err(RepositoryError::storage("add bot message", "disk full"))
        }

        async fn find_by_platform_message_id(
            &self,
            _message_id: MessageId,
        ) -> Result<Option<BotMessage>, RepositoryError> {
            Ok(None)
        }

        async fn latest_for_transaction(
            &self,
            _transaction_id: TransactionId,
        ) -> Result<Option<BotMessage>, RepositoryError> {
            Ok(None)
        }

        async fn delete(&self, _id: i64) -> Result<(), RepositoryError> {
            Ok(())
        }

        async fn delete_for_transaction(
            &self,
            _transaction_id: TransactionId,
        ) -> Result<usize, RepositoryError> {
            Ok(0)
        }
    }

    const CHANNEL: ChannelId = ChannelId(10);

    fn sale() -> Transaction {
        Transaction::from_new(
            TransactionId(7),
            NewTransaction {
                seller: MemberId(1),
                buyer: MemberId(2),
                wine: "Chianti".to_string(),
                price: "12.50".parse().unwrap(),
                creation_date: Utc::now(),
            },
        )
    }

    fn setup(replace: bool) -> (Arc<FakeChannel>, Arc<InMemoryRepository>, StatusMessageSynchronizer) {
        let channel = Arc::new(FakeChannel::new());
        let repo = Arc::new(InMemoryRepository::new());
        let sync = StatusMessageSynchronizer::new(channel.clone(), repo.clone(), replace);
        (channel, repo, sync)
    }

    #[tokio::test]
    async fn test_publish_sends_and_records() {
        let (channel, repo, sync) = setup(true);
        let tx = sale();

        let recorded = sync.publish(&tx, CHANNEL, None, None).await.unwrap();

        assert_eq!(recorded.transaction_id, tx.id);
        assert!(channel.is_live(recorded.message_id).await);
        let texts = channel.sent_texts().await;
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Chianti"));
        assert!(texts[0].contains("£12.50"));
        assert_eq!(
            repo.latest_for_transaction(tx.id).await.unwrap(),
            Some(recorded)
        );
        // Status updates never notify the parties they mention.
        assert!(matches!(
            channel.calls().await.as_slice(),
            [ChannelCall::Send { ping, .. }] if ping.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_publish_replaces_previous_message() {
        let (channel, repo, sync) = setup(true);
        let tx = sale();

        let first = sync.publish(&tx, CHANNEL, None, None).await.unwrap();
        let second = sync.publish(&tx, CHANNEL, None, Some(&first)).await.unwrap();

        assert!(!channel.is_live(first.message_id).await);
        assert!(channel.is_live(second.message_id).await);
        assert!(repo
            .find_by_platform_message_id(first.message_id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            repo.latest_for_transaction(tx.id).await.unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_previous_not_found_still_records_new_message() {
        let (channel, repo, sync) = setup(true);
        let tx = sale();

        let first = sync.publish(&tx, CHANNEL, None, None).await.unwrap();
        // Someone removed the old message by hand.
        channel.live.lock().await.remove(&first.message_id);

        let second = sync.publish(&tx, CHANNEL, None, Some(&first)).await.unwrap();

        assert!(channel.is_live(second.message_id).await);
        assert!(repo
            .find_by_platform_message_id(second.message_id)
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .find_by_platform_message_id(first.message_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_previous_delete_failure_keeps_stale_row() {
        let (channel, repo, sync) = setup(true);
        let tx = sale();

        let first = sync.publish(&tx, CHANNEL, None, None).await.unwrap();
        channel
            .fail_next_delete(TransportError::other("gateway timeout"))
            .await;

        let second = sync.publish(&tx, CHANNEL, None, Some(&first)).await.unwrap();

        assert!(channel.is_live(first.message_id).await);
        assert!(repo
            .find_by_platform_message_id(first.message_id)
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            repo.latest_for_transaction(tx.id).await.unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_replacement_disabled_leaves_previous() {
        let (channel, _repo, sync) = setup(false);
        let tx = sale();

        let first = sync.publish(&tx, CHANNEL, None, None).await.unwrap();
        sync.publish(&tx, CHANNEL, None, Some(&first)).await.unwrap();

        assert!(channel.is_live(first.message_id).await);
        assert!(!channel
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, ChannelCall::Delete { .. })));
    }

    #[tokio::test]
    async fn test_send_failure_records_nothing() {
        let (channel, repo, sync) = setup(true);
        let tx = sale();
        channel.fail_next_send(TransportError::Forbidden).await;

        let result = sync.publish(&tx, CHANNEL, None, None).await;

        assert!(matches!(result, Err(PublishError::Send(TransportError::Forbidden))));
        assert!(repo.latest_for_transaction(tx.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_failure_withdraws_sent_message() {
        let channel = Arc::new(FakeChannel::new());
        let sync = StatusMessageSynchronizer::new(channel.clone(), Arc::new(FailingMessages), true);

        let result = sync.publish(&sale(), CHANNEL, None, None).await;

        assert!(matches!(result, Err(PublishError::Record(_))));
        assert!(channel.live.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_record_and_withdraw_failure_reports_both() {
        let channel = Arc::new(FakeChannel::new());
        let sync = StatusMessageSynchronizer::new(channel.clone(), Arc::new(FailingMessages), true);
        channel.fail_next_delete(TransportError::Forbidden).await;

        let result = sync.publish(&sale(), CHANNEL, None, None).await;

        match result {
            Err(PublishError::Compensation { record, delete }) => {
                assert!(matches!(record, RepositoryError::Storage { .. }));
                assert_eq!(delete, TransportError::Forbidden);
            }
            other => panic!("expected compensation error, got {:?}", other),
        }
        assert_eq!(channel.live.lock().await.len(), 1);
    }
}
