//! Turns reactions on status messages into lifecycle actions.
//!
//! Each event passes a chain of gates (known emoji, allowed channel, one of
//! our status messages, a party to the sale). Any gate that fails ends the
//! event silently. Events that pass are marked with a processing reaction
//! while the action runs; the marker is removed on every exit path.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::channel::{NotificationChannel, TransportError};
use crate::ledger::{Action, Destination, Ledger, LedgerError};
use crate::reminders::{ReminderError, ReminderScheduler};
use cellar_core::reaction::PROCESSING_EMOJI;
use cellar_core::{
    BotMessage, ChannelId, GuildId, MemberId, MessageId, ReactionKind, StatusFilter, Transaction,
};

/// A reaction added to a message on the chat surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEvent {
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub user_id: MemberId,
    pub emoji: String,
}

/// Settings for the dispatcher's gates and defaults.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub bot_user: MemberId,
    /// Channels reactions are accepted from. Empty accepts any channel.
    pub allowed_channels: HashSet<ChannelId>,
    pub reminder_delay: chrono::Duration,
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Reminder(#[from] ReminderError),
}

pub struct ReactionDispatcher {
    ledger: Arc<Ledger>,
    reminders: Arc<ReminderScheduler>,
    channel: Arc<dyn NotificationChannel>,
    settings: DispatcherSettings,
}

impl ReactionDispatcher {
    pub fn new(
        ledger: Arc<Ledger>,
        reminders: Arc<ReminderScheduler>,
        channel: Arc<dyn NotificationChannel>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            ledger,
            reminders,
            channel,
            settings,
        }
    }

    /// Consume events until the sender side closes, one task per event.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ReactionEvent>) {
        info!("Reaction dispatcher started");
        while let Some(event) = events.recv().await {
            let correlation_id = Uuid::new_v4();
            let span = info_span!("reaction", %correlation_id, message_id = %event.message_id);
            let this = self.clone();
            tokio::spawn(
                async move {
                    this.handle(&event).await;
                }
                .instrument(span),
            );
        }
        info!("Reaction dispatcher stopped");
    }

    /// Handle one reaction. Returns true if it was acted on.
    pub async fn handle(&self, event: &ReactionEvent) -> bool {
        let Some(kind) = ReactionKind::from_emoji(&event.emoji) else {
            debug!("Ignoring unrelated emoji {}", event.emoji);
            return false;
        };

        if !self.channel_allowed(event.channel_id) {
            debug!("Ignoring reaction in channel {}", event.channel_id);
            return false;
        }

        let Some((message, tx)) = self.resolve(event.message_id).await else {
            return false;
        };

        let actor = event.user_id;
        if actor == self.settings.bot_user || !tx.is_party(actor) {
            debug!("Ignoring reaction by {} on transaction {}", actor, tx.id);
            return false;
        }

        info!(
            "{} reacted {} on transaction {}",
            actor,
            kind.emoji(),
            tx.id
        );

        if let Err(e) = self
            .channel
            .add_reaction(event.channel_id, event.message_id, PROCESSING_EMOJI)
            .await
        {
            warn!("Failed to add processing marker: {}", e);
        }

        let result = self.dispatch(kind, actor, &message, &tx, event).await;

        // The status message may already have been replaced and deleted.
        match self
            .channel
            .remove_reaction(event.channel_id, event.message_id, PROCESSING_EMOJI)
            .await
        {
            Ok(()) | Err(TransportError::NotFound) => {}
            Err(e) => warn!("Failed to remove processing marker: {}", e),
        }

        if let Err(e) = result {
            self.report(actor, event.channel_id, e).await;
        }
        true
    }

    fn channel_allowed(&self, channel: ChannelId) -> bool {
        self.settings.allowed_channels.is_empty()
            || self.settings.allowed_channels.contains(&channel)
    }

    /// Find the status message and its transaction.
    async fn resolve(&self, message_id: MessageId) -> Option<(BotMessage, Transaction)> {
        let message = match self.ledger.message(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Message {} is not a status message", message_id);
                return None;
            }
            Err(e) => {
                error!("Failed to look up message {}: {}", message_id, e);
                return None;
            }
        };

        match self.ledger.lookup(message.transaction_id).await {
            Ok(Some(tx)) => Some((message, tx)),
            Ok(None) => {
                debug!(
                    "Status message {} refers to missing transaction {}",
                    message_id, message.transaction_id
                );
                None
            }
            Err(e) => {
                error!(
                    "Failed to load transaction {}: {}",
                    message.transaction_id, e
                );
                None
            }
        }
    }

    async fn dispatch(
        &self,
        kind: ReactionKind,
        actor: MemberId,
        message: &BotMessage,
        tx: &Transaction,
        event: &ReactionEvent,
    ) -> Result<(), DispatchError> {
        match Action::from_reaction(kind) {
            Some(action) => {
                let destination = Destination::from(message);
                self.ledger
                    .apply(tx.id, action, actor, Some(destination))
                    .await?;
            }
            None => {
                let fire_at = Utc::now() + self.settings.reminder_delay;
                self.reminders
                    .create_reminder(
                        actor,
                        tx.id,
                        event.channel_id,
                        Some(StatusFilter::Completed),
                        fire_at,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Log a failure and tell the member when it was their request at fault.
    async fn report(&self, actor: MemberId, channel: ChannelId, error: DispatchError) {
        let DispatchError::Ledger(LedgerError::Domain(domain)) = &error else {
            error!("Failed to handle reaction by {}: {}", actor, error);
            return;
        };

        info!("Rejected reaction by {}: {}", actor, domain);
        let text = format!("⚠️ {}, {}.", actor.mention(), domain);
        if let Err(e) = self.channel.send(channel, &text, &[actor]).await {
            warn!("Failed to report rejection to {}: {}", actor, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TransactionCache;
    use crate::channel::testing::{ChannelCall, FakeChannel};
    use crate::repository::{InMemoryRepository, ReminderStore, TransactionStore};
    use crate::scheduler::{JobScheduler, TokioScheduler};
    use crate::synchronizer::StatusMessageSynchronizer;
    use cellar_core::reaction::{
        APPROVE_EMOJI, CANCEL_EMOJI, DELIVERED_EMOJI, PAID_EMOJI, REMINDER_EMOJI,
    };
    use cellar_core::render::{CANCEL_HINT, REMINDER_HINT};
    use cellar_core::{TransactionId, TransactionState};
    use std::time::Duration;

    const SELLER: MemberId = MemberId(1);
    const BUYER: MemberId = MemberId(2);
    const STRANGER: MemberId = MemberId(3);
    const BOT: MemberId = MemberId(999);
    const MARKET: ChannelId = ChannelId(10);
    const ELSEWHERE: ChannelId = ChannelId(11);

    struct Fixture {
        channel: Arc<FakeChannel>,
        repo: Arc<InMemoryRepository>,
        scheduler: Arc<TokioScheduler>,
        ledger: Arc<Ledger>,
        dispatcher: Arc<ReactionDispatcher>,
    }

    fn fixture() -> Fixture {
        let channel = Arc::new(FakeChannel::new());
        let repo = Arc::new(InMemoryRepository::new());
        let scheduler = Arc::new(TokioScheduler::new(Duration::from_secs(60)));
        let sync = StatusMessageSynchronizer::new(channel.clone(), repo.clone(), true);
        let cache = Arc::new(TransactionCache::new(Duration::from_secs(60), 16));
        let ledger = Arc::new(Ledger::new(repo.clone(), repo.clone(), sync, cache));
        let reminders = ReminderScheduler::new(
            repo.clone(),
            repo.clone(),
            channel.clone(),
            scheduler.clone(),
        );
        let dispatcher = Arc::new(ReactionDispatcher::new(
            ledger.clone(),
            reminders,
            channel.clone(),
            DispatcherSettings {
                bot_user: BOT,
                allowed_channels: HashSet::from([MARKET]),
                reminder_delay: chrono::Duration::hours(24),
            },
        ));
        Fixture {
            channel,
            repo,
            scheduler,
            ledger,
            dispatcher,
        }
    }

    /// Open a sale and return its id and current status message.
    async fn open_sale(f: &Fixture) -> (TransactionId, MessageId) {
        let outcome = f
            .ledger
            .open_sale(
                SELLER,
                BUYER,
                "Chianti",
                "12.50".parse().unwrap(),
                Destination {
                    channel: MARKET,
                    guild: None,
                },
            )
            .await
            .unwrap();
        (
            outcome.transaction.id,
            outcome.published.unwrap().message_id,
        )
    }

    fn reaction(message: MessageId, user: MemberId, emoji: &str) -> ReactionEvent {
        ReactionEvent {
            guild_id: None,
            channel_id: MARKET,
            message_id: message,
            user_id: user,
            emoji: emoji.to_string(),
        }
    }

    async fn current_message(f: &Fixture, id: TransactionId) -> MessageId {
        f.ledger
            .latest_message(id)
            .await
            .unwrap()
            .unwrap()
            .message_id
    }

    async fn stored(f: &Fixture, id: TransactionId) -> Transaction {
        TransactionStore::get(&*f.repo, id).await.unwrap().unwrap()
    }

    // =========================================================================
    // Gates
    // =========================================================================

    #[tokio::test]
    async fn test_unrelated_emoji_is_ignored() {
        let f = fixture();
        let (_, message) = open_sale(&f).await;
        assert!(!f.dispatcher.handle(&reaction(message, BUYER, "🍕")).await);
    }

    #[tokio::test]
    async fn test_other_channel_is_ignored() {
        let f = fixture();
        let (_, message) = open_sale(&f).await;
        let mut event = reaction(message, BUYER, APPROVE_EMOJI);
        event.channel_id = ELSEWHERE;
        assert!(!f.dispatcher.handle(&event).await);
    }

    #[tokio::test]
    async fn test_unknown_message_is_ignored() {
        let f = fixture();
        open_sale(&f).await;
        assert!(!f.dispatcher.handle(&reaction(MessageId(1), BUYER, APPROVE_EMOJI)).await);
    }

    #[tokio::test]
    async fn test_strangers_and_bot_are_ignored() {
        let f = fixture();
        let (id, message) = open_sale(&f).await;

        assert!(!f.dispatcher.handle(&reaction(message, STRANGER, APPROVE_EMOJI)).await);
        assert!(!f.dispatcher.handle(&reaction(message, BOT, APPROVE_EMOJI)).await);
        assert!(!stored(&f, id).await.sale_approved);
        assert!(!f
            .channel
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, ChannelCall::AddReaction { .. })));
    }

    // =========================================================================
    // Processing marker
    // =========================================================================

    #[tokio::test]
    async fn test_processing_marker_removed_after_domain_error() {
        let f = fixture();
        let (id, message) = open_sale(&f).await;

        // Only the buyer may approve.
        assert!(f.dispatcher.handle(&reaction(message, SELLER, APPROVE_EMOJI)).await);

        let calls = f.channel.calls().await;
        assert!(calls.contains(&ChannelCall::AddReaction {
            message,
            emoji: PROCESSING_EMOJI.to_string()
        }));
        assert!(calls.contains(&ChannelCall::RemoveReaction {
            message,
            emoji: PROCESSING_EMOJI.to_string()
        }));
        assert!(!stored(&f, id).await.sale_approved);

        let texts = f.channel.sent_texts().await;
        assert_eq!(texts.last().unwrap(), "⚠️ <@1>, only the buyer can do that.");
        assert!(matches!(
            calls.last(),
            Some(ChannelCall::Send { ping, .. }) if ping == &vec![SELLER]
        ));
    }

    #[tokio::test]
    async fn test_processing_marker_removed_after_publish_failure() {
        let f = fixture();
        let (id, message) = open_sale(&f).await;
        f.channel
            .fail_next_send(TransportError::other("gateway timeout"))
            .await;

        assert!(f.dispatcher.handle(&reaction(message, BUYER, APPROVE_EMOJI)).await);

        let calls = f.channel.calls().await;
        assert!(calls.contains(&ChannelCall::RemoveReaction {
            message,
            emoji: PROCESSING_EMOJI.to_string()
        }));
        // The transition was persisted; only the new status message is missing.
        assert!(stored(&f, id).await.sale_approved);
        assert_eq!(current_message(&f, id).await, message);
        // Infrastructure failures are logged, not reported to the member.
        assert_eq!(f.channel.sent_texts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reactions_leave_one_status_message() {
        let f = fixture();
        let (id, first) = open_sale(&f).await;
        assert!(f.dispatcher.handle(&reaction(first, BUYER, APPROVE_EMOJI)).await);
        let approved = current_message(&f, id).await;

        // Both handlers resolve the same status message before either commits.
        *f.channel.reaction_latency.lock().await = Duration::from_millis(20);
        let buyer = reaction(approved, BUYER, PAID_EMOJI);
        let seller = reaction(approved, SELLER, PAID_EMOJI);
        let (a, b) = tokio::join!(f.dispatcher.handle(&buyer), f.dispatcher.handle(&seller));
        assert!(a && b);

        let tx = stored(&f, id).await;
        assert!(tx.fully_paid());
        assert!(tx.paid_date.is_some());

        let live = f.channel.live.lock().await.clone();
        assert_eq!(live.len(), 1);
        assert!(live.contains(&current_message(&f, id).await));
        assert!(f
            .channel
            .sent_texts()
            .await
            .last()
            .unwrap()
            .contains("✅ Payment confirmed"));
    }

    #[tokio::test]
    async fn test_cancel_before_approval() {
        let f = fixture();
        let (id, message) = open_sale(&f).await;

        assert!(f.dispatcher.handle(&reaction(message, SELLER, CANCEL_EMOJI)).await);

        let tx = stored(&f, id).await;
        assert_eq!(tx.state(), TransactionState::Cancelled);
        let texts = f.channel.sent_texts().await;
        assert!(texts.last().unwrap().contains("Sale Cancelled"));
    }

    #[tokio::test]
    async fn test_reminder_reaction_schedules_completed_filter() {
        let f = fixture();
        let (id, message) = open_sale(&f).await;

        assert!(f.dispatcher.handle(&reaction(message, BUYER, REMINDER_EMOJI)).await);

        let reminders = ReminderStore::list(&*f.repo).await.unwrap();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].transaction_id, id);
        assert_eq!(reminders[0].member, BUYER);
        assert_eq!(reminders[0].status_filter, Some(StatusFilter::Completed));
        assert_eq!(
            f.scheduler.scheduled_keys(),
            vec![format!("reminder:{}", reminders[0].id)]
        );
    }

    // =========================================================================
    // End to end
    // =========================================================================

    #[tokio::test]
    async fn test_full_sale_lifecycle() {
        let f = fixture();
        let (id, first) = open_sale(&f).await;

        let opening = f.channel.sent_texts().await;
        assert!(opening[0].contains("Chianti"));
        assert!(opening[0].contains("£12.50"));
        assert_eq!(stored(&f, id).await.state(), TransactionState::Open);

        assert!(f.dispatcher.handle(&reaction(first, BUYER, APPROVE_EMOJI)).await);
        assert_eq!(stored(&f, id).await.state(), TransactionState::Approved);
        assert!(!f.channel.is_live(first).await);
        let approved = current_message(&f, id).await;
        assert_ne!(approved, first);
        assert!(f.channel.is_live(approved).await);

        assert!(f.dispatcher.handle(&reaction(approved, BUYER, PAID_EMOJI)).await);
        assert!(stored(&f, id).await.paid_date.is_none());
        let half_paid = current_message(&f, id).await;
        assert!(f.dispatcher.handle(&reaction(half_paid, SELLER, PAID_EMOJI)).await);
        let tx = stored(&f, id).await;
        assert!(tx.fully_paid());
        assert!(tx.paid_date.is_some());
        let paid_text = f.channel.sent_texts().await.last().unwrap().clone();
        assert!(paid_text.contains("✅ Payment confirmed"));

        let paid = current_message(&f, id).await;
        assert!(f.dispatcher.handle(&reaction(paid, BUYER, DELIVERED_EMOJI)).await);
        let half_delivered = current_message(&f, id).await;
        assert!(f.dispatcher.handle(&reaction(half_delivered, SELLER, DELIVERED_EMOJI)).await);

        let tx = stored(&f, id).await;
        assert_eq!(tx.state(), TransactionState::Completed);
        let final_text = f.channel.sent_texts().await.last().unwrap().clone();
        assert!(final_text.contains("Sale Completed"));
        assert!(!final_text.contains(CANCEL_HINT));
        assert!(!final_text.contains(REMINDER_HINT));
        assert_eq!(f.channel.live.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_run_consumes_queue() {
        let f = fixture();
        let (id, message) = open_sale(&f).await;

        let (sender, receiver) = mpsc::channel(8);
        let runner = tokio::spawn(f.dispatcher.clone().run(receiver));
        sender
            .send(reaction(message, BUYER, APPROVE_EMOJI))
            .await
            .unwrap();
        drop(sender);
        runner.await.unwrap();

        // Spawned handlers may still be finishing.
        for _ in 0..50 {
            if stored(&f, id).await.sale_approved {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stored(&f, id).await.sale_approved);
    }
}
