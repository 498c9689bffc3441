//! Member-requested reminders about a sale.
//!
//! The reminder row is the source of truth; the scheduled job is a projection
//! of it that `refresh_reminders` rebuilds after a restart. At fire time the
//! transaction is re-read and the optional status filter is checked against
//! its current flags. A reminder whose filter became satisfied early still
//! fires, and is then suppressed rather than sent.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tracing::{error, info, warn};

use crate::channel::{NotificationChannel, TransportError};
use crate::repository::{ReminderStore, RepositoryError, TransactionStore};
use crate::scheduler::{Job, JobScheduler, ScheduleOutcome};
use cellar_core::{
    render_reminder, ChannelId, MemberId, NewReminder, Reminder, StatusFilter, TransactionId,
};

#[derive(Debug, thiserror::Error)]
pub enum ReminderError {
    #[error("storage failure: {0}")]
    Repository(#[from] RepositoryError),

    #[error("failed to deliver reminder: {0}")]
    Transport(#[from] TransportError),

    #[error("reminder time {0} has already passed")]
    Missed(DateTime<Utc>),
}

/// What happened when a reminder fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Sent,
    /// The filter was already satisfied; nothing was sent.
    Suppressed,
    /// The transaction no longer exists.
    TransactionGone,
    /// The reminder row was already consumed.
    Missing,
}

/// Scheduler key for a reminder's job.
pub fn job_key(reminder_id: i64) -> String {
    format!("reminder:{}", reminder_id)
}

pub struct ReminderScheduler {
    reminders: Arc<dyn ReminderStore>,
    transactions: Arc<dyn TransactionStore>,
    channel: Arc<dyn NotificationChannel>,
    scheduler: Arc<dyn JobScheduler>,
}

impl ReminderScheduler {
    pub fn new(
        reminders: Arc<dyn ReminderStore>,
        transactions: Arc<dyn TransactionStore>,
        channel: Arc<dyn NotificationChannel>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reminders,
            transactions,
            channel,
            scheduler,
        })
    }

    /// Persist a reminder and schedule its job.
    pub async fn create_reminder(
        self: &Arc<Self>,
        member: MemberId,
        transaction_id: TransactionId,
        channel_id: ChannelId,
        status_filter: Option<StatusFilter>,
        fire_at: DateTime<Utc>,
    ) -> Result<Reminder, ReminderError> {
        let reminder = self
            .reminders
            .save(NewReminder {
                member,
                transaction_id,
                channel_id,
                status_filter,
                fire_at,
                creation_date: Utc::now(),
            })
            .await?;

        match self.schedule(&reminder) {
            ScheduleOutcome::Scheduled => {
                info!(
                    "Reminder {} for {} on transaction {} scheduled at {}",
                    reminder.id, member, transaction_id, fire_at
                );
                Ok(reminder)
            }
            ScheduleOutcome::Missed => {
                self.reminders.delete(reminder.id).await?;
                Err(ReminderError::Missed(fire_at))
            }
        }
    }

    /// Reschedule a job for every stored reminder.
    ///
    /// Safe to call repeatedly: jobs are keyed by reminder id, so each call
    /// replaces rather than duplicates. Reminders already past the misfire
    /// grace are consumed; a failure to delete one is logged and the rest
    /// are still scheduled. Returns the number scheduled.
    pub async fn refresh_reminders(self: &Arc<Self>) -> Result<usize, ReminderError> {
        let reminders = self.reminders.list().await?;
        let mut scheduled = 0;

        for reminder in &reminders {
            match self.schedule(reminder) {
                ScheduleOutcome::Scheduled => scheduled += 1,
                ScheduleOutcome::Missed => {
                    warn!(
                        "Reminder {} was due at {} and is skipped",
                        reminder.id, reminder.fire_at
                    );
                    // Keep going: every later reminder still needs its job.
                    if let Err(e) = self.reminders.delete(reminder.id).await {
                        warn!("Failed to delete skipped reminder {}: {}", reminder.id, e);
                    }
                }
            }
        }

        info!(
            "Refreshed reminders: {} scheduled of {} stored",
            scheduled,
            reminders.len()
        );
        Ok(scheduled)
    }

    /// Fire a reminder: re-check the transaction and notify unless filtered.
    ///
    /// The reminder row is consumed whatever the outcome.
    pub async fn on_fire(&self, reminder_id: i64) -> Result<FireOutcome, ReminderError> {
        let Some(reminder) = self.reminders.get(reminder_id).await? else {
            warn!("Reminder {} fired but is no longer stored", reminder_id);
            return Ok(FireOutcome::Missing);
        };

        let Some(tx) = self.transactions.get(reminder.transaction_id).await? else {
            info!(
                "Reminder {} fired for deleted transaction {}",
                reminder.id, reminder.transaction_id
            );
            self.reminders.delete(reminder.id).await?;
            return Ok(FireOutcome::TransactionGone);
        };

        if let Some(filter) = reminder.status_filter {
            if filter.is_satisfied_by(&tx) {
                info!(
                    "Reminder {} suppressed: transaction {} is already {}",
                    reminder.id,
                    tx.id,
                    filter.as_str()
                );
                self.reminders.delete(reminder.id).await?;
                return Ok(FireOutcome::Suppressed);
            }
        }

        let text = render_reminder(&tx, reminder.member);
        let sent = self
            .channel
            .send(reminder.channel_id, &text, &[reminder.member])
            .await;
        self.reminders.delete(reminder.id).await?;

        match sent {
            Ok(message) => {
                info!(
                    "Reminder {} delivered to {} as message {}",
                    reminder.id, reminder.member, message
                );
                Ok(FireOutcome::Sent)
            }
            Err(e) => Err(ReminderError::Transport(e)),
        }
    }

    fn schedule(self: &Arc<Self>, reminder: &Reminder) -> ScheduleOutcome {
        let id = reminder.id;
        let this: Weak<Self> = Arc::downgrade(self);
        let job: Job = Arc::new(move || {
            let this = this.clone();
            async move {
                let Some(this) = this.upgrade() else {
                    return;
                };
                if let Err(e) = this.on_fire(id).await {
                    error!("Reminder {} failed: {}", id, e);
                }
            }
            .boxed()
        });
        self.scheduler
            .schedule_at(&job_key(reminder.id), reminder.fire_at, job)
    }
}
