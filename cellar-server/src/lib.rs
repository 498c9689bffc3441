pub mod api;
pub mod cache;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod help;
pub mod ledger;
pub mod locks;
pub mod reminders;
pub mod repository;
pub mod retention;
pub mod scheduler;
pub mod status;
pub mod synchronizer;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use cellar_core::{ChannelId, MemberId};
use channel::NotificationChannel;
use dispatcher::{DispatcherSettings, ReactionDispatcher, ReactionEvent};
use help::{init_help_registry, HelpRegistry};
use ledger::Ledger;
use reminders::ReminderScheduler;
use repository::{BotMessageStore, ReminderStore, TransactionStore};
use retention::RetentionSweeper;
use scheduler::JobScheduler;
use synchronizer::StatusMessageSynchronizer;

pub use cache::TransactionCache;
pub use config::Config;

/// Capacity of the inbound reaction queue.
pub const REACTION_QUEUE_CAPACITY: usize = 1024;

pub fn get_bot_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Shared state for HTTP handlers.
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub reminders: Arc<ReminderScheduler>,
    pub transactions: Arc<dyn TransactionStore>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub help: HelpRegistry,
    pub reactions: mpsc::Sender<ReactionEvent>,
    /// Bearer token for write endpoints. None disables them.
    pub api_token: Option<String>,
    pub reminder_delay: chrono::Duration,
}

/// Tunables for wiring the services together.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub bot_user: MemberId,
    pub allowed_channels: HashSet<ChannelId>,
    pub replace_status_messages: bool,
    pub reminder_delay: chrono::Duration,
    pub retention_hours: i64,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub api_token: Option<String>,
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            bot_user: config.bot_user_id,
            allowed_channels: config.market_channel_ids.clone(),
            replace_status_messages: config.replace_status_messages,
            reminder_delay: config.reminder_delay,
            retention_hours: config.retention_hours,
            cache_ttl: config.cache_ttl,
            cache_capacity: config.cache_capacity,
            api_token: config.api_token.clone(),
        }
    }
}

/// Every long-lived component, wired together.
pub struct Services {
    pub state: Arc<AppState>,
    pub dispatcher: Arc<ReactionDispatcher>,
    pub retention: Arc<RetentionSweeper>,
    /// Receiving end of the reaction queue; hand it to `ReactionDispatcher::run`.
    pub events: mpsc::Receiver<ReactionEvent>,
}

impl Services {
    pub fn assemble<R>(
        repo: Arc<R>,
        channel: Arc<dyn NotificationChannel>,
        scheduler: Arc<dyn JobScheduler>,
        settings: ServiceSettings,
    ) -> Self
    where
        R: TransactionStore + ReminderStore + BotMessageStore + 'static,
    {
        let transactions: Arc<dyn TransactionStore> = repo.clone();
        let messages: Arc<dyn BotMessageStore> = repo.clone();
        let reminder_store: Arc<dyn ReminderStore> = repo;

        let cache = Arc::new(TransactionCache::new(
            settings.cache_ttl,
            settings.cache_capacity,
        ));
        let synchronizer = StatusMessageSynchronizer::new(
            channel.clone(),
            messages.clone(),
            settings.replace_status_messages,
        );
        let ledger = Arc::new(Ledger::new(
            transactions.clone(),
            messages,
            synchronizer,
            cache,
        ));
        let reminders = ReminderScheduler::new(
            reminder_store,
            transactions.clone(),
            channel.clone(),
            scheduler.clone(),
        );
        let dispatcher = Arc::new(ReactionDispatcher::new(
            ledger.clone(),
            reminders.clone(),
            channel,
            DispatcherSettings {
                bot_user: settings.bot_user,
                allowed_channels: settings.allowed_channels,
                reminder_delay: settings.reminder_delay,
            },
        ));
        let retention =
            RetentionSweeper::new(transactions.clone(), ledger.clone(), settings.retention_hours);

        let (sender, events) = mpsc::channel(REACTION_QUEUE_CAPACITY);
        let state = Arc::new(AppState {
            ledger,
            reminders,
            transactions,
            scheduler,
            help: init_help_registry(),
            reactions: sender,
            api_token: settings.api_token,
            reminder_delay: settings.reminder_delay,
        });

        Self {
            state,
            dispatcher,
            retention,
            events,
        }
    }
}
