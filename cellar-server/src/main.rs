use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, Level};

use cellar_server::api::app;
use cellar_server::channel::DiscordChannel;
use cellar_server::config::Config;
use cellar_server::repository::SqliteRepository;
use cellar_server::scheduler::{JobScheduler, TokioScheduler};
use cellar_server::{ServiceSettings, Services};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting cellar {}", cellar_server::get_bot_version());

    let config =
        Config::from_env().context("Failed to load configuration from environment variables")?;

    let db_path = config.state_dir.join("cellar-state.db");
    info!("Using state database: {}", db_path.display());
    let repository =
        Arc::new(SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?);

    let channel = DiscordChannel::new(&config.discord_api_base, config.discord_bot_token.clone())
        .context("DISCORD_API_BASE must be a valid URL")?;

    let scheduler: Arc<dyn JobScheduler> = Arc::new(TokioScheduler::new(config.misfire_grace));

    let services = Services::assemble(
        repository,
        Arc::new(channel),
        scheduler.clone(),
        ServiceSettings::from(&config),
    );

    if config.api_token.is_none() {
        info!("API_TOKEN not set, write endpoints are disabled");
    }

    // Reminders survive restarts; re-arm them before taking traffic.
    match services.state.reminders.refresh_reminders().await {
        Ok(count) => info!("Rescheduled {} stored reminders", count),
        Err(e) => error!("Failed to reschedule stored reminders: {}", e),
    }

    services
        .retention
        .schedule(scheduler.as_ref(), config.retention_interval);

    let dispatcher = services.dispatcher.clone();
    let events = services.events;
    tokio::spawn(async move {
        dispatcher.run(events).await;
    });

    let router = app(services.state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, router).await?;

    Ok(())
}
