//! Help registry served at `/help`.
//!
//! Built once at startup by `init_help_registry` and shared read-only.

use serde::Serialize;
use serde_json::{json, Value};

use cellar_core::reaction::{PROCESSING_EMOJI, REMINDER_EMOJI};
use cellar_core::ReactionKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointHelp {
    pub path: &'static str,
    pub method: &'static str,
    pub description: &'static str,
    pub authentication: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionHelp {
    pub emoji: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Default)]
pub struct HelpRegistry {
    endpoints: Vec<EndpointHelp>,
    reactions: Vec<ReactionHelp>,
}

impl HelpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_endpoint(
        &mut self,
        method: &'static str,
        path: &'static str,
        description: &'static str,
        authentication: &'static str,
    ) -> &mut Self {
        self.endpoints.push(EndpointHelp {
            path,
            method,
            description,
            authentication,
        });
        self
    }

    pub fn register_reaction(&mut self, emoji: &'static str, description: &'static str) -> &mut Self {
        self.reactions.push(ReactionHelp { emoji, description });
        self
    }

    pub fn endpoints(&self) -> &[EndpointHelp] {
        &self.endpoints
    }

    pub fn reactions(&self) -> &[ReactionHelp] {
        &self.reactions
    }

    pub fn to_json(&self) -> Value {
        json!({
            "service": "cellar",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Tracks wine sales between members through reactions on status messages",
            "endpoints": self.endpoints,
            "reactions": self.reactions,
            "configuration": {
                "required_env_vars": [
                    "DISCORD_BOT_TOKEN",
                    "BOT_USER_ID"
                ],
                "optional_env_vars": [
                    "DISCORD_API_BASE (default: https://discord.com/api/v10)",
                    "MARKET_CHANNEL_IDS (default: any channel)",
                    "PORT (default: 3000)",
                    "STATE_DIR (default: current directory)",
                    "API_TOKEN (default: unset, write endpoints disabled)",
                    "REPLACE_STATUS_MESSAGES (default: true)",
                    "REMINDER_DELAY_HOURS (default: 24)",
                    "RETENTION_HOURS (default: 168)",
                    "RETENTION_INTERVAL_MINUTES (default: 60)",
                    "MISFIRE_GRACE_SECONDS (default: 60)",
                    "CACHE_TTL_SECONDS (default: 300)",
                    "CACHE_CAPACITY (default: 256)"
                ]
            }
        })
    }
}

/// Build the registry with every endpoint and reaction the service supports.
pub fn init_help_registry() -> HelpRegistry {
    let mut registry = HelpRegistry::new();

    registry
        .register_endpoint("GET", "/health", "Health check", "None")
        .register_endpoint("GET", "/help", "This document", "None")
        .register_endpoint(
            "GET",
            "/status",
            "Sale counts by state, scheduled jobs and missed jobs",
            "None",
        )
        .register_endpoint(
            "POST",
            "/reactions",
            "Submit a reaction event; accepted immediately and processed asynchronously",
            "Bearer token (API_TOKEN)",
        )
        .register_endpoint(
            "POST",
            "/sales",
            "Open a sale and post its status message",
            "Bearer token (API_TOKEN)",
        )
        .register_endpoint(
            "POST",
            "/sales/{id}/{action}",
            "Apply approve, cancel, paid, delivered or revise on behalf of a member",
            "Bearer token (API_TOKEN)",
        )
        .register_endpoint(
            "POST",
            "/reminders",
            "Schedule a reminder about a sale",
            "Bearer token (API_TOKEN)",
        );

    registry
        .register_reaction(
            ReactionKind::Approve.emoji(),
            "Buyer approves the sale",
        )
        .register_reaction(
            ReactionKind::Cancel.emoji(),
            "Either party cancels the sale before it is approved",
        )
        .register_reaction(
            ReactionKind::MarkPaid.emoji(),
            "Confirm payment sent (buyer) or received (seller)",
        )
        .register_reaction(
            ReactionKind::MarkDelivered.emoji(),
            "Confirm delivery sent (seller) or received (buyer)",
        )
        .register_reaction(
            REMINDER_EMOJI,
            "Get a reminder about the sale unless it completes first",
        )
        .register_reaction(PROCESSING_EMOJI, "Shown by the bot while a reaction is handled");

    registry
}
