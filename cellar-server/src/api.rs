//! HTTP surface.
//!
//! Read-only endpoints are open. Write endpoints require
//! `Authorization: Bearer <API_TOKEN>` and are disabled when no token is
//! configured. Reaction events are acknowledged immediately and processed by
//! the dispatcher in the background.

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::dispatcher::ReactionEvent;
use crate::ledger::{Action, Destination, LedgerError, Outcome};
use crate::reminders::ReminderError;
use crate::status::StatusData;
use crate::AppState;
use cellar_core::{
    ChannelId, GuildId, MemberId, Price, Reminder, StatusFilter, Transaction, TransactionError,
    TransactionId,
};

/// The full application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/help", get(help_handler))
        .route("/status", get(status_handler))
        .merge(write_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn write_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/reactions", post(reaction_handler))
        .route("/sales", post(open_sale_handler))
        .route("/sales/{id}/{action}", post(sale_action_handler))
        .route("/reminders", post(reminder_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            require_api_token,
        ))
}

// ============================================================================
// Authentication
// ============================================================================

/// Validate the authorization header against the API token.
///
/// Returns `Ok(())` if authorized, or an error response if not.
#[allow(clippy::result_large_err)]
fn validate_auth(headers: &HeaderMap, api_token: &Option<String>) -> Result<(), Response> {
    let Some(expected_token) = api_token else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Write API is disabled (API_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(value) => match value.strip_prefix("Bearer ") {
            Some(provided) if provided == expected_token => Ok(()),
            Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response()),
            None => Err((
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header format. Expected: Bearer <token>",
            )
                .into_response()),
        },
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

async fn require_api_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(rejection) = validate_auth(request.headers(), &state.api_token) {
        return rejection;
    }
    next.run(request).await
}

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by the write endpoints.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<TransactionError> for ApiError {
    fn from(e: TransactionError) -> Self {
        let status = match e {
            TransactionError::InvalidPrice(_) | TransactionError::EmptyWine => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            TransactionError::InvalidBuyer
            | TransactionError::InvalidSeller
            | TransactionError::InvalidMember => StatusCode::FORBIDDEN,
            TransactionError::Cancelled | TransactionError::Approved => StatusCode::CONFLICT,
        };
        Self::new(status, e.to_string())
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Domain(domain) => domain.into(),
            LedgerError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            LedgerError::Publish(_) => {
                error!("Publish failed: {}", e);
                Self::new(StatusCode::BAD_GATEWAY, e.to_string())
            }
            LedgerError::Repository(_) => {
                error!("Storage failed: {}", e);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<ReminderError> for ApiError {
    fn from(e: ReminderError) -> Self {
        match e {
            ReminderError::Missed(_) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            _ => {
                error!("Reminder request failed: {}", e);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

// ============================================================================
// Read-only handlers
// ============================================================================

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "cellar"
    }))
}

async fn help_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.help.to_json())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Json<StatusData>, ApiError> {
    let transactions = state.transactions.list().await.map_err(|e| {
        error!("Failed to list transactions: {}", e);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(Json(StatusData::from_parts(
        transactions,
        state.scheduler.scheduled_keys(),
        state.scheduler.missed_jobs(),
        crate::get_bot_version(),
    )))
}

// ============================================================================
// Write handlers
// ============================================================================

/// Response body for sale operations.
#[derive(Debug, Serialize)]
struct SaleResponse {
    transaction: Transaction,
    status_message_id: Option<u64>,
}

impl From<Outcome> for SaleResponse {
    fn from(outcome: Outcome) -> Self {
        Self {
            transaction: outcome.transaction,
            status_message_id: outcome.published.map(|m| m.message_id.0),
        }
    }
}

async fn reaction_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ReactionEvent>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    match state.reactions.try_send(event) {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" })))),
        Err(TrySendError::Full(_)) => {
            warn!("Reaction queue full, rejecting event");
            Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "reaction queue is full",
            ))
        }
        Err(TrySendError::Closed(_)) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "reaction dispatcher is not running",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct OpenSaleRequest {
    seller: MemberId,
    buyer: MemberId,
    wine: String,
    price: String,
    channel_id: ChannelId,
    #[serde(default)]
    guild_id: Option<GuildId>,
}

async fn open_sale_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OpenSaleRequest>,
) -> Result<(StatusCode, Json<SaleResponse>), ApiError> {
    let price: Price = request.price.parse()?;
    let outcome = state
        .ledger
        .open_sale(
            request.seller,
            request.buyer,
            &request.wine,
            price,
            Destination {
                channel: request.channel_id,
                guild: request.guild_id,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

#[derive(Debug, Deserialize)]
struct SaleActionRequest {
    actor: MemberId,
    #[serde(default)]
    channel_id: Option<ChannelId>,
    #[serde(default)]
    guild_id: Option<GuildId>,
    /// Only used by `revise`.
    #[serde(default)]
    wine: Option<String>,
    /// Only used by `revise`.
    #[serde(default)]
    price: Option<String>,
}

async fn sale_action_handler(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(i64, String)>,
    Json(request): Json<SaleActionRequest>,
) -> Result<Json<SaleResponse>, ApiError> {
    let id = TransactionId(id);
    let destination = request.channel_id.map(|channel| Destination {
        channel,
        guild: request.guild_id,
    });

    let outcome = if action == "revise" {
        let price = request.price.as_deref().map(str::parse::<Price>).transpose()?;
        state
            .ledger
            .revise(id, request.actor, request.wine.as_deref(), price, destination)
            .await?
    } else {
        let action: Action = action
            .parse()
            .map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;
        state
            .ledger
            .apply(id, action, request.actor, destination)
            .await?
    };

    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
struct ReminderRequest {
    member: MemberId,
    transaction_id: TransactionId,
    channel_id: ChannelId,
    #[serde(default)]
    status_filter: Option<StatusFilter>,
    /// Absolute fire time. Defaults to now plus the configured delay.
    #[serde(default)]
    fire_at: Option<DateTime<Utc>>,
}

async fn reminder_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReminderRequest>,
) -> Result<(StatusCode, Json<Reminder>), ApiError> {
    let tx = state
        .ledger
        .lookup(request.transaction_id)
        .await?
        .ok_or(LedgerError::NotFound(request.transaction_id))?;
    if !tx.is_party(request.member) {
        return Err(TransactionError::InvalidMember.into());
    }

    let fire_at = request
        .fire_at
        .unwrap_or_else(|| Utc::now() + state.reminder_delay);
    let reminder = state
        .reminders
        .create_reminder(
            request.member,
            request.transaction_id,
            request.channel_id,
            request.status_filter,
            fire_at,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(reminder)))
}
