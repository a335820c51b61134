//! HTTP surface: routing endpoint plus budget and circuit administration.
//!
//! Thin layer over [`Router`] and [`BudgetLedger`]: handlers deserialize,
//! delegate, and map domain errors to status codes. Budget exhaustion is
//! `402`, ledger contention is `503` (retryable), chain exhaustion is
//! `502` with the full attempt chain in the body for diagnostics.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::RouteError;
use crate::ledger::{BudgetLedger, LedgerError, Period};
use crate::provider::CompletionRequest;
use crate::router::{RouteRequest, Router};
use crate::tier::Tier;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub ledger: Arc<BudgetLedger>,
}

pub fn app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/v1/route", post(route_completion))
        .route("/budget/status/{subject}", get(budget_status))
        .route("/budget/limit", post(set_limit))
        .route("/budget/limit/{subject}/{period}", delete(clear_limit))
        .route("/circuits", get(circuits))
        .route("/health/{provider}", delete(invalidate_health))
        .route("/healthz", get(healthz))
        .with_state(state)
}

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

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            LedgerError::Contention { .. } => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::InvalidLimit(_) => StatusCode::BAD_REQUEST,
            LedgerError::Corrupt { .. } | LedgerError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::Ledger(inner) => inner.into(),
            RouteError::UnconfiguredTier(_) => ApiError::new(StatusCode::BAD_REQUEST, err.to_string()),
            RouteError::NoPrivacyCompatibleProvider { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            RouteError::AllProvidersFailed { ref attempts } => {
                let chain: Vec<String> = attempts.iter().map(|a| a.to_string()).collect();
                ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    format!("all providers failed: [{}]", chain.join("; ")),
                )
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RouteBody {
    subject: String,
    tier: Tier,
    #[serde(default)]
    privacy: bool,
    #[serde(flatten)]
    completion: CompletionRequest,
}

#[derive(Debug, Serialize)]
struct RouteReply {
    content: String,
    provider: String,
    requested_tier: Tier,
    served_tier: Tier,
    input_tokens: u64,
    output_tokens: u64,
    cost: Decimal,
    latency_ms: u64,
}

async fn route_completion(
    State(state): State<AppState>,
    Json(body): Json<RouteBody>,
) -> Result<Json<RouteReply>, ApiError> {
    let response = state
        .router
        .route(RouteRequest {
            subject: body.subject,
            tier: body.tier,
            privacy: body.privacy,
            completion: body.completion,
        })
        .await?;

    Ok(Json(RouteReply {
        content: response.completion.content,
        provider: response.provider,
        requested_tier: response.requested_tier,
        served_tier: response.served_tier,
        input_tokens: response.completion.input_tokens,
        output_tokens: response.completion.output_tokens,
        cost: response.cost,
        latency_ms: response.latency.as_millis() as u64,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    period: Option<Period>,
}

async fn budget_status(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, ApiError> {
    let period = query.period.unwrap_or(Period::Daily);
    let status = state.ledger.status(&subject, period).await?;
    Ok(Json(status).into_response())
}

#[derive(Debug, Deserialize)]
struct SetLimitBody {
    subject: String,
    period: Period,
    limit: Decimal,
}

async fn set_limit(
    State(state): State<AppState>,
    Json(body): Json<SetLimitBody>,
) -> Result<StatusCode, ApiError> {
    state
        .ledger
        .set_limit(&body.subject, body.period, body.limit)
        .await?;
    Ok(StatusCode::OK)
}

async fn clear_limit(
    State(state): State<AppState>,
    Path((subject, period)): Path<(String, Period)>,
) -> Result<StatusCode, ApiError> {
    state.ledger.clear_limit(&subject, period).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn circuits(State(state): State<AppState>) -> Response {
    let states: serde_json::Map<String, serde_json::Value> = state
        .router
        .circuit_states()
        .into_iter()
        .map(|(name, circuit)| (name, json!(circuit)))
        .collect();
    Json(serde_json::Value::Object(states)).into_response()
}

async fn invalidate_health(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> StatusCode {
    if state.router.invalidate_health(&provider) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
