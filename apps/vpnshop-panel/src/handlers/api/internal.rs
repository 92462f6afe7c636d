//! Token-protected API used by the chat front end and by administrators.

use crate::AppState;
use crate::handlers::ApiError;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use vpnshop_db::models::payment::{NewPaymentIntent, PaymentIntent};
use vpnshop_shared::api::{
    CheckoutResponse, CreateIntentRequest, IntentView, ManualFinalizeRequest, SettlementView,
    WalletEntryView, WalletView,
};
use vpnshop_shared::types::GatewayKind;

use crate::services::orchestrator::Settlement;

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn authorize_internal_request(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = extract_bearer_token(headers).ok_or_else(ApiError::unauthorized)?;
    let expected = state.config.server.internal_token.trim();
    if token.trim().is_empty() || expected.is_empty() || token != expected {
        return Err(ApiError::unauthorized());
    }
    Ok(())
}

fn intent_view(intent: &PaymentIntent) -> IntentView {
    IntentView {
        id: intent.id,
        user_id: intent.user_id,
        amount: intent.amount,
        purpose: intent.purpose,
        gateway: intent.gateway,
        state: intent.state,
        failure_reason: intent.failure_reason,
    }
}

fn settlement_view(settled: Settlement) -> SettlementView {
    SettlementView {
        intent_id: settled.intent_id,
        state: settled.state,
        failure_reason: settled.reason,
        applied: settled.applied,
    }
}

pub async fn create_intent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateIntentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize_internal_request(&state, &headers)?;
    let intent = state
        .orchestrator
        .create_intent(NewPaymentIntent {
            user_id: req.user_id,
            amount: req.amount,
            purpose: req.purpose,
            gateway: req.gateway,
            plan: req.plan,
            upgrade_of: req.upgrade_of,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(intent_view(&intent))))
}

pub async fn get_intent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    authorize_internal_request(&state, &headers)?;
    let intent = state.orchestrator.payments().get(id).await?;
    Ok(Json(intent_view(&intent)))
}

pub async fn begin_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    authorize_internal_request(&state, &headers)?;
    let started = state.orchestrator.begin_checkout(id).await?;
    Ok(Json(CheckoutResponse {
        intent_id: started.intent.id,
        redirect_url: Some(started.redirect_url),
    }))
}

pub async fn pay_with_wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    authorize_internal_request(&state, &headers)?;
    let settled = state.orchestrator.pay_with_wallet(id).await?;
    Ok(Json(settlement_view(settled)))
}

pub async fn cancel_intent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    authorize_internal_request(&state, &headers)?;
    let settled = state.orchestrator.cancel(id).await?;
    Ok(Json(settlement_view(settled)))
}

#[derive(Debug, Deserialize)]
pub struct WalletQuery {
    #[serde(default = "default_history")]
    pub limit: i64,
}

fn default_history() -> i64 {
    20
}

pub async fn get_wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Query(query): Query<WalletQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authorize_internal_request(&state, &headers)?;
    let ledger = state.orchestrator.ledger();
    let balance = ledger.balance(user_id).await?;
    let transactions = ledger
        .transactions(user_id, query.limit.clamp(1, 200))
        .await?
        .into_iter()
        .map(|t| WalletEntryView {
            id: t.id,
            delta: t.delta,
            reason: t.reason.to_string(),
            related_intent_id: t.related_intent_id,
            applied_at: t.applied_at.to_rfc3339(),
        })
        .collect();
    Ok(Json(WalletView {
        user_id,
        balance,
        transactions,
    }))
}

/// Records a payment an administrator confirmed with the gateway by hand.
pub async fn admin_finalize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<ManualFinalizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize_internal_request(&state, &headers)?;
    let reference = req.reference.trim();
    if reference.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "malformed",
            "reference must not be empty",
        ));
    }
    info!(intent_id = %id, %reference, "Admin finalize requested");
    let settled = state.orchestrator.manual_finalize(id, reference).await?;
    Ok(Json(settlement_view(settled)))
}

pub async fn list_gateways(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    authorize_internal_request(&state, &headers)?;
    let mut available: Vec<GatewayKind> = GatewayKind::ALL
        .iter()
        .copied()
        .filter(|kind| !kind.is_external() || state.orchestrator.supports(*kind))
        .collect();
    available.sort_by_key(|kind| kind.as_str());
    Ok(Json(available))
}
