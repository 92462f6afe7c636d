//! Gateway webhook endpoint.
//!
//! Verification runs inline. Fulfillment of a freshly verified intent runs in
//! its own task; the handler waits for it only up to the configured budget and
//! answers 200 either way, since the sweep finishes whatever is left.

use axum::{
    Json,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use vpnshop_shared::api::SettlementView;
use vpnshop_shared::types::{GatewayKind, IntentState};

use crate::AppState;
use crate::handlers::ApiError;
use crate::services::orchestrator::Settlement;
use crate::services::payment::RawCallback;

fn raw_callback(query: Option<String>, headers: &HeaderMap, body: String) -> RawCallback {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    RawCallback { query, body, headers }
}

fn view(settled: &Settlement) -> SettlementView {
    SettlementView {
        intent_id: settled.intent_id,
        state: settled.state,
        failure_reason: settled.reason,
        applied: settled.applied,
    }
}

pub async fn gateway_callback(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: String,
) -> Response {
    let kind = match gateway.parse::<GatewayKind>() {
        Ok(kind) if kind.is_external() => kind,
        _ => {
            return ApiError::new(StatusCode::NOT_FOUND, "unsupported_gateway", "unknown payment gateway")
                .into_response();
        }
    };
    info!("Received payment webhook from {}", kind);

    let raw = raw_callback(query, &headers, body);
    let accepted = match state.orchestrator.accept_callback(kind, &raw).await {
        Ok(accepted) => accepted,
        Err(e) => {
            let err = ApiError::from(e);
            if err.status.is_client_error() {
                warn!(gateway = %kind, code = err.code, "rejected webhook: {}", err.message);
            }
            return err.into_response();
        }
    };

    if accepted.state != IntentState::Verified {
        return (StatusCode::OK, Json(view(&accepted))).into_response();
    }

    let orchestrator = state.orchestrator.clone();
    let intent_id = accepted.intent_id;
    let task = tokio::spawn(async move { orchestrator.drive(intent_id).await });

    match tokio::time::timeout(state.config.webhook_wait(), task).await {
        Ok(Ok(Ok(mut driven))) => {
            driven.applied |= accepted.applied;
            (StatusCode::OK, Json(view(&driven))).into_response()
        }
        Ok(Ok(Err(e))) => ApiError::from(e).into_response(),
        Ok(Err(join_err)) => {
            error!(%intent_id, "fulfillment task failed: {}", join_err);
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal").into_response()
        }
        Err(_) => {
            // Verified is durable; the task keeps running and the sweep backs it up.
            info!(%intent_id, "fulfillment still running after webhook budget");
            (StatusCode::OK, Json(view(&accepted))).into_response()
        }
    }
}
