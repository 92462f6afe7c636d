use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;
use vpnshop_db::store::StoreError;
use vpnshop_shared::api::ErrorBody;

use crate::services::fulfillment::FulfillmentError;
use crate::services::orchestrator::OrchestratorError;
use crate::services::payment::VerificationError;

pub mod api;
pub mod health;
pub mod payments;

/// Error returned by every JSON handler. Carries a stable code, never provider text.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid token")
    }
}

fn from_verification(err: &VerificationError) -> (StatusCode, &'static str) {
    match err {
        VerificationError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
        VerificationError::Malformed(_) => (StatusCode::BAD_REQUEST, "malformed"),
        VerificationError::UnknownIntent(_) => (StatusCode::NOT_FOUND, "unknown_intent"),
        VerificationError::WrongGateway { .. } => (StatusCode::BAD_REQUEST, "wrong_gateway"),
        VerificationError::UnsupportedGateway(_) => (StatusCode::NOT_FOUND, "unsupported_gateway"),
        VerificationError::AmountMismatch { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "amount_mismatch"),
        VerificationError::Declined(_) => (StatusCode::UNPROCESSABLE_ENTITY, "declined"),
        VerificationError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "gateway_unavailable"),
    }
}

fn from_store(err: &StoreError) -> (StatusCode, &'static str) {
    match err {
        StoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        StoreError::IllegalTransition { .. } => (StatusCode::CONFLICT, "illegal_transition"),
        StoreError::DuplicateGatewayRef(_) => (StatusCode::CONFLICT, "duplicate_reference"),
        StoreError::InsufficientFunds { .. } => (StatusCode::PAYMENT_REQUIRED, "insufficient_funds"),
        StoreError::BalanceOverflow { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "balance_overflow"),
        StoreError::Invalid(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_intent"),
        StoreError::Corrupt { .. } | StoreError::Database(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let (status, code) = match &err {
            OrchestratorError::Verification(e) => from_verification(e),
            OrchestratorError::InsufficientFunds { .. } => (StatusCode::PAYMENT_REQUIRED, "insufficient_funds"),
            OrchestratorError::WrongState { .. } => (StatusCode::CONFLICT, "wrong_state"),
            OrchestratorError::Fulfillment(FulfillmentError::Store(e)) | OrchestratorError::Store(e) => from_store(e),
            OrchestratorError::Fulfillment(FulfillmentError::MissingPlan(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "missing_plan")
            }
            OrchestratorError::Fulfillment(FulfillmentError::LeaseLost(_)) => (StatusCode::CONFLICT, "lease_lost"),
        };
        // Internal detail stays in the log for 5xx.
        let message = if status.is_server_error() {
            error!("Request failed: {}", err);
            code.to_string()
        } else {
            err.to_string()
        };
        Self { status, code, message }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        OrchestratorError::Store(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
                code: self.code.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vpnshop_shared::types::IntentState;

    #[test]
    fn errors_map_to_retry_semantics() {
        let unavailable: ApiError =
            OrchestratorError::Verification(VerificationError::Unavailable("503".into())).into();
        assert_eq!(unavailable.status, StatusCode::SERVICE_UNAVAILABLE);

        let forged: ApiError =
            OrchestratorError::Verification(VerificationError::Unauthenticated("sign".into())).into();
        assert!(forged.status.is_client_error());

        let conflict: ApiError = OrchestratorError::WrongState {
            id: Uuid::nil(),
            state: IntentState::Finalized,
            action: "cancel",
        }
        .into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        assert_eq!(conflict.code, "wrong_state");

        let db: ApiError = StoreError::Database(sqlx::Error::PoolTimedOut).into();
        assert_eq!(db.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(db.message, "storage_error");
    }
}
