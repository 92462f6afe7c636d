use serde::{Deserialize, Serialize};

pub mod callback;
pub mod types;

pub mod api {
    use super::*;
    use crate::types::{FailureReason, GatewayKind, IntentState, PaymentPurpose, PlanSpec};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CreateIntentRequest {
        pub user_id: i64,
        pub amount: i64,
        pub purpose: PaymentPurpose,
        pub gateway: GatewayKind,
        #[serde(default)]
        pub plan: Option<PlanSpec>,
        #[serde(default)]
        pub upgrade_of: Option<i64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct IntentView {
        pub id: Uuid,
        pub user_id: i64,
        pub amount: i64,
        pub purpose: PaymentPurpose,
        pub gateway: GatewayKind,
        pub state: IntentState,
        pub failure_reason: Option<FailureReason>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CheckoutResponse {
        pub intent_id: Uuid,
        /// Absent for wallet intents, which never leave the bot.
        pub redirect_url: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SettlementView {
        pub intent_id: Uuid,
        pub state: IntentState,
        pub failure_reason: Option<FailureReason>,
        pub applied: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct WalletView {
        pub user_id: i64,
        pub balance: i64,
        pub transactions: Vec<WalletEntryView>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct WalletEntryView {
        pub id: i64,
        pub delta: i64,
        pub reason: String,
        pub related_intent_id: Option<Uuid>,
        pub applied_at: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ManualFinalizeRequest {
        pub reference: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ErrorBody {
        pub error: String,
        pub code: String,
    }
}
