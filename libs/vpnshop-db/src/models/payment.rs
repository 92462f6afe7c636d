use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vpnshop_shared::types::{FailureReason, GatewayKind, IntentState, PaymentPurpose, PlanSpec};

/// One attempt by a user to pay for something.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub user_id: i64,
    /// Minor currency units, always positive.
    pub amount: i64,
    pub purpose: PaymentPurpose,
    pub gateway: GatewayKind,
    /// Transaction id assigned by the gateway once it confirmed payment.
    pub gateway_ref: Option<String>,
    /// Handle returned by the gateway when checkout was opened (ZarinPal authority, Cryptomus uuid).
    pub checkout_ref: Option<String>,
    pub state: IntentState,
    pub plan: Option<PlanSpec>,
    /// Order whose service this intent upgrades or renews.
    pub upgrade_of: Option<i64>,
    pub failure_reason: Option<FailureReason>,
    /// Raw authenticated callback, kept so an interrupted verification can be replayed.
    pub callback_payload: Option<String>,
    pub lease_owner: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPaymentIntent {
    pub user_id: i64,
    pub amount: i64,
    pub purpose: PaymentPurpose,
    pub gateway: GatewayKind,
    pub plan: Option<PlanSpec>,
    pub upgrade_of: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidIntent {
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(i64),
    #[error("service purchases require a plan")]
    MissingPlan,
    #[error("upgrades must name the order being upgraded")]
    MissingUpgradeTarget,
    #[error("{0} intents cannot carry an upgrade target")]
    UnexpectedUpgradeTarget(PaymentPurpose),
    #[error("wallet top-ups cannot be paid from the wallet")]
    WalletFundedTopUp,
}

impl NewPaymentIntent {
    pub fn validate(&self) -> Result<(), InvalidIntent> {
        if self.amount <= 0 {
            return Err(InvalidIntent::NonPositiveAmount(self.amount));
        }
        match self.purpose {
            PaymentPurpose::WalletTopUp if self.gateway == GatewayKind::Wallet => {
                Err(InvalidIntent::WalletFundedTopUp)
            }
            PaymentPurpose::NewService | PaymentPurpose::UpgradeService if self.plan.is_none() => {
                Err(InvalidIntent::MissingPlan)
            }
            PaymentPurpose::UpgradeService if self.upgrade_of.is_none() => {
                Err(InvalidIntent::MissingUpgradeTarget)
            }
            PaymentPurpose::NewService | PaymentPurpose::WalletTopUp if self.upgrade_of.is_some() => {
                Err(InvalidIntent::UnexpectedUpgradeTarget(self.purpose))
            }
            _ => Ok(()),
        }
    }
}

/// A guarded state transition together with the columns it writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    AwaitGateway { checkout_ref: Option<String> },
    BeginVerifying { payload: String },
    Verified { gateway_ref: String },
    BeginFulfilling,
    Finalized,
    Failed { reason: FailureReason },
}

impl StateChange {
    pub fn target(&self) -> IntentState {
        match self {
            StateChange::AwaitGateway { .. } => IntentState::AwaitingGateway,
            StateChange::BeginVerifying { .. } => IntentState::Verifying,
            StateChange::Verified { .. } => IntentState::Verified,
            StateChange::BeginFulfilling => IntentState::Fulfilling,
            StateChange::Finalized => IntentState::Finalized,
            StateChange::Failed { .. } => IntentState::Failed,
        }
    }
}
