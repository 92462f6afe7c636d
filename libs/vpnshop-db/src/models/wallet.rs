use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vpnshop_shared::types::CreditReason;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletAccount {
    pub user_id: i64,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only ledger row. A wallet balance always equals the sum of its deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: i64,
    pub wallet_user_id: i64,
    pub delta: i64,
    pub reason: CreditReason,
    pub related_intent_id: Option<Uuid>,
    pub note: Option<String>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCreditTransaction {
    pub wallet_user_id: i64,
    pub delta: i64,
    pub reason: CreditReason,
    pub related_intent_id: Option<Uuid>,
    pub note: Option<String>,
}

impl NewCreditTransaction {
    pub fn for_intent(user_id: i64, delta: i64, reason: CreditReason, intent_id: Uuid) -> Self {
        Self {
            wallet_user_id: user_id,
            delta,
            reason,
            related_intent_id: Some(intent_id),
            note: None,
        }
    }
}

/// Result of applying a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedCredit {
    pub transaction_id: i64,
    pub balance: i64,
    /// The entry already existed for this (intent, reason) and nothing was written.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerDiscrepancy {
    pub user_id: i64,
    pub stored_balance: i64,
    pub ledger_sum: i64,
}
