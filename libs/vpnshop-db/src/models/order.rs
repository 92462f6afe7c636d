use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vpnshop_shared::types::{OrderKind, PlanSpec, ProvisioningState};

/// The service side of a paid intent. At most one exists per intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOrder {
    pub id: i64,
    pub user_id: i64,
    pub related_intent_id: Uuid,
    pub kind: OrderKind,
    pub spec: PlanSpec,
    pub provisioning_state: ProvisioningState,
    /// Panel handle of the created or updated client.
    pub provider_ref: Option<String>,
    /// For upgrades and renewals, the handle of the client being changed.
    pub target_ref: Option<String>,
    /// Client id chosen before the first provisioning call so retries reuse it.
    pub credential_id: Uuid,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceOrder {
    /// Expiry derived from the order alone, so every retry computes the same value.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::days(self.spec.duration_days)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewServiceOrder {
    pub user_id: i64,
    pub related_intent_id: Uuid,
    pub kind: OrderKind,
    pub spec: PlanSpec,
    pub target_ref: Option<String>,
}
