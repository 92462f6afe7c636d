use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Database/text representation for the closed enums stored as TEXT columns.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    NewService,
    UpgradeService,
    WalletTopUp,
}

text_enum!(PaymentPurpose, "purpose", {
    NewService => "new_service",
    UpgradeService => "upgrade_service",
    WalletTopUp => "wallet_top_up",
});

impl PaymentPurpose {
    pub fn is_service(&self) -> bool {
        matches!(self, PaymentPurpose::NewService | PaymentPurpose::UpgradeService)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    #[serde(rename = "zarinpal")]
    ZarinPal,
    Cryptomus,
    Wallet,
}

text_enum!(GatewayKind, "gateway", {
    ZarinPal => "zarinpal",
    Cryptomus => "cryptomus",
    Wallet => "wallet",
});

impl GatewayKind {
    /// Gateways that redirect the user and call back asynchronously.
    pub fn is_external(&self) -> bool {
        !matches!(self, GatewayKind::Wallet)
    }
}

/// Lifecycle of a payment intent.
///
/// `Finalized` and `Failed` are terminal. The only way to move between states is
/// through an edge accepted by [`IntentState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Created,
    AwaitingGateway,
    Verifying,
    Verified,
    Fulfilling,
    Finalized,
    Failed,
}

text_enum!(IntentState, "intent state", {
    Created => "created",
    AwaitingGateway => "awaiting_gateway",
    Verifying => "verifying",
    Verified => "verified",
    Fulfilling => "fulfilling",
    Finalized => "finalized",
    Failed => "failed",
});

impl IntentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentState::Finalized | IntentState::Failed)
    }

    /// True once a gateway (or the wallet) has confirmed the money.
    pub fn is_past_verification(&self) -> bool {
        matches!(
            self,
            IntentState::Verified | IntentState::Fulfilling | IntentState::Finalized
        )
    }

    pub fn can_transition_to(&self, next: IntentState) -> bool {
        use IntentState::*;
        matches!(
            (self, next),
            (Created, AwaitingGateway)
                | (Created, Failed)
                | (AwaitingGateway, Verifying)
                | (AwaitingGateway, Failed)
                | (Verifying, Verified)
                | (Verifying, Failed)
                | (Verified, Fulfilling)
                | (Fulfilling, Finalized)
                | (Fulfilling, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    TopUp,
    Purchase,
    Refund,
    AdminAdjustment,
}

text_enum!(CreditReason, "credit reason", {
    TopUp => "top_up",
    Purchase => "purchase",
    Refund => "refund",
    AdminAdjustment => "admin_adjustment",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    New,
    Upgrade,
    Renew,
}

text_enum!(OrderKind, "order kind", {
    New => "new",
    Upgrade => "upgrade",
    Renew => "renew",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Pending,
    Provisioned,
    Failed,
}

text_enum!(ProvisioningState, "provisioning state", {
    Pending => "pending",
    Provisioned => "provisioned",
    Failed => "failed",
});

/// Stable, user-facing failure codes. Raw provider text never leaves the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AmountMismatch,
    PaymentNotCompleted,
    InsufficientFunds,
    ProvisioningRejected,
    ProvisioningExhausted,
    DuplicateReference,
    Cancelled,
}

text_enum!(FailureReason, "failure reason", {
    AmountMismatch => "amount_mismatch",
    PaymentNotCompleted => "payment_not_completed",
    InsufficientFunds => "insufficient_funds",
    ProvisioningRejected => "provisioning_rejected",
    ProvisioningExhausted => "provisioning_exhausted",
    DuplicateReference => "duplicate_reference",
    Cancelled => "cancelled",
});

impl FailureReason {
    pub fn code(&self) -> &'static str {
        self.as_str()
    }

    /// Whether the user's money was returned to their wallet for this failure.
    pub fn implies_refund(&self) -> bool {
        matches!(
            self,
            FailureReason::ProvisioningRejected | FailureReason::ProvisioningExhausted
        )
    }
}

/// Plan parameters attached to service purchases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub plan_id: i64,
    pub inbound_id: i64,
    pub traffic_gb: i64,
    pub duration_days: i64,
    #[serde(default)]
    pub ip_limit: i64,
}
