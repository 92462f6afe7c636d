//! Storage seams used by the payment services.
//!
//! Every mutation of a payment intent goes through
//! [`PaymentStore::compare_and_transition`], which only succeeds when the
//! stored state still equals the caller's expectation. The wallet ledger
//! applies an entry and the balance change in one atomic step and refuses a
//! second entry for the same `(intent, reason)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;
use vpnshop_shared::types::IntentState;

use crate::models::order::{NewServiceOrder, ServiceOrder};
use crate::models::payment::{InvalidIntent, NewPaymentIntent, PaymentIntent, StateChange};
use crate::models::wallet::{
    AppliedCredit, CreditTransaction, LedgerDiscrepancy, NewCreditTransaction, WalletAccount,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: IntentState, to: IntentState },
    #[error("gateway reference {0} is already bound to another intent")]
    DuplicateGatewayRef(String),
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
    #[error("wallet {user_id}: applying {delta} to balance {balance} overflows")]
    BalanceOverflow { user_id: i64, balance: i64, delta: i64 },
    #[error(transparent)]
    Invalid(#[from] InvalidIntent),
    #[error("corrupt {column} value: {detail}")]
    Corrupt { column: &'static str, detail: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a guarded transition.
#[derive(Debug, Clone)]
pub enum Transition {
    /// This caller moved the intent; carries the updated row.
    Applied(PaymentIntent),
    /// The stored state no longer matched; carries the current row.
    Lost(PaymentIntent),
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn into_intent(self) -> PaymentIntent {
        match self {
            Transition::Applied(intent) | Transition::Lost(intent) => intent,
        }
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn create(&self, new: NewPaymentIntent) -> StoreResult<PaymentIntent>;

    async fn get(&self, id: Uuid) -> StoreResult<PaymentIntent>;

    async fn find_by_gateway_ref(
        &self,
        gateway: vpnshop_shared::types::GatewayKind,
        gateway_ref: &str,
    ) -> StoreResult<Option<PaymentIntent>>;

    async fn list_by_user(&self, user_id: i64, limit: i64) -> StoreResult<Vec<PaymentIntent>>;

    /// Moves `id` from `expected` to `change.target()` if and only if the
    /// stored state is still `expected`.
    async fn compare_and_transition(
        &self,
        id: Uuid,
        expected: IntentState,
        change: StateChange,
    ) -> StoreResult<Transition>;

    /// Claims the fulfillment lease. Returns false while another live owner holds it.
    async fn acquire_lease(&self, id: Uuid, owner: Uuid, ttl: Duration) -> StoreResult<bool>;

    /// Extends a lease `owner` still holds, as long as the intent is `Fulfilling`.
    /// Returns false once the lease has passed to another owner, was released,
    /// or the intent has left `Fulfilling`.
    async fn renew_lease(&self, id: Uuid, owner: Uuid, ttl: Duration) -> StoreResult<bool>;

    async fn release_lease(&self, id: Uuid, owner: Uuid) -> StoreResult<()>;

    /// Intents sitting in one of `states` whose last update is older than `older_than`.
    async fn list_stalled(
        &self,
        states: &[IntentState],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentIntent>>;
}

#[async_trait]
pub trait WalletLedger: Send + Sync {
    async fn balance(&self, user_id: i64) -> StoreResult<i64>;

    async fn account(&self, user_id: i64) -> StoreResult<Option<WalletAccount>>;

    /// Appends the entry and moves the balance atomically.
    ///
    /// Entries tied to an intent are idempotent per `(intent, reason)`: a
    /// repeat returns the existing entry with `duplicate` set. A debit that
    /// would make the balance negative fails with `InsufficientFunds` and
    /// writes nothing.
    async fn apply(&self, entry: NewCreditTransaction) -> StoreResult<AppliedCredit>;

    async fn transactions(&self, user_id: i64, limit: i64) -> StoreResult<Vec<CreditTransaction>>;

    async fn find_discrepancies(&self) -> StoreResult<Vec<LedgerDiscrepancy>>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Returns the order for `new.related_intent_id`, creating it on first call.
    async fn get_or_create(&self, new: NewServiceOrder) -> StoreResult<ServiceOrder>;

    async fn get(&self, id: i64) -> StoreResult<ServiceOrder>;

    async fn get_by_intent(&self, intent_id: Uuid) -> StoreResult<Option<ServiceOrder>>;

    async fn record_attempt(&self, id: i64, error: Option<&str>) -> StoreResult<ServiceOrder>;

    /// Stores the provider handle while the order is still pending.
    async fn record_provider_ref(&self, id: i64, provider_ref: &str) -> StoreResult<ServiceOrder>;

    /// Pending -> Provisioned. Returns false if the order was not pending.
    async fn mark_provisioned(&self, id: i64) -> StoreResult<bool>;

    async fn mark_failed(&self, id: i64, error: &str) -> StoreResult<ServiceOrder>;

    /// Marks pending orders with a provider handle as provisioned once their
    /// intent is finalized. Returns how many orders changed.
    async fn promote_finalized(&self) -> StoreResult<u64>;
}
