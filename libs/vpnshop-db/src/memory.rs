//! In-memory stores with the same guarantees as the Postgres repositories.
//!
//! Used by unit and scenario tests and by `serve --in-memory` for local runs
//! without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use vpnshop_shared::types::{GatewayKind, IntentState, ProvisioningState};

use crate::models::order::{NewServiceOrder, ServiceOrder};
use crate::models::payment::{NewPaymentIntent, PaymentIntent, StateChange};
use crate::models::wallet::{
    AppliedCredit, CreditTransaction, LedgerDiscrepancy, NewCreditTransaction, WalletAccount,
};
use crate::store::{OrderStore, PaymentStore, StoreError, StoreResult, Transition, WalletLedger};

#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    intents: Arc<RwLock<HashMap<Uuid, PaymentIntent>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn create(&self, new: NewPaymentIntent) -> StoreResult<PaymentIntent> {
        new.validate()?;
        let now = Utc::now();
        let intent = PaymentIntent {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            amount: new.amount,
            purpose: new.purpose,
            gateway: new.gateway,
            gateway_ref: None,
            checkout_ref: None,
            state: IntentState::Created,
            plan: new.plan,
            upgrade_of: new.upgrade_of,
            failure_reason: None,
            callback_payload: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            verified_at: None,
            finalized_at: None,
        };
        self.intents.write().await.insert(intent.id, intent.clone());
        Ok(intent)
    }

    async fn get(&self, id: Uuid) -> StoreResult<PaymentIntent> {
        self.intents
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("payment intent", id))
    }

    async fn find_by_gateway_ref(
        &self,
        gateway: GatewayKind,
        gateway_ref: &str,
    ) -> StoreResult<Option<PaymentIntent>> {
        let intents = self.intents.read().await;
        Ok(intents
            .values()
            .find(|i| i.gateway == gateway && i.gateway_ref.as_deref() == Some(gateway_ref))
            .cloned())
    }

    async fn list_by_user(&self, user_id: i64, limit: i64) -> StoreResult<Vec<PaymentIntent>> {
        let intents = self.intents.read().await;
        let mut found: Vec<_> = intents.values().filter(|i| i.user_id == user_id).cloned().collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn compare_and_transition(
        &self,
        id: Uuid,
        expected: IntentState,
        change: StateChange,
    ) -> StoreResult<Transition> {
        let target = change.target();
        if !expected.can_transition_to(target) {
            return Err(StoreError::IllegalTransition {
                from: expected,
                to: target,
            });
        }

        let mut intents = self.intents.write().await;
        let current = intents
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("payment intent", id))?;
        if current.state != expected {
            return Ok(Transition::Lost(current));
        }

        if let StateChange::Verified { gateway_ref } = &change {
            let taken = intents.values().any(|other| {
                other.id != id
                    && other.gateway == current.gateway
                    && other.gateway_ref.as_deref() == Some(gateway_ref.as_str())
            });
            if taken {
                return Err(StoreError::DuplicateGatewayRef(gateway_ref.clone()));
            }
        }

        let now = Utc::now();
        let mut updated = current;
        updated.state = target;
        updated.updated_at = now;
        match change {
            StateChange::AwaitGateway { checkout_ref } => {
                if checkout_ref.is_some() {
                    updated.checkout_ref = checkout_ref;
                }
            }
            StateChange::BeginVerifying { payload } => updated.callback_payload = Some(payload),
            StateChange::Verified { gateway_ref } => {
                updated.gateway_ref = Some(gateway_ref);
                updated.verified_at = Some(now);
            }
            StateChange::BeginFulfilling => {}
            StateChange::Finalized => updated.finalized_at = Some(now),
            StateChange::Failed { reason } => {
                updated.failure_reason = Some(reason);
                updated.finalized_at = Some(now);
            }
        }
        intents.insert(id, updated.clone());
        Ok(Transition::Applied(updated))
    }

    async fn acquire_lease(&self, id: Uuid, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let mut intents = self.intents.write().await;
        let intent = intents
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("payment intent", id))?;
        let now = Utc::now();
        let free = match (intent.lease_owner, intent.lease_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (Some(_), Some(expires)) => expires < now,
            (Some(_), None) => true,
        };
        if free {
            intent.lease_owner = Some(owner);
            intent.lease_expires_at =
                Some(now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()));
        }
        Ok(free)
    }

    async fn renew_lease(&self, id: Uuid, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let mut intents = self.intents.write().await;
        let intent = intents
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("payment intent", id))?;
        if intent.lease_owner != Some(owner) || intent.state != IntentState::Fulfilling {
            return Ok(false);
        }
        intent.lease_expires_at =
            Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()));
        Ok(true)
    }

    async fn release_lease(&self, id: Uuid, owner: Uuid) -> StoreResult<()> {
        let mut intents = self.intents.write().await;
        if let Some(intent) = intents.get_mut(&id) {
            if intent.lease_owner == Some(owner) {
                intent.lease_owner = None;
                intent.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn list_stalled(
        &self,
        states: &[IntentState],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentIntent>> {
        let intents = self.intents.read().await;
        let mut found: Vec<_> = intents
            .values()
            .filter(|i| states.contains(&i.state) && i.updated_at < older_than)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<i64, WalletAccount>,
    entries: Vec<CreditTransaction>,
}

#[derive(Default, Clone)]
pub struct InMemoryWalletLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryWalletLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a stored balance without a ledger entry. Only useful for
    /// exercising the ledger consistency check.
    pub async fn overwrite_balance(&self, user_id: i64, balance: i64) {
        let mut state = self.state.lock().await;
        state.balances.insert(
            user_id,
            WalletAccount {
                user_id,
                balance,
                updated_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl WalletLedger for InMemoryWalletLedger {
    async fn balance(&self, user_id: i64) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state.balances.get(&user_id).map(|a| a.balance).unwrap_or(0))
    }

    async fn account(&self, user_id: i64) -> StoreResult<Option<WalletAccount>> {
        Ok(self.state.lock().await.balances.get(&user_id).cloned())
    }

    async fn apply(&self, entry: NewCreditTransaction) -> StoreResult<AppliedCredit> {
        let mut state = self.state.lock().await;
        let balance = state
            .balances
            .get(&entry.wallet_user_id)
            .map(|a| a.balance)
            .unwrap_or(0);

        if let Some(intent_id) = entry.related_intent_id {
            let existing = state
                .entries
                .iter()
                .find(|t| t.related_intent_id == Some(intent_id) && t.reason == entry.reason);
            if let Some(existing) = existing {
                return Ok(AppliedCredit {
                    transaction_id: existing.id,
                    balance,
                    duplicate: true,
                });
            }
        }

        let new_balance = balance
            .checked_add(entry.delta)
            .ok_or(StoreError::BalanceOverflow {
                user_id: entry.wallet_user_id,
                balance,
                delta: entry.delta,
            })?;
        if new_balance < 0 {
            return Err(StoreError::InsufficientFunds {
                balance,
                requested: entry.delta.saturating_neg(),
            });
        }

        let now = Utc::now();
        let transaction_id = state.entries.len() as i64 + 1;
        state.entries.push(CreditTransaction {
            id: transaction_id,
            wallet_user_id: entry.wallet_user_id,
            delta: entry.delta,
            reason: entry.reason,
            related_intent_id: entry.related_intent_id,
            note: entry.note,
            applied_at: now,
        });
        state.balances.insert(
            entry.wallet_user_id,
            WalletAccount {
                user_id: entry.wallet_user_id,
                balance: new_balance,
                updated_at: now,
            },
        );

        Ok(AppliedCredit {
            transaction_id,
            balance: new_balance,
            duplicate: false,
        })
    }

    async fn transactions(&self, user_id: i64, limit: i64) -> StoreResult<Vec<CreditTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|t| t.wallet_user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn find_discrepancies(&self) -> StoreResult<Vec<LedgerDiscrepancy>> {
        let state = self.state.lock().await;
        let mut found: Vec<_> = state
            .balances
            .values()
            .filter_map(|account| {
                let ledger_sum: i64 = state
                    .entries
                    .iter()
                    .filter(|t| t.wallet_user_id == account.user_id)
                    .map(|t| t.delta)
                    .sum();
                (ledger_sum != account.balance).then_some(LedgerDiscrepancy {
                    user_id: account.user_id,
                    stored_balance: account.balance,
                    ledger_sum,
                })
            })
            .collect();
        found.sort_by_key(|d| d.user_id);
        Ok(found)
    }
}

/// Order store that reads intent states from an [`InMemoryPaymentStore`].
#[derive(Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<i64, ServiceOrder>>>,
    payments: InMemoryPaymentStore,
}

impl InMemoryOrderStore {
    pub fn new(payments: InMemoryPaymentStore) -> Self {
        Self {
            orders: Arc::default(),
            payments,
        }
    }

    async fn update<F>(&self, id: i64, apply: F) -> StoreResult<ServiceOrder>
    where
        F: FnOnce(&mut ServiceOrder) + Send,
    {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("service order", id))?;
        apply(order);
        order.updated_at = Utc::now();
        Ok(order.clone())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get_or_create(&self, new: NewServiceOrder) -> StoreResult<ServiceOrder> {
        let mut orders = self.orders.write().await;
        if let Some(existing) = orders
            .values()
            .find(|o| o.related_intent_id == new.related_intent_id)
        {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let order = ServiceOrder {
            id: orders.len() as i64 + 1,
            user_id: new.user_id,
            related_intent_id: new.related_intent_id,
            kind: new.kind,
            spec: new.spec,
            provisioning_state: ProvisioningState::Pending,
            provider_ref: None,
            target_ref: new.target_ref,
            credential_id: Uuid::new_v4(),
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get(&self, id: i64) -> StoreResult<ServiceOrder> {
        self.orders
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("service order", id))
    }

    async fn get_by_intent(&self, intent_id: Uuid) -> StoreResult<Option<ServiceOrder>> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .find(|o| o.related_intent_id == intent_id)
            .cloned())
    }

    async fn record_attempt(&self, id: i64, error: Option<&str>) -> StoreResult<ServiceOrder> {
        let error = error.map(str::to_string);
        self.update(id, move |order| {
            order.attempts += 1;
            if error.is_some() {
                order.last_error = error;
            }
        })
        .await
    }

    async fn record_provider_ref(&self, id: i64, provider_ref: &str) -> StoreResult<ServiceOrder> {
        let provider_ref = provider_ref.to_string();
        self.update(id, move |order| {
            if order.provisioning_state == ProvisioningState::Pending {
                order.provider_ref = Some(provider_ref);
            }
        })
        .await
    }

    async fn mark_provisioned(&self, id: i64) -> StoreResult<bool> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("service order", id))?;
        if order.provisioning_state != ProvisioningState::Pending {
            return Ok(false);
        }
        order.provisioning_state = ProvisioningState::Provisioned;
        order.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_failed(&self, id: i64, error: &str) -> StoreResult<ServiceOrder> {
        let error = error.to_string();
        self.update(id, move |order| {
            if order.provisioning_state != ProvisioningState::Provisioned {
                order.provisioning_state = ProvisioningState::Failed;
                order.last_error = Some(error);
            }
        })
        .await
    }

    async fn promote_finalized(&self) -> StoreResult<u64> {
        let finalized: Vec<Uuid> = {
            let intents = self.payments.intents.read().await;
            intents
                .values()
                .filter(|i| i.state == IntentState::Finalized)
                .map(|i| i.id)
                .collect()
        };

        let mut orders = self.orders.write().await;
        let mut promoted = 0;
        for order in orders.values_mut() {
            if order.provisioning_state == ProvisioningState::Pending
                && order.provider_ref.is_some()
                && finalized.contains(&order.related_intent_id)
            {
                order.provisioning_state = ProvisioningState::Provisioned;
                order.updated_at = Utc::now();
                promoted += 1;
            }
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnshop_shared::types::{
        CreditReason, FailureReason, OrderKind, PaymentPurpose, PlanSpec,
    };

    fn plan() -> PlanSpec {
        PlanSpec {
            plan_id: 1,
            inbound_id: 1,
            traffic_gb: 100,
            duration_days: 30,
            ip_limit: 0,
        }
    }

    async fn new_intent(store: &InMemoryPaymentStore, gateway: GatewayKind) -> PaymentIntent {
        store
            .create(NewPaymentIntent {
                user_id: 42,
                amount: 500,
                purpose: PaymentPurpose::NewService,
                gateway,
                plan: Some(plan()),
                upgrade_of: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn transition_only_succeeds_from_expected_state() {
        let store = InMemoryPaymentStore::new();
        let intent = new_intent(&store, GatewayKind::Cryptomus).await;

        let first = store
            .compare_and_transition(
                intent.id,
                IntentState::Created,
                StateChange::AwaitGateway { checkout_ref: Some("abc".into()) },
            )
            .await
            .unwrap();
        assert!(first.applied());

        let second = store
            .compare_and_transition(
                intent.id,
                IntentState::Created,
                StateChange::AwaitGateway { checkout_ref: None },
            )
            .await
            .unwrap();
        assert!(!second.applied());
        let current = second.into_intent();
        assert_eq!(current.state, IntentState::AwaitingGateway);
        assert_eq!(current.checkout_ref.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn illegal_edges_are_refused_before_touching_state() {
        let store = InMemoryPaymentStore::new();
        let intent = new_intent(&store, GatewayKind::Wallet).await;
        let err = store
            .compare_and_transition(intent.id, IntentState::Created, StateChange::Finalized)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        assert_eq!(store.get(intent.id).await.unwrap().state, IntentState::Created);
    }

    #[tokio::test]
    async fn gateway_reference_binds_to_one_intent() {
        let store = InMemoryPaymentStore::new();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let intent = new_intent(&store, GatewayKind::ZarinPal).await;
            for (from, change) in [
                (IntentState::Created, StateChange::AwaitGateway { checkout_ref: None }),
                (
                    IntentState::AwaitingGateway,
                    StateChange::BeginVerifying { payload: "{}".into() },
                ),
            ] {
                store.compare_and_transition(intent.id, from, change).await.unwrap();
            }
            ids.push(intent.id);
        }

        let verified = StateChange::Verified { gateway_ref: "ref-1".into() };
        store
            .compare_and_transition(ids[0], IntentState::Verifying, verified.clone())
            .await
            .unwrap();
        let err = store
            .compare_and_transition(ids[1], IntentState::Verifying, verified)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateGatewayRef(r) if r == "ref-1"));
        let found = store
            .find_by_gateway_ref(GatewayKind::ZarinPal, "ref-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, ids[0]);
    }

    #[tokio::test]
    async fn failed_transition_records_reason() {
        let store = InMemoryPaymentStore::new();
        let intent = new_intent(&store, GatewayKind::Wallet).await;
        let done = store
            .compare_and_transition(
                intent.id,
                IntentState::Created,
                StateChange::Failed { reason: FailureReason::InsufficientFunds },
            )
            .await
            .unwrap()
            .into_intent();
        assert_eq!(done.failure_reason, Some(FailureReason::InsufficientFunds));
        assert!(done.finalized_at.is_some());
    }

    #[tokio::test]
    async fn lease_excludes_other_owners_until_released() {
        let store = InMemoryPaymentStore::new();
        let intent = new_intent(&store, GatewayKind::Wallet).await;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease(intent.id, a, ttl).await.unwrap());
        assert!(store.acquire_lease(intent.id, a, ttl).await.unwrap());
        assert!(!store.acquire_lease(intent.id, b, ttl).await.unwrap());
        store.release_lease(intent.id, b).await.unwrap();
        assert!(!store.acquire_lease(intent.id, b, ttl).await.unwrap());
        store.release_lease(intent.id, a).await.unwrap();
        assert!(store.acquire_lease(intent.id, b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn renewal_needs_the_same_owner_and_a_fulfilling_intent() {
        let store = InMemoryPaymentStore::new();
        let intent = new_intent(&store, GatewayKind::Wallet).await;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease(intent.id, a, ttl).await.unwrap());
        assert!(!store.renew_lease(intent.id, a, ttl).await.unwrap());

        let steps = [
            (IntentState::Created, StateChange::AwaitGateway { checkout_ref: None }),
            (IntentState::AwaitingGateway, StateChange::BeginVerifying { payload: "{}".into() }),
            (IntentState::Verifying, StateChange::Verified { gateway_ref: "w-1".into() }),
            (IntentState::Verified, StateChange::BeginFulfilling),
        ];
        for (expected, change) in steps {
            store.compare_and_transition(intent.id, expected, change).await.unwrap();
        }

        assert!(store.renew_lease(intent.id, a, ttl).await.unwrap());
        assert!(!store.renew_lease(intent.id, b, ttl).await.unwrap());

        store.release_lease(intent.id, a).await.unwrap();
        assert!(!store.renew_lease(intent.id, a, ttl).await.unwrap());
        assert!(store.acquire_lease(intent.id, b, ttl).await.unwrap());
        assert!(!store.renew_lease(intent.id, a, ttl).await.unwrap());

        store
            .compare_and_transition(intent.id, IntentState::Fulfilling, StateChange::Finalized)
            .await
            .unwrap();
        assert!(!store.renew_lease(intent.id, b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = InMemoryPaymentStore::new();
        let intent = new_intent(&store, GatewayKind::Wallet).await;
        assert!(store.acquire_lease(intent.id, Uuid::new_v4(), Duration::ZERO).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.acquire_lease(intent.id, Uuid::new_v4(), Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn ledger_entries_are_idempotent_per_intent_and_reason() {
        let ledger = InMemoryWalletLedger::new();
        let intent = Uuid::new_v4();

        let first = ledger
            .apply(NewCreditTransaction::for_intent(1, 300, CreditReason::TopUp, intent))
            .await
            .unwrap();
        let again = ledger
            .apply(NewCreditTransaction::for_intent(1, 300, CreditReason::TopUp, intent))
            .await
            .unwrap();
        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(again.transaction_id, first.transaction_id);
        assert_eq!(ledger.balance(1).await.unwrap(), 300);

        // Same intent, different reason, is a separate entry.
        ledger
            .apply(NewCreditTransaction::for_intent(1, -300, CreditReason::Purchase, intent))
            .await
            .unwrap();
        assert_eq!(ledger.balance(1).await.unwrap(), 0);
        assert_eq!(ledger.transactions(1, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn debit_beyond_balance_writes_nothing() {
        let ledger = InMemoryWalletLedger::new();
        ledger
            .apply(NewCreditTransaction::for_intent(5, 100, CreditReason::TopUp, Uuid::new_v4()))
            .await
            .unwrap();
        let err = ledger
            .apply(NewCreditTransaction::for_intent(5, -101, CreditReason::Purchase, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds { balance: 100, requested: 101 }));
        assert_eq!(ledger.balance(5).await.unwrap(), 100);
        assert_eq!(ledger.transactions(5, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overflowing_credit_is_refused_without_writing() {
        let ledger = InMemoryWalletLedger::new();
        ledger
            .apply(NewCreditTransaction::for_intent(6, 500, CreditReason::TopUp, Uuid::new_v4()))
            .await
            .unwrap();

        let err = ledger
            .apply(NewCreditTransaction {
                wallet_user_id: 6,
                delta: i64::MAX,
                reason: CreditReason::AdminAdjustment,
                related_intent_id: None,
                note: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::BalanceOverflow { user_id: 6, balance: 500, delta: i64::MAX }
        ));

        let err = ledger
            .apply(NewCreditTransaction {
                wallet_user_id: 6,
                delta: i64::MIN,
                reason: CreditReason::AdminAdjustment,
                related_intent_id: None,
                note: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds { balance: 500, requested: i64::MAX }));

        assert_eq!(ledger.balance(6).await.unwrap(), 500);
        assert_eq!(ledger.transactions(6, 10).await.unwrap().len(), 1);
        assert!(ledger.find_discrepancies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discrepancy_check_spots_tampered_balance() {
        let ledger = InMemoryWalletLedger::new();
        ledger
            .apply(NewCreditTransaction::for_intent(9, 250, CreditReason::TopUp, Uuid::new_v4()))
            .await
            .unwrap();
        assert!(ledger.find_discrepancies().await.unwrap().is_empty());

        ledger.overwrite_balance(9, 999).await;
        assert_eq!(
            ledger.find_discrepancies().await.unwrap(),
            vec![LedgerDiscrepancy { user_id: 9, stored_balance: 999, ledger_sum: 250 }]
        );
    }

    #[tokio::test]
    async fn orders_are_unique_per_intent_and_promoted_after_finalize() {
        let payments = InMemoryPaymentStore::new();
        let orders = InMemoryOrderStore::new(payments.clone());
        let intent = new_intent(&payments, GatewayKind::Wallet).await;
        let new = NewServiceOrder {
            user_id: 42,
            related_intent_id: intent.id,
            kind: OrderKind::New,
            spec: plan(),
            target_ref: None,
        };

        let order = orders.get_or_create(new.clone()).await.unwrap();
        let same = orders.get_or_create(new).await.unwrap();
        assert_eq!(order.id, same.id);
        assert_eq!(order.credential_id, same.credential_id);

        orders.record_provider_ref(order.id, "1:abc:user").await.unwrap();
        assert_eq!(orders.promote_finalized().await.unwrap(), 0);

        for (from, change) in [
            (IntentState::Created, StateChange::AwaitGateway { checkout_ref: None }),
            (IntentState::AwaitingGateway, StateChange::BeginVerifying { payload: String::new() }),
            (IntentState::Verifying, StateChange::Verified { gateway_ref: "w".into() }),
            (IntentState::Verified, StateChange::BeginFulfilling),
            (IntentState::Fulfilling, StateChange::Finalized),
        ] {
            payments.compare_and_transition(intent.id, from, change).await.unwrap();
        }
        assert_eq!(orders.promote_finalized().await.unwrap(), 1);
        let order = orders.get(order.id).await.unwrap();
        assert_eq!(order.provisioning_state, ProvisioningState::Provisioned);
        assert!(!orders.mark_provisioned(order.id).await.unwrap());
    }
}
