use super::*;
use crate::services::testing::{fast_policy, plan, ScriptedAdapter, USER};
use vpnshop_db::memory::{InMemoryOrderStore, InMemoryPaymentStore, InMemoryWalletLedger};
use vpnshop_db::models::payment::{NewPaymentIntent, StateChange};
use vpnshop_db::store::PaymentStore;
use vpnshop_shared::types::IntentState;

struct Setup {
    payments: InMemoryPaymentStore,
    ledger: InMemoryWalletLedger,
    orders: InMemoryOrderStore,
    adapter: Arc<ScriptedAdapter>,
    dispatcher: FulfillmentDispatcher,
    lease: FulfillmentLease,
}

fn setup(policy: RetryPolicy) -> Setup {
    let payments = InMemoryPaymentStore::new();
    let ledger = InMemoryWalletLedger::new();
    let orders = InMemoryOrderStore::new(payments.clone());
    let adapter = Arc::new(ScriptedAdapter::default());
    let dispatcher = FulfillmentDispatcher::new(
        Arc::new(payments.clone()),
        Arc::new(ledger.clone()),
        Arc::new(orders.clone()),
        adapter.clone(),
        policy,
    );
    Setup {
        payments,
        ledger,
        orders,
        adapter,
        dispatcher,
        lease: FulfillmentLease {
            owner: Uuid::new_v4(),
            ttl: Duration::from_secs(300),
        },
    }
}

impl Setup {
    async fn intent(&self, purpose: PaymentPurpose, gateway: GatewayKind, amount: i64) -> PaymentIntent {
        let created = self
            .payments
            .create(NewPaymentIntent {
                user_id: USER,
                amount,
                purpose,
                gateway,
                plan: purpose.is_service().then(|| plan(1)),
                upgrade_of: None,
            })
            .await
            .unwrap();
        self.start(created).await
    }

    async fn upgrade(&self, of: i64, plan_id: i64) -> PaymentIntent {
        let created = self
            .payments
            .create(NewPaymentIntent {
                user_id: USER,
                amount: 700,
                purpose: PaymentPurpose::UpgradeService,
                gateway: GatewayKind::Cryptomus,
                plan: Some(plan(plan_id)),
                upgrade_of: Some(of),
            })
            .await
            .unwrap();
        self.start(created).await
    }

    /// Walks a new intent to `Fulfilling` and takes its lease, as the orchestrator does.
    async fn start(&self, intent: PaymentIntent) -> PaymentIntent {
        let steps = [
            (IntentState::Created, StateChange::AwaitGateway { checkout_ref: None }),
            (IntentState::AwaitingGateway, StateChange::BeginVerifying { payload: "{}".into() }),
            (
                IntentState::Verifying,
                StateChange::Verified { gateway_ref: format!("ref-{}", intent.id.simple()) },
            ),
            (IntentState::Verified, StateChange::BeginFulfilling),
        ];
        for (expected, change) in steps {
            self.payments
                .compare_and_transition(intent.id, expected, change)
                .await
                .unwrap();
        }
        assert!(self
            .payments
            .acquire_lease(intent.id, self.lease.owner, self.lease.ttl)
            .await
            .unwrap());
        self.payments.get(intent.id).await.unwrap()
    }

    /// Another driver takes the lease over, as after an expiry.
    async fn steal_lease(&self, id: Uuid) {
        self.payments.release_lease(id, self.lease.owner).await.unwrap();
        assert!(self.payments.acquire_lease(id, Uuid::new_v4(), self.lease.ttl).await.unwrap());
    }

    async fn refunds(&self) -> usize {
        self.ledger
            .transactions(USER, 20)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.reason == CreditReason::Refund)
            .count()
    }

    async fn balance(&self) -> i64 {
        self.ledger.balance(USER).await.unwrap()
    }

    async fn fund(&self, amount: i64) {
        self.ledger
            .apply(NewCreditTransaction {
                wallet_user_id: USER,
                delta: amount,
                reason: CreditReason::AdminAdjustment,
                related_intent_id: None,
                note: None,
            })
            .await
            .unwrap();
    }
}

#[test]
fn backoff_doubles_until_capped() {
    let policy = RetryPolicy::default();
    let delays: Vec<u64> = (1..=7).map(|a| policy.delay_for(a).as_secs()).collect();
    assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
    assert_eq!(policy.delay_for(200), Duration::from_secs(60));
}

#[tokio::test]
async fn top_up_credits_exactly_once() {
    let s = setup(fast_policy(3));
    let intent = s.intent(PaymentPurpose::WalletTopUp, GatewayKind::ZarinPal, 50_000).await;

    for _ in 0..3 {
        let outcome = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
        assert_eq!(outcome, FulfillmentOutcome::Fulfilled { order_id: None });
    }
    assert_eq!(s.balance().await, 50_000);
    assert_eq!(s.ledger.transactions(USER, 10).await.unwrap().len(), 1);
    assert_eq!(s.adapter.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_the_same_credential() {
    let s = setup(RetryPolicy::default());
    s.adapter.script([
        Err(ProvisioningError::Transient("502".into())),
        Err(ProvisioningError::Transient("connection reset".into())),
    ]);
    let intent = s.intent(PaymentPurpose::NewService, GatewayKind::ZarinPal, 30_000).await;

    let started = tokio::time::Instant::now();
    let outcome = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
    let order = s.orders.get_by_intent(intent.id).await.unwrap().unwrap();

    assert_eq!(outcome, FulfillmentOutcome::Fulfilled { order_id: Some(order.id) });
    assert_eq!(s.adapter.calls(), 3);
    assert_eq!(s.adapter.created(), 1);
    assert_eq!(order.attempts, 3);
    assert_eq!(
        order.provider_ref.as_deref(),
        Some(format!("3:{}", order.credential_id).as_str())
    );
    // 2s after the first failure, 4s after the second.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7), "{waited:?}");
    assert_eq!(s.balance().await, 0);
}

#[tokio::test]
async fn permanent_rejection_refunds_once() {
    let s = setup(fast_policy(5));
    s.adapter.script([Err(ProvisioningError::Permanent("inbound full".into()))]);
    let intent = s.intent(PaymentPurpose::NewService, GatewayKind::Cryptomus, 30_000).await;

    let outcome = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
    assert_eq!(outcome, FulfillmentOutcome::Failed(FailureReason::ProvisioningRejected));
    assert_eq!(s.adapter.calls(), 1);
    assert_eq!(s.balance().await, 30_000);

    // A second run (e.g. the sweep) sees the failed order and does nothing new.
    let again = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
    assert_eq!(again, FulfillmentOutcome::Failed(FailureReason::ProvisioningRejected));
    assert_eq!(s.adapter.calls(), 1);
    assert_eq!(s.balance().await, 30_000);

    let order = s.orders.get_by_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(order.provisioning_state, ProvisioningState::Failed);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_refund_once() {
    let s = setup(fast_policy(3));
    s.adapter.script((0..3).map(|_| Err(ProvisioningError::Transient("503".into()))));
    let intent = s.intent(PaymentPurpose::NewService, GatewayKind::ZarinPal, 12_000).await;

    let outcome = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
    assert_eq!(outcome, FulfillmentOutcome::Failed(FailureReason::ProvisioningExhausted));
    assert_eq!(s.adapter.calls(), 3);
    assert_eq!(s.adapter.created(), 0);
    assert_eq!(s.balance().await, 12_000);

    let refunds = s
        .ledger
        .transactions(USER, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.reason == CreditReason::Refund)
        .count();
    assert_eq!(refunds, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_panel_calls_count_as_transient() {
    let mut policy = fast_policy(2);
    policy.attempt_timeout = Duration::from_secs(15);
    let s = setup(policy);
    s.adapter.slow(Duration::from_secs(60));
    let intent = s.intent(PaymentPurpose::NewService, GatewayKind::ZarinPal, 9_000).await;

    let outcome = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
    assert_eq!(outcome, FulfillmentOutcome::Failed(FailureReason::ProvisioningExhausted));
    assert_eq!(s.adapter.calls(), 2);

    let order = s.orders.get_by_intent(intent.id).await.unwrap().unwrap();
    assert!(order.last_error.unwrap().starts_with("provisioning_exhausted:"));
}

#[tokio::test]
async fn attempts_survive_a_restart() {
    let s = setup(fast_policy(3));
    let intent = s.intent(PaymentPurpose::NewService, GatewayKind::ZarinPal, 9_000).await;
    let order = s
        .orders
        .get_or_create(NewServiceOrder {
            user_id: USER,
            related_intent_id: intent.id,
            kind: OrderKind::New,
            spec: plan(1),
            target_ref: None,
        })
        .await
        .unwrap();
    // Two attempts were spent before the process died.
    s.orders.record_attempt(order.id, Some("timeout")).await.unwrap();
    s.orders.record_attempt(order.id, Some("timeout")).await.unwrap();

    s.adapter.script([Err(ProvisioningError::Transient("503".into()))]);
    let outcome = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
    assert_eq!(outcome, FulfillmentOutcome::Failed(FailureReason::ProvisioningExhausted));
    assert_eq!(s.adapter.calls(), 1);
}

#[tokio::test]
async fn wallet_purchase_debits_once() {
    let s = setup(fast_policy(3));
    s.fund(50_000).await;
    let intent = s.intent(PaymentPurpose::NewService, GatewayKind::Wallet, 30_000).await;

    let first = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
    let second = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(s.balance().await, 20_000);
    assert_eq!(s.adapter.calls(), 1);
}

#[tokio::test]
async fn wallet_purchase_without_funds_never_provisions() {
    let s = setup(fast_policy(3));
    s.fund(1_000).await;
    let intent = s.intent(PaymentPurpose::NewService, GatewayKind::Wallet, 30_000).await;

    let outcome = s.dispatcher.fulfill(&intent, s.lease).await.unwrap();
    assert_eq!(outcome, FulfillmentOutcome::Failed(FailureReason::InsufficientFunds));
    assert_eq!(s.adapter.calls(), 0);
    assert_eq!(s.balance().await, 1_000);
}

#[tokio::test]
async fn upgrades_update_the_existing_client() {
    let s = setup(fast_policy(3));
    let first = s.intent(PaymentPurpose::NewService, GatewayKind::ZarinPal, 30_000).await;
    let FulfillmentOutcome::Fulfilled { order_id: Some(prior) } = s.dispatcher.fulfill(&first, s.lease).await.unwrap()
    else {
        panic!("first purchase should provision");
    };
    assert!(s.orders.mark_provisioned(prior).await.unwrap());
    let target = s.orders.get(prior).await.unwrap().provider_ref.unwrap();

    let upgrade = s.upgrade(prior, 2).await;
    s.dispatcher.fulfill(&upgrade, s.lease).await.unwrap();
    let renewal = s.upgrade(prior, 1).await;
    s.dispatcher.fulfill(&renewal, s.lease).await.unwrap();

    assert_eq!(s.adapter.created(), 1);
    assert_eq!(s.adapter.renewed(), vec![(target.clone(), 2), (target.clone(), 1)]);

    let upgrade_order = s.orders.get_by_intent(upgrade.id).await.unwrap().unwrap();
    assert_eq!(upgrade_order.kind, OrderKind::Upgrade);
    assert_eq!(upgrade_order.provider_ref, Some(target.clone()));
    let renewal_order = s.orders.get_by_intent(renewal.id).await.unwrap().unwrap();
    assert_eq!(renewal_order.kind, OrderKind::Renew);
}

#[tokio::test]
async fn upgrade_of_unknown_order_is_refunded() {
    let s = setup(fast_policy(3));
    let upgrade = s.upgrade(999, 2).await;

    let outcome = s.dispatcher.fulfill(&upgrade, s.lease).await.unwrap();
    assert_eq!(outcome, FulfillmentOutcome::Failed(FailureReason::ProvisioningRejected));
    assert_eq!(s.adapter.calls(), 0);
    assert_eq!(s.balance().await, 700);
}

#[tokio::test]
async fn upgrade_of_unprovisioned_order_is_refunded() {
    let s = setup(fast_policy(1));
    s.adapter.script([Err(ProvisioningError::Permanent("bad inbound".into()))]);
    let first = s.intent(PaymentPurpose::NewService, GatewayKind::ZarinPal, 30_000).await;
    s.dispatcher.fulfill(&first, s.lease).await.unwrap();
    let failed = s.orders.get_by_intent(first.id).await.unwrap().unwrap();

    let upgrade = s.upgrade(failed.id, 2).await;
    let outcome = s.dispatcher.fulfill(&upgrade, s.lease).await.unwrap();
    assert_eq!(outcome, FulfillmentOutcome::Failed(FailureReason::ProvisioningRejected));
    // Both intents refunded.
    assert_eq!(s.balance().await, 30_700);
}

#[tokio::test]
async fn missing_plan_is_an_error() {
    let s = setup(fast_policy(1));
    let mut intent = s.intent(PaymentPurpose::NewService, GatewayKind::ZarinPal, 100).await;
    intent.plan = None;
    assert!(matches!(
        s.dispatcher.fulfill(&intent, s.lease).await,
        Err(FulfillmentError::MissingPlan(id)) if id == intent.id
    ));
}

#[tokio::test(start_paused = true)]
async fn lost_lease_stops_before_the_next_attempt() {
    let s = setup(fast_policy(3));
    s.adapter.slow(Duration::from_secs(1));
    s.adapter.script([Err(ProvisioningError::Transient("502".into()))]);
    let intent = s.intent(PaymentPurpose::NewService, GatewayKind::ZarinPal, 30_000).await;

    let (outcome, ()) = tokio::join!(s.dispatcher.fulfill(&intent, s.lease), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        s.steal_lease(intent.id).await;
    });

    assert!(matches!(outcome, Err(FulfillmentError::LeaseLost(id)) if id == intent.id));
    assert_eq!(s.adapter.calls(), 1);
    assert_eq!(s.refunds().await, 0);
    let order = s.orders.get_by_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(order.provisioning_state, ProvisioningState::Pending);
}

#[tokio::test(start_paused = true)]
async fn no_refund_once_another_run_finalized() {
    let s = setup(fast_policy(3));
    s.adapter.slow(Duration::from_secs(1));
    s.adapter.script([Err(ProvisioningError::Permanent("duplicate email".into()))]);
    let intent = s.intent(PaymentPurpose::NewService, GatewayKind::Cryptomus, 30_000).await;

    let (outcome, ()) = tokio::join!(s.dispatcher.fulfill(&intent, s.lease), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        s.payments
            .compare_and_transition(intent.id, IntentState::Fulfilling, StateChange::Finalized)
            .await
            .unwrap();
    });

    assert!(matches!(outcome, Err(FulfillmentError::LeaseLost(_))));
    assert_eq!(s.refunds().await, 0);
    assert_eq!(s.balance().await, 0);
    let order = s.orders.get_by_intent(intent.id).await.unwrap().unwrap();
    assert_ne!(order.provisioning_state, ProvisioningState::Failed);
}

#[tokio::test]
async fn refund_paths_check_the_lease_too() {
    let s = setup(fast_policy(3));
    let upgrade = s.upgrade(999, 2).await;
    s.steal_lease(upgrade.id).await;

    assert!(matches!(
        s.dispatcher.fulfill(&upgrade, s.lease).await,
        Err(FulfillmentError::LeaseLost(_))
    ));
    assert_eq!(s.balance().await, 0);
}

#[test]
fn longest_run_adds_every_timeout_and_backoff() {
    let policy = RetryPolicy::default();
    // 5 x 15s, then 2s + 4s + 8s + 16s between attempts.
    assert_eq!(policy.longest_run(), Duration::from_secs(105));
    assert_eq!(fast_policy(1).longest_run(), Duration::from_secs(5));
}
