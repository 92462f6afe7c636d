//! Fakes for exercising the payment services without a database, a gateway or a panel.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use vpnshop_db::memory::{InMemoryOrderStore, InMemoryPaymentStore, InMemoryWalletLedger};
use vpnshop_db::models::order::ServiceOrder;
use vpnshop_db::models::payment::{NewPaymentIntent, PaymentIntent};
use vpnshop_db::models::wallet::NewCreditTransaction;
use vpnshop_db::store::{PaymentStore, WalletLedger};
use vpnshop_shared::types::{CreditReason, FailureReason, GatewayKind, PaymentPurpose, PlanSpec};

use crate::services::fulfillment::{FulfillmentDispatcher, RetryPolicy};
use crate::services::notification_service::{Notifier, Outcome};
use crate::services::orchestrator::Orchestrator;
use crate::services::payment::{
    CallbackNotice, Checkout, GatewayConfirmation, PaymentGateway, RawCallback, Verdict,
    VerificationError,
};
use crate::services::provisioning::{ProviderRef, ProvisioningAdapter, ProvisioningError};

pub(crate) const SIGNATURE_HEADER: &str = "x-test-signature";
pub(crate) const GOOD_SIGNATURE: &str = "trusted";

/// Gateway whose callbacks are JSON bodies signed with a fixed header value.
///
/// `confirm` answers from a script; once the script is empty it echoes the
/// callback's reference and amount.
pub(crate) struct FakeGateway {
    kind: GatewayKind,
    confirmations: Mutex<VecDeque<Result<GatewayConfirmation, VerificationError>>>,
    confirm_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new(kind: GatewayKind) -> Self {
        Self {
            kind,
            confirmations: Mutex::new(VecDeque::new()),
            confirm_calls: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, result: Result<GatewayConfirmation, VerificationError>) {
        self.confirmations.lock().unwrap().push_back(result);
    }

    pub fn confirm_calls(&self) -> usize {
        self.confirm_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn kind(&self) -> GatewayKind {
        self.kind
    }

    async fn create_checkout(
        &self,
        intent: &PaymentIntent,
        callback_url: &str,
    ) -> Result<Checkout, VerificationError> {
        Ok(Checkout {
            redirect_url: format!("https://pay.test/{}?cb={callback_url}", intent.id),
            checkout_ref: format!("chk-{}", intent.id.simple()),
        })
    }

    fn authenticate(&self, raw: &RawCallback) -> Result<CallbackNotice, VerificationError> {
        if raw.header(SIGNATURE_HEADER) != Some(GOOD_SIGNATURE) {
            return Err(VerificationError::Unauthenticated("bad test signature".into()));
        }
        let body: Value = serde_json::from_str(&raw.body)
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;
        let intent_id = body["intent"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| VerificationError::Malformed("intent".into()))?;
        let verdict = match body["status"].as_str() {
            Some("paid") => Verdict::Paid,
            Some("pending") => Verdict::InProgress,
            Some("failed") => Verdict::Declined(FailureReason::PaymentNotCompleted),
            _ => return Err(VerificationError::Malformed("status".into())),
        };
        Ok(CallbackNotice {
            intent_id,
            verdict,
            amount: body["amount"].as_i64(),
            reference: body["reference"].as_str().map(str::to_string),
        })
    }

    async fn confirm(
        &self,
        notice: &CallbackNotice,
        intent: &PaymentIntent,
    ) -> Result<GatewayConfirmation, VerificationError> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.confirmations.lock().unwrap().pop_front() {
            return scripted;
        }
        if let Verdict::Declined(reason) = notice.verdict {
            return Err(VerificationError::Declined(reason));
        }
        Ok(GatewayConfirmation {
            gateway_ref: notice
                .reference
                .clone()
                .unwrap_or_else(|| format!("ref-{}", intent.id.simple())),
            amount: notice.amount.unwrap_or(intent.amount),
        })
    }
}

/// Panel stand-in. Answers provisioning calls from a script, then succeeds.
#[derive(Default)]
pub(crate) struct ScriptedAdapter {
    script: Mutex<VecDeque<Result<(), ProvisioningError>>>,
    /// Entitlements that exist on the "panel", keyed by credential.
    created: Mutex<HashMap<Uuid, ProviderRef>>,
    renewed: Mutex<Vec<(ProviderRef, i64)>>,
    deactivated: Mutex<Vec<ProviderRef>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedAdapter {
    pub fn script(&self, results: impl IntoIterator<Item = Result<(), ProvisioningError>>) {
        self.script.lock().unwrap().extend(results);
    }

    /// Makes every provisioning call take `delay` before answering.
    pub fn slow(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn renewed(&self) -> Vec<(ProviderRef, i64)> {
        self.renewed.lock().unwrap().clone()
    }

    pub fn deactivated(&self) -> Vec<ProviderRef> {
        self.deactivated.lock().unwrap().clone()
    }

    async fn next(&self) -> Result<(), ProvisioningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl ProvisioningAdapter for ScriptedAdapter {
    async fn find(&self, order: &ServiceOrder) -> Result<Option<ProviderRef>, ProvisioningError> {
        Ok(self.created.lock().unwrap().get(&order.credential_id).cloned())
    }

    async fn provision(&self, order: &ServiceOrder) -> Result<ProviderRef, ProvisioningError> {
        self.next().await?;
        let provider_ref = format!("{}:{}", order.spec.inbound_id, order.credential_id);
        self.created
            .lock()
            .unwrap()
            .insert(order.credential_id, provider_ref.clone());
        Ok(provider_ref)
    }

    async fn renew(&self, provider_ref: &str, order: &ServiceOrder) -> Result<(), ProvisioningError> {
        self.next().await?;
        self.renewed
            .lock()
            .unwrap()
            .push((provider_ref.to_string(), order.spec.plan_id));
        Ok(())
    }

    async fn deactivate(&self, provider_ref: &str) -> Result<(), ProvisioningError> {
        self.deactivated.lock().unwrap().push(provider_ref.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(i64, Outcome)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(i64, Outcome)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_for(&self, intent_id: Uuid) -> usize {
        self.sent()
            .iter()
            .filter(|(_, outcome)| outcome.intent_id == intent_id)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, user_id: i64, outcome: &Outcome) {
        self.sent.lock().unwrap().push((user_id, outcome.clone()));
    }
}

pub(crate) const USER: i64 = 4242;

pub(crate) fn plan(plan_id: i64) -> PlanSpec {
    PlanSpec {
        plan_id,
        inbound_id: 3,
        traffic_gb: 50,
        duration_days: 30,
        ip_limit: 2,
    }
}

/// Zero-delay retry policy so tests do not depend on the clock unless they pause it.
pub(crate) fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        attempt_timeout: Duration::from_secs(5),
    }
}

/// A full orchestrator wired to in-memory stores and fakes.
pub(crate) struct Harness {
    pub payments: InMemoryPaymentStore,
    pub ledger: InMemoryWalletLedger,
    pub orders: InMemoryOrderStore,
    pub adapter: Arc<ScriptedAdapter>,
    pub zarinpal: Arc<FakeGateway>,
    pub cryptomus: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(fast_policy(3))
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self::with_lease(policy, Duration::from_secs(300))
    }

    pub fn with_lease(policy: RetryPolicy, lease_ttl: Duration) -> Self {
        let payments = InMemoryPaymentStore::new();
        let ledger = InMemoryWalletLedger::new();
        let orders = InMemoryOrderStore::new(payments.clone());
        let adapter = Arc::new(ScriptedAdapter::default());
        let zarinpal = Arc::new(FakeGateway::new(GatewayKind::ZarinPal));
        let cryptomus = Arc::new(FakeGateway::new(GatewayKind::Cryptomus));
        let notifier = Arc::new(RecordingNotifier::default());

        let dispatcher = FulfillmentDispatcher::new(
            Arc::new(payments.clone()),
            Arc::new(ledger.clone()),
            Arc::new(orders.clone()),
            adapter.clone(),
            policy,
        );
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(payments.clone()),
            Arc::new(ledger.clone()),
            Arc::new(orders.clone()),
            vec![
                zarinpal.clone() as Arc<dyn PaymentGateway>,
                cryptomus.clone() as Arc<dyn PaymentGateway>,
            ],
            dispatcher,
            notifier.clone(),
            "https://shop.test/",
            lease_ttl,
        ));

        Self {
            payments,
            ledger,
            orders,
            adapter,
            zarinpal,
            cryptomus,
            notifier,
            orchestrator,
        }
    }

    pub async fn intent(
        &self,
        purpose: PaymentPurpose,
        gateway: GatewayKind,
        amount: i64,
    ) -> PaymentIntent {
        self.payments
            .create(NewPaymentIntent {
                user_id: USER,
                amount,
                purpose,
                gateway,
                plan: purpose.is_service().then(|| plan(1)),
                upgrade_of: None,
            })
            .await
            .unwrap()
    }

    /// An external intent whose checkout is already open.
    pub async fn awaiting(&self, purpose: PaymentPurpose, gateway: GatewayKind, amount: i64) -> PaymentIntent {
        let intent = self.intent(purpose, gateway, amount).await;
        self.orchestrator.begin_checkout(intent.id).await.unwrap().intent
    }

    pub async fn fund(&self, amount: i64) {
        self.ledger
            .apply(NewCreditTransaction {
                wallet_user_id: USER,
                delta: amount,
                reason: CreditReason::AdminAdjustment,
                related_intent_id: None,
                note: Some("test funding".into()),
            })
            .await
            .unwrap();
    }

    pub async fn balance(&self) -> i64 {
        self.ledger.balance(USER).await.unwrap()
    }

    pub async fn reload(&self, id: Uuid) -> PaymentIntent {
        self.payments.get(id).await.unwrap()
    }
}

/// A signed callback body for [`FakeGateway`].
pub(crate) fn callback(intent_id: Uuid, status: &str, amount: i64, reference: &str) -> RawCallback {
    let body = serde_json::json!({
        "intent": intent_id.to_string(),
        "status": status,
        "amount": amount,
        "reference": reference,
    });
    let mut headers = BTreeMap::new();
    headers.insert(SIGNATURE_HEADER.to_string(), GOOD_SIGNATURE.to_string());
    RawCallback {
        query: None,
        body: body.to_string(),
        headers,
    }
}
