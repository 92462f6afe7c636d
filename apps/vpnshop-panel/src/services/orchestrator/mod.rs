//! Payment orchestration: every entry point that can move an intent.
//!
//! Webhooks, wallet charges, admin finalization and the reconciliation sweep
//! all re-read the intent and move it with a compare-and-transition; only the
//! caller that wins a transition performs the work tied to it and sends the
//! notification for a terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vpnshop_db::models::payment::{NewPaymentIntent, PaymentIntent, StateChange};
use vpnshop_db::models::wallet::NewCreditTransaction;
use vpnshop_db::store::{OrderStore, PaymentStore, StoreError, Transition, WalletLedger};
use vpnshop_shared::types::{CreditReason, FailureReason, GatewayKind, IntentState};

use crate::services::fulfillment::{
    FulfillmentDispatcher, FulfillmentError, FulfillmentLease, FulfillmentOutcome,
};
use crate::services::notification_service::{Notifier, Outcome};
use crate::services::payment::{
    CallbackNotice, PaymentGateway, RawCallback, Verdict, VerificationError,
};

/// Marker stored as the callback payload of wallet-paid intents.
const WALLET_PAYLOAD: &str = "wallet";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("intent {id} is {state}; cannot {action}")]
    WrongState {
        id: Uuid,
        state: IntentState,
        action: &'static str,
    },
    #[error(transparent)]
    Fulfillment(#[from] FulfillmentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where an intent stands after an entry point ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub intent_id: Uuid,
    pub state: IntentState,
    pub reason: Option<FailureReason>,
    /// Whether this call changed anything.
    pub applied: bool,
}

impl Settlement {
    fn of(intent: &PaymentIntent, applied: bool) -> Self {
        Self {
            intent_id: intent.id,
            state: intent.state,
            reason: intent.failure_reason,
            applied,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutStarted {
    pub intent: PaymentIntent,
    pub redirect_url: String,
}

pub struct Orchestrator {
    payments: Arc<dyn PaymentStore>,
    ledger: Arc<dyn WalletLedger>,
    orders: Arc<dyn OrderStore>,
    gateways: HashMap<GatewayKind, Arc<dyn PaymentGateway>>,
    dispatcher: FulfillmentDispatcher,
    notifier: Arc<dyn Notifier>,
    public_base_url: String,
    lease_ttl: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        ledger: Arc<dyn WalletLedger>,
        orders: Arc<dyn OrderStore>,
        gateways: Vec<Arc<dyn PaymentGateway>>,
        dispatcher: FulfillmentDispatcher,
        notifier: Arc<dyn Notifier>,
        public_base_url: &str,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            payments,
            ledger,
            orders,
            gateways: gateways.into_iter().map(|g| (g.kind(), g)).collect(),
            dispatcher,
            notifier,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            lease_ttl,
        }
    }

    pub fn payments(&self) -> &Arc<dyn PaymentStore> {
        &self.payments
    }

    pub fn ledger(&self) -> &Arc<dyn WalletLedger> {
        &self.ledger
    }

    pub fn orders(&self) -> &Arc<dyn OrderStore> {
        &self.orders
    }

    pub fn supports(&self, kind: GatewayKind) -> bool {
        self.gateways.contains_key(&kind)
    }

    fn gateway(&self, kind: GatewayKind) -> Result<&Arc<dyn PaymentGateway>, VerificationError> {
        self.gateways
            .get(&kind)
            .ok_or(VerificationError::UnsupportedGateway(kind))
    }

    fn callback_url(&self, intent: &PaymentIntent) -> String {
        format!(
            "{}/payments/{}?intent={}",
            self.public_base_url,
            intent.gateway,
            intent.id.simple()
        )
    }

    /// Sends the single notification for a terminal state this caller produced.
    fn announce(&self, intent: &PaymentIntent) {
        if intent.state.is_terminal() {
            self.notifier.notify(intent.user_id, &Outcome::from_intent(intent));
        }
    }

    /// Applies a transition and notifies if it landed the intent in a terminal state.
    async fn transition(
        &self,
        id: Uuid,
        expected: IntentState,
        change: StateChange,
    ) -> Result<Transition, StoreError> {
        let outcome = self.payments.compare_and_transition(id, expected, change).await?;
        match &outcome {
            Transition::Applied(intent) => {
                debug!(intent_id = %id, from = %expected, to = %intent.state, "intent transitioned");
                self.announce(intent);
            }
            Transition::Lost(current) => {
                debug!(intent_id = %id, expected = %expected, actual = %current.state, "transition lost");
            }
        }
        Ok(outcome)
    }

    pub async fn create_intent(&self, new: NewPaymentIntent) -> Result<PaymentIntent, OrchestratorError> {
        if new.gateway.is_external() {
            self.gateway(new.gateway)?;
        }
        let intent = self.payments.create(new).await?;
        info!(
            intent_id = %intent.id,
            user_id = intent.user_id,
            amount = intent.amount,
            purpose = %intent.purpose,
            gateway = %intent.gateway,
            "payment intent created"
        );
        Ok(intent)
    }

    pub async fn status(&self, id: Uuid) -> Result<Settlement, OrchestratorError> {
        let intent = self.payments.get(id).await?;
        Ok(Settlement::of(&intent, false))
    }

    /// Opens a gateway checkout for a fresh intent.
    pub async fn begin_checkout(&self, id: Uuid) -> Result<CheckoutStarted, OrchestratorError> {
        let intent = self.payments.get(id).await?;
        if intent.state != IntentState::Created || !intent.gateway.is_external() {
            return Err(OrchestratorError::WrongState {
                id,
                state: intent.state,
                action: "begin checkout",
            });
        }

        let gateway = self.gateway(intent.gateway)?;
        let checkout = gateway
            .create_checkout(&intent, &self.callback_url(&intent))
            .await?;

        match self
            .transition(
                id,
                IntentState::Created,
                StateChange::AwaitGateway {
                    checkout_ref: Some(checkout.checkout_ref.clone()),
                },
            )
            .await?
        {
            Transition::Applied(intent) => {
                info!(intent_id = %id, checkout_ref = %checkout.checkout_ref, "checkout opened");
                Ok(CheckoutStarted {
                    intent,
                    redirect_url: checkout.redirect_url,
                })
            }
            Transition::Lost(current) => Err(OrchestratorError::WrongState {
                id,
                state: current.state,
                action: "begin checkout",
            }),
        }
    }

    /// Pays a service intent from the wallet balance, then fulfills it.
    ///
    /// A short balance fails the intent and is reported as `InsufficientFunds`.
    pub async fn pay_with_wallet(&self, id: Uuid) -> Result<Settlement, OrchestratorError> {
        let mut intent = self.payments.get(id).await?;
        if intent.gateway != GatewayKind::Wallet {
            return Err(OrchestratorError::WrongState {
                id,
                state: intent.state,
                action: "charge wallet for a gateway intent",
            });
        }

        if intent.state == IntentState::Created {
            intent = self
                .transition(id, IntentState::Created, StateChange::AwaitGateway { checkout_ref: None })
                .await?
                .into_intent();
        }
        if intent.state == IntentState::AwaitingGateway {
            match self
                .transition(
                    id,
                    IntentState::AwaitingGateway,
                    StateChange::BeginVerifying {
                        payload: WALLET_PAYLOAD.to_string(),
                    },
                )
                .await?
            {
                Transition::Applied(claimed) => return self.settle_wallet(claimed).await,
                Transition::Lost(current) => intent = current,
            }
        }

        // Someone else got here first; report where things stand.
        match intent.state {
            IntentState::Failed if intent.failure_reason == Some(FailureReason::InsufficientFunds) => {
                let balance = self.ledger.balance(intent.user_id).await?;
                Err(OrchestratorError::InsufficientFunds {
                    balance,
                    required: intent.amount,
                })
            }
            _ => Ok(Settlement::of(&intent, false)),
        }
    }

    /// Debits the wallet for a claimed (`Verifying`) wallet intent and drives it.
    async fn settle_wallet(&self, intent: PaymentIntent) -> Result<Settlement, OrchestratorError> {
        let debit = NewCreditTransaction::for_intent(
            intent.user_id,
            -intent.amount,
            CreditReason::Purchase,
            intent.id,
        );
        let applied = match self.ledger.apply(debit).await {
            Ok(applied) => applied,
            Err(StoreError::InsufficientFunds { balance, requested }) => {
                warn!(intent_id = %intent.id, user_id = intent.user_id, balance, requested, "wallet charge refused");
                self.transition(
                    intent.id,
                    IntentState::Verifying,
                    StateChange::Failed {
                        reason: FailureReason::InsufficientFunds,
                    },
                )
                .await?;
                return Err(OrchestratorError::InsufficientFunds {
                    balance,
                    required: requested,
                });
            }
            Err(e) => return Err(e.into()),
        };

        self.transition(
            intent.id,
            IntentState::Verifying,
            StateChange::Verified {
                gateway_ref: format!("wallet-tx-{}", applied.transaction_id),
            },
        )
        .await?;
        info!(intent_id = %intent.id, balance = applied.balance, "wallet charged");
        self.drive(intent.id).await
    }

    /// Cancels an intent nobody can have paid yet.
    pub async fn cancel(&self, id: Uuid) -> Result<Settlement, OrchestratorError> {
        let intent = self.payments.get(id).await?;
        let cancellable = match intent.state {
            IntentState::Created => true,
            IntentState::AwaitingGateway => intent.gateway == GatewayKind::Wallet,
            _ => false,
        };
        if !cancellable {
            return Err(OrchestratorError::WrongState {
                id,
                state: intent.state,
                action: "cancel",
            });
        }

        match self
            .transition(
                id,
                intent.state,
                StateChange::Failed {
                    reason: FailureReason::Cancelled,
                },
            )
            .await?
        {
            Transition::Applied(done) => {
                info!(intent_id = %id, "intent cancelled");
                Ok(Settlement::of(&done, true))
            }
            Transition::Lost(current) => Err(OrchestratorError::WrongState {
                id,
                state: current.state,
                action: "cancel",
            }),
        }
    }

    /// Verifies a webhook delivery and records the verdict. Does not fulfill.
    ///
    /// Deliveries that fail authentication never change an intent. A delivery
    /// for an intent already past verification is a stale duplicate and
    /// reports the current state without side effects.
    pub async fn accept_callback(
        &self,
        kind: GatewayKind,
        raw: &RawCallback,
    ) -> Result<Settlement, OrchestratorError> {
        let gateway = self.gateway(kind)?;
        let notice = gateway.authenticate(raw)?;

        let intent = match self.payments.get(notice.intent_id).await {
            Ok(intent) => intent,
            Err(StoreError::NotFound { .. }) => {
                return Err(VerificationError::UnknownIntent(notice.intent_id).into());
            }
            Err(e) => return Err(e.into()),
        };
        if intent.gateway != kind {
            return Err(VerificationError::WrongGateway {
                intent_id: intent.id,
                expected: intent.gateway,
                got: kind,
            }
            .into());
        }
        gateway.precheck(&notice, &intent)?;

        if notice.verdict == Verdict::InProgress {
            debug!(intent_id = %intent.id, "intermediate gateway status ignored");
            return Ok(Settlement::of(&intent, false));
        }

        let claimed = match intent.state {
            IntentState::AwaitingGateway => {
                match self
                    .transition(
                        intent.id,
                        IntentState::AwaitingGateway,
                        StateChange::BeginVerifying {
                            payload: raw.to_payload(),
                        },
                    )
                    .await?
                {
                    Transition::Applied(claimed) => claimed,
                    Transition::Lost(current) if current.state == IntentState::Verifying => current,
                    Transition::Lost(current) => return Ok(Settlement::of(&current, false)),
                }
            }
            // A previous delivery was interrupted mid-verification; finish it.
            IntentState::Verifying => intent,
            IntentState::Created => {
                return Err(OrchestratorError::WrongState {
                    id: intent.id,
                    state: intent.state,
                    action: "accept a callback before checkout",
                });
            }
            _ => {
                debug!(intent_id = %intent.id, state = %intent.state, "stale callback delivery");
                return Ok(Settlement::of(&intent, false));
            }
        };

        self.verify_claimed(gateway.as_ref(), &notice, claimed).await
    }

    /// Confirms a `Verifying` intent with the gateway and records the verdict.
    async fn verify_claimed(
        &self,
        gateway: &dyn PaymentGateway,
        notice: &CallbackNotice,
        intent: PaymentIntent,
    ) -> Result<Settlement, OrchestratorError> {
        let verdict = match gateway.confirm(notice, &intent).await {
            Ok(confirmation) if confirmation.amount != intent.amount => {
                Err(VerificationError::AmountMismatch {
                    expected: intent.amount,
                    reported: confirmation.amount,
                })
            }
            other => other,
        };

        let confirmation = match verdict {
            Ok(confirmation) => confirmation,
            Err(VerificationError::Unavailable(detail)) => {
                warn!(intent_id = %intent.id, "gateway unavailable during verification: {}", detail);
                return Err(VerificationError::Unavailable(detail).into());
            }
            Err(err) => {
                let Some(reason) = err.failure_reason() else {
                    return Err(err.into());
                };
                warn!(intent_id = %intent.id, reason = reason.code(), "payment rejected: {}", err);
                let outcome = self
                    .transition(intent.id, IntentState::Verifying, StateChange::Failed { reason })
                    .await?;
                let applied = outcome.applied();
                return Ok(Settlement::of(&outcome.into_intent(), applied));
            }
        };

        let change = StateChange::Verified {
            gateway_ref: confirmation.gateway_ref.clone(),
        };
        let outcome = match self.transition(intent.id, IntentState::Verifying, change).await {
            Ok(outcome) => outcome,
            Err(StoreError::DuplicateGatewayRef(gateway_ref)) => {
                error!(intent_id = %intent.id, %gateway_ref, "gateway reference already used by another intent");
                self.transition(
                    intent.id,
                    IntentState::Verifying,
                    StateChange::Failed {
                        reason: FailureReason::DuplicateReference,
                    },
                )
                .await?
            }
            Err(e) => return Err(e.into()),
        };

        if outcome.applied() {
            info!(intent_id = %intent.id, gateway_ref = %confirmation.gateway_ref, "payment verified");
        }
        let applied = outcome.applied();
        Ok(Settlement::of(&outcome.into_intent(), applied))
    }

    /// Runs fulfillment for a verified intent under the fulfillment lease.
    pub async fn drive(&self, id: Uuid) -> Result<Settlement, OrchestratorError> {
        let owner = Uuid::new_v4();
        if !self.payments.acquire_lease(id, owner, self.lease_ttl).await? {
            debug!(intent_id = %id, "fulfillment lease held elsewhere");
            return self.status(id).await;
        }

        let lease = FulfillmentLease {
            owner,
            ttl: self.lease_ttl,
        };
        let result = self.drive_leased(id, lease).await;
        if let Err(e) = self.payments.release_lease(id, owner).await {
            warn!(intent_id = %id, "failed to release fulfillment lease: {}", e);
        }
        result
    }

    async fn drive_leased(&self, id: Uuid, lease: FulfillmentLease) -> Result<Settlement, OrchestratorError> {
        let mut intent = self.payments.get(id).await?;
        let mut applied = false;

        if intent.state == IntentState::Verified {
            let outcome = self
                .transition(id, IntentState::Verified, StateChange::BeginFulfilling)
                .await?;
            applied |= outcome.applied();
            intent = outcome.into_intent();
        }
        if intent.state != IntentState::Fulfilling {
            return Ok(Settlement::of(&intent, applied));
        }

        let change = match self.dispatcher.fulfill(&intent, lease).await {
            Ok(FulfillmentOutcome::Fulfilled { .. }) => StateChange::Finalized,
            Ok(FulfillmentOutcome::Failed(reason)) => StateChange::Failed { reason },
            Err(FulfillmentError::LeaseLost(_)) => {
                // Whoever holds the lease now settles the intent.
                let current = self.payments.get(id).await?;
                return Ok(Settlement::of(&current, applied));
            }
            Err(e) => return Err(e.into()),
        };
        let outcome = self.transition(id, IntentState::Fulfilling, change).await?;
        let done = outcome.applied();
        let intent = outcome.into_intent();

        if intent.state == IntentState::Finalized {
            if let Some(order) = self.orders.get_by_intent(id).await? {
                self.orders.mark_provisioned(order.id).await?;
            }
            info!(intent_id = %id, user_id = intent.user_id, "intent finalized");
        }
        Ok(Settlement::of(&intent, applied || done))
    }

    /// Verifies then fulfills. Used where no response deadline applies.
    pub async fn handle_callback(
        &self,
        kind: GatewayKind,
        raw: &RawCallback,
    ) -> Result<Settlement, OrchestratorError> {
        let accepted = self.accept_callback(kind, raw).await?;
        if accepted.state == IntentState::Verified {
            let mut driven = self.drive(accepted.intent_id).await?;
            driven.applied |= accepted.applied;
            return Ok(driven);
        }
        Ok(accepted)
    }

    /// Admin reconciliation: records a payment confirmed outside the webhook path.
    pub async fn manual_finalize(&self, id: Uuid, reference: &str) -> Result<Settlement, OrchestratorError> {
        let intent = self.payments.get(id).await?;
        if intent.gateway == GatewayKind::Wallet {
            return Err(OrchestratorError::WrongState {
                id,
                state: intent.state,
                action: "manually finalize a wallet intent",
            });
        }

        let claimed = match intent.state {
            IntentState::AwaitingGateway => self
                .transition(
                    id,
                    IntentState::AwaitingGateway,
                    StateChange::BeginVerifying {
                        payload: format!("manual:{reference}"),
                    },
                )
                .await?
                .into_intent(),
            _ => intent,
        };

        match claimed.state {
            IntentState::Verifying => {
                let outcome = match self
                    .transition(
                        id,
                        IntentState::Verifying,
                        StateChange::Verified {
                            gateway_ref: reference.to_string(),
                        },
                    )
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(StoreError::DuplicateGatewayRef(_)) => {
                        return Err(VerificationError::Malformed(format!(
                            "reference {reference} already belongs to another intent"
                        ))
                        .into());
                    }
                    Err(e) => return Err(e.into()),
                };
                info!(intent_id = %id, %reference, applied = outcome.applied(), "intent manually verified");
                let mut driven = self.drive(id).await?;
                driven.applied |= outcome.applied();
                Ok(driven)
            }
            IntentState::Verified | IntentState::Fulfilling => self.drive(id).await,
            IntentState::Finalized => Ok(Settlement::of(&claimed, false)),
            state => Err(OrchestratorError::WrongState {
                id,
                state,
                action: "manually finalize",
            }),
        }
    }

    /// Continues an intent the sweep found stalled mid-flight.
    pub async fn resume(&self, intent: PaymentIntent) -> Result<Settlement, OrchestratorError> {
        match intent.state {
            IntentState::Verifying => self.resume_verifying(intent).await,
            IntentState::Verified | IntentState::Fulfilling => self.drive(intent.id).await,
            _ => Ok(Settlement::of(&intent, false)),
        }
    }

    async fn resume_verifying(&self, intent: PaymentIntent) -> Result<Settlement, OrchestratorError> {
        let payload = intent.callback_payload.clone().unwrap_or_default();
        if intent.gateway == GatewayKind::Wallet {
            return self.settle_wallet(intent).await;
        }
        if payload.starts_with("manual:") {
            // Manual finalization stopped between its two writes; the admin reruns it.
            return Ok(Settlement::of(&intent, false));
        }

        let raw = RawCallback::from_payload(&payload)?;
        let gateway = self.gateway(intent.gateway)?;
        let notice = gateway.authenticate(&raw)?;
        if notice.intent_id != intent.id {
            return Err(VerificationError::Malformed("stored callback names another intent".into()).into());
        }
        info!(intent_id = %intent.id, "replaying stored callback");
        let verified = self.verify_claimed(gateway.as_ref(), &notice, intent).await?;
        if verified.state == IntentState::Verified {
            return self.drive(verified.intent_id).await;
        }
        Ok(verified)
    }
}
