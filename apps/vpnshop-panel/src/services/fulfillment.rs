//! Turns a verified payment into its effect: a wallet credit or a provisioned service.
//!
//! Every step is safe to repeat. Ledger entries are keyed by `(intent, reason)`,
//! the order is keyed by intent and carries a credential chosen before the
//! first remote call, and the adapter is asked for an existing entitlement
//! before a new one is created.
//!
//! A run holds the intent's fulfillment lease. It renews the lease before
//! every provisioning attempt and before compensating, and stops as soon as
//! the lease has passed to another driver.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vpnshop_db::models::order::{NewServiceOrder, ServiceOrder};
use vpnshop_db::models::payment::PaymentIntent;
use vpnshop_db::models::wallet::NewCreditTransaction;
use vpnshop_db::store::{OrderStore, PaymentStore, StoreError, WalletLedger};
use vpnshop_shared::types::{
    CreditReason, FailureReason, GatewayKind, OrderKind, PaymentPurpose, ProvisioningState,
};

use crate::config::RetryConfig;
use crate::services::provisioning::{ProviderRef, ProvisioningAdapter, ProvisioningError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// `min(base * 2^(attempt-1), max)` for 1-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Every attempt timing out, with the full backoff between them.
    pub fn longest_run(&self) -> Duration {
        let attempts = self.attempt_timeout.saturating_mul(self.max_attempts);
        (1..self.max_attempts)
            .map(|n| self.delay_for(n))
            .fold(attempts, Duration::saturating_add)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    Fulfilled { order_id: Option<i64> },
    /// Permanently failed; any charge has already been refunded.
    Failed(FailureReason),
}

#[derive(Debug, thiserror::Error)]
pub enum FulfillmentError {
    #[error("intent {0} has no plan")]
    MissingPlan(Uuid),
    #[error("fulfillment lease on intent {0} is no longer held")]
    LeaseLost(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The lease a run was started under.
#[derive(Debug, Clone, Copy)]
pub struct FulfillmentLease {
    pub owner: Uuid,
    pub ttl: Duration,
}

pub struct FulfillmentDispatcher {
    payments: Arc<dyn PaymentStore>,
    ledger: Arc<dyn WalletLedger>,
    orders: Arc<dyn OrderStore>,
    adapter: Arc<dyn ProvisioningAdapter>,
    policy: RetryPolicy,
}

impl FulfillmentDispatcher {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        ledger: Arc<dyn WalletLedger>,
        orders: Arc<dyn OrderStore>,
        adapter: Arc<dyn ProvisioningAdapter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            payments,
            ledger,
            orders,
            adapter,
            policy,
        }
    }

    pub async fn fulfill(
        &self,
        intent: &PaymentIntent,
        lease: FulfillmentLease,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        match intent.purpose {
            PaymentPurpose::WalletTopUp => {
                let applied = self
                    .ledger
                    .apply(NewCreditTransaction::for_intent(
                        intent.user_id,
                        intent.amount,
                        CreditReason::TopUp,
                        intent.id,
                    ))
                    .await?;
                info!(
                    intent_id = %intent.id,
                    user_id = intent.user_id,
                    balance = applied.balance,
                    duplicate = applied.duplicate,
                    "wallet top-up applied"
                );
                Ok(FulfillmentOutcome::Fulfilled { order_id: None })
            }
            PaymentPurpose::NewService | PaymentPurpose::UpgradeService => self.fulfill_service(intent, lease).await,
        }
    }

    async fn fulfill_service(
        &self,
        intent: &PaymentIntent,
        lease: FulfillmentLease,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        if intent.gateway == GatewayKind::Wallet {
            match self
                .ledger
                .apply(NewCreditTransaction::for_intent(
                    intent.user_id,
                    -intent.amount,
                    CreditReason::Purchase,
                    intent.id,
                ))
                .await
            {
                Ok(_) => {}
                Err(StoreError::InsufficientFunds { balance, .. }) => {
                    warn!(intent_id = %intent.id, balance, "wallet purchase no longer covered");
                    return Ok(FulfillmentOutcome::Failed(FailureReason::InsufficientFunds));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let new_order = match self.prepare_order(intent).await? {
            Ok(order) => order,
            Err(detail) => {
                warn!(intent_id = %intent.id, "cannot upgrade: {}", detail);
                self.refund(intent, lease).await?;
                return Ok(FulfillmentOutcome::Failed(FailureReason::ProvisioningRejected));
            }
        };
        let order = self.orders.get_or_create(new_order).await?;

        if order.provisioning_state == ProvisioningState::Provisioned || order.provider_ref.is_some() {
            debug!(intent_id = %intent.id, order_id = order.id, "order already provisioned");
            return Ok(FulfillmentOutcome::Fulfilled { order_id: Some(order.id) });
        }
        if order.provisioning_state == ProvisioningState::Failed {
            // An earlier run gave up; make sure its refund landed.
            self.refund(intent, lease).await?;
            return Ok(FulfillmentOutcome::Failed(recorded_reason(&order)));
        }

        self.provision_with_retry(intent, order, lease).await
    }

    /// Builds the order for an intent. The inner `Err` is a permanent business rejection.
    async fn prepare_order(
        &self,
        intent: &PaymentIntent,
    ) -> Result<Result<NewServiceOrder, String>, FulfillmentError> {
        let spec = intent.plan.clone().ok_or(FulfillmentError::MissingPlan(intent.id))?;
        let mut new_order = NewServiceOrder {
            user_id: intent.user_id,
            related_intent_id: intent.id,
            kind: OrderKind::New,
            spec,
            target_ref: None,
        };

        if let Some(prior_id) = intent.upgrade_of {
            let prior = match self.orders.get(prior_id).await {
                Ok(prior) => prior,
                Err(StoreError::NotFound { .. }) => return Ok(Err(format!("order {prior_id} does not exist"))),
                Err(e) => return Err(e.into()),
            };
            if prior.user_id != intent.user_id {
                return Ok(Err(format!("order {prior_id} belongs to another user")));
            }
            let Some(target) = prior.provider_ref.clone().filter(|_| {
                prior.provisioning_state == ProvisioningState::Provisioned
            }) else {
                return Ok(Err(format!("order {prior_id} was never provisioned")));
            };
            new_order.kind = if prior.spec.plan_id == new_order.spec.plan_id {
                OrderKind::Renew
            } else {
                OrderKind::Upgrade
            };
            new_order.target_ref = Some(target);
        }

        Ok(Ok(new_order))
    }

    async fn provision_with_retry(
        &self,
        intent: &PaymentIntent,
        order: ServiceOrder,
        lease: FulfillmentLease,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let mut attempt = order.attempts.max(0) as u32;

        while attempt < self.policy.max_attempts {
            self.hold(intent, lease).await?;
            attempt += 1;
            let result = match tokio::time::timeout(self.policy.attempt_timeout, self.attempt(&order)).await {
                Ok(result) => result,
                Err(_) => Err(ProvisioningError::Transient(format!(
                    "attempt timed out after {:?}",
                    self.policy.attempt_timeout
                ))),
            };

            match result {
                Ok(provider_ref) => {
                    self.orders.record_attempt(order.id, None).await?;
                    self.orders.record_provider_ref(order.id, &provider_ref).await?;
                    info!(intent_id = %intent.id, order_id = order.id, attempt, %provider_ref, "service provisioned");
                    return Ok(FulfillmentOutcome::Fulfilled { order_id: Some(order.id) });
                }
                Err(ProvisioningError::Permanent(detail)) => {
                    self.orders.record_attempt(order.id, Some(&detail)).await?;
                    error!(intent_id = %intent.id, order_id = order.id, attempt, "provisioning rejected: {}", detail);
                    return self
                        .compensate(intent, &order, lease, FailureReason::ProvisioningRejected, &detail)
                        .await;
                }
                Err(ProvisioningError::Transient(detail)) => {
                    self.orders.record_attempt(order.id, Some(&detail)).await?;
                    warn!(intent_id = %intent.id, order_id = order.id, attempt, "provisioning attempt failed: {}", detail);
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        error!(intent_id = %intent.id, order_id = order.id, attempts = attempt, "provisioning exhausted");
        self.compensate(intent, &order, lease, FailureReason::ProvisioningExhausted, "retries exhausted")
            .await
    }

    async fn attempt(&self, order: &ServiceOrder) -> Result<ProviderRef, ProvisioningError> {
        match (&order.kind, &order.target_ref) {
            (OrderKind::New, _) => {
                if let Some(existing) = self.adapter.find(order).await? {
                    debug!(order_id = order.id, "entitlement already exists on panel");
                    return Ok(existing);
                }
                self.adapter.provision(order).await
            }
            (OrderKind::Upgrade | OrderKind::Renew, Some(target)) => {
                self.adapter.renew(target, order).await?;
                Ok(target.clone())
            }
            (_, None) => Err(ProvisioningError::Permanent(format!(
                "order {} has no target to update",
                order.id
            ))),
        }
    }

    async fn compensate(
        &self,
        intent: &PaymentIntent,
        order: &ServiceOrder,
        lease: FulfillmentLease,
        reason: FailureReason,
        detail: &str,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        self.hold(intent, lease).await?;
        self.orders
            .mark_failed(order.id, &format!("{}: {}", reason.code(), detail))
            .await?;
        self.refund(intent, lease).await?;
        Ok(FulfillmentOutcome::Failed(reason))
    }

    /// Renews the lease. Fails with `LeaseLost` once another driver owns the
    /// intent or it has left `Fulfilling`, e.g. finalized by a run that
    /// outlived its own lease.
    async fn hold(&self, intent: &PaymentIntent, lease: FulfillmentLease) -> Result<(), FulfillmentError> {
        if self.payments.renew_lease(intent.id, lease.owner, lease.ttl).await? {
            return Ok(());
        }
        warn!(intent_id = %intent.id, owner = %lease.owner, "fulfillment lease lost, stopping");
        Err(FulfillmentError::LeaseLost(intent.id))
    }

    async fn refund(&self, intent: &PaymentIntent, lease: FulfillmentLease) -> Result<(), FulfillmentError> {
        self.hold(intent, lease).await?;
        let applied = self
            .ledger
            .apply(NewCreditTransaction::for_intent(
                intent.user_id,
                intent.amount,
                CreditReason::Refund,
                intent.id,
            ))
            .await?;
        if !applied.duplicate {
            info!(intent_id = %intent.id, user_id = intent.user_id, amount = intent.amount, "refund credited");
        }
        Ok(())
    }
}

/// Failure reason stored as the `last_error` prefix by [`FulfillmentDispatcher::compensate`].
fn recorded_reason(order: &ServiceOrder) -> FailureReason {
    order
        .last_error
        .as_deref()
        .and_then(|e| e.split_once(':'))
        .and_then(|(code, _)| code.parse().ok())
        .unwrap_or(FailureReason::ProvisioningExhausted)
}

#[cfg(test)]
mod tests;
