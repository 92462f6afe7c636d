use anyhow::{Context, Result, bail};
use uuid::Uuid;
use vpnshop_db::models::wallet::NewCreditTransaction;
use vpnshop_db::store::{OrderStore, WalletLedger};
use vpnshop_shared::types::CreditReason;

use crate::services::orchestrator::Orchestrator;
use crate::services::provisioning::ProvisioningAdapter;
use crate::services::reconciliation::{ReconciliationError, ReconciliationService};

pub async fn sweep(service: &ReconciliationService) -> Result<()> {
    let report = service.sweep_once().await.context("Sweep failed")?;
    println!(
        "Examined {} stalled intents: {} settled, {} errors, {} orders promoted.",
        report.examined, report.settled, report.errors, report.promoted
    );
    Ok(())
}

pub async fn reconcile_ledger(service: &ReconciliationService) -> Result<()> {
    match service.check_ledger().await {
        Ok(()) => {
            println!("Wallet ledger is consistent.");
            Ok(())
        }
        Err(ReconciliationError::Inconsistent(e)) => {
            for d in &e.discrepancies {
                println!(
                    "user {}: stored balance {}, ledger sum {}",
                    d.user_id, d.stored_balance, d.ledger_sum
                );
            }
            Err(e.into())
        }
        Err(ReconciliationError::Store(e)) => Err(e).context("Failed to read the wallet ledger"),
    }
}

pub async fn finalize(orchestrator: &Orchestrator, intent_id: Uuid, reference: &str) -> Result<()> {
    let reference = reference.trim();
    if reference.is_empty() {
        bail!("A gateway reference is required to finalize an intent by hand.");
    }
    let settled = orchestrator
        .manual_finalize(intent_id, reference)
        .await
        .with_context(|| format!("Failed to finalize intent {intent_id}"))?;
    println!("Intent {} is now {}.", settled.intent_id, settled.state);
    if let Some(reason) = settled.reason {
        println!("Failure reason: {}", reason.code());
    }
    Ok(())
}

pub async fn adjust(ledger: &dyn WalletLedger, user_id: i64, delta: i64, note: Option<String>) -> Result<()> {
    if delta == 0 {
        bail!("Adjustment must be non-zero.");
    }
    let applied = ledger
        .apply(NewCreditTransaction {
            wallet_user_id: user_id,
            delta,
            reason: CreditReason::AdminAdjustment,
            related_intent_id: None,
            note,
        })
        .await
        .with_context(|| format!("Failed to adjust wallet of user {user_id}"))?;
    println!(
        "Wallet of user {} adjusted by {}; balance is now {}.",
        user_id, delta, applied.balance
    );
    Ok(())
}

pub async fn deactivate(orders: &dyn OrderStore, adapter: &dyn ProvisioningAdapter, order_id: i64) -> Result<()> {
    let order = orders
        .get(order_id)
        .await
        .with_context(|| format!("Failed to load order {order_id}"))?;
    let Some(provider_ref) = order.provider_ref.as_deref() else {
        bail!("Order {} has no entitlement on the panel.", order_id);
    };
    adapter
        .deactivate(provider_ref)
        .await
        .with_context(|| format!("Failed to deactivate {provider_ref}"))?;
    println!("Entitlement {} of order {} deactivated.", provider_ref, order_id);
    Ok(())
}
