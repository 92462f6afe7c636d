use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};
use vpnshop_db::models::wallet::LedgerDiscrepancy;
use vpnshop_db::store::{StoreError, WalletLedger};
use vpnshop_shared::types::IntentState;

use crate::config::ReconciliationConfig;
use crate::services::orchestrator::Orchestrator;

/// States an intent can be left in by a crash or an unreachable gateway.
const RESUMABLE: [IntentState; 3] = [
    IntentState::Verifying,
    IntentState::Verified,
    IntentState::Fulfilling,
];

/// Stored balances that no longer equal the sum of their ledger entries.
/// Never corrected automatically.
#[derive(Debug, thiserror::Error)]
#[error("wallet ledger is inconsistent for {} user(s)", .discrepancies.len())]
pub struct LedgerInconsistencyError {
    pub discrepancies: Vec<LedgerDiscrepancy>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error(transparent)]
    Inconsistent(#[from] LedgerInconsistencyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub settled: usize,
    pub errors: usize,
    pub promoted: u64,
}

pub struct ReconciliationService {
    orchestrator: Arc<Orchestrator>,
    ledger: Arc<dyn WalletLedger>,
    config: ReconciliationConfig,
}

impl ReconciliationService {
    pub fn new(orchestrator: Arc<Orchestrator>, config: ReconciliationConfig) -> Self {
        let ledger = orchestrator.ledger().clone();
        Self {
            orchestrator,
            ledger,
            config,
        }
    }

    /// Resumes every intent that has sat in a mid-flight state for longer than the grace period.
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let grace = chrono::Duration::seconds(self.config.stall_grace_secs as i64);
        let stalled = self
            .orchestrator
            .payments()
            .list_stalled(&RESUMABLE, Utc::now() - grace, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: stalled.len(),
            ..SweepReport::default()
        };
        for intent in stalled {
            let id = intent.id;
            let from = intent.state;
            match self.orchestrator.resume(intent).await {
                Ok(settled) => {
                    if settled.state.is_terminal() {
                        report.settled += 1;
                    }
                    info!(intent_id = %id, %from, to = %settled.state, "sweep resumed intent");
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(intent_id = %id, %from, "sweep could not resume intent: {}", e);
                }
            }
        }

        report.promoted = self.orchestrator.orders().promote_finalized().await?;
        if report.promoted > 0 {
            info!("Promoted {} finalized orders to provisioned", report.promoted);
        }
        Ok(report)
    }

    /// Compares every stored balance with the sum of its ledger entries.
    pub async fn check_ledger(&self) -> Result<(), ReconciliationError> {
        let discrepancies = self.ledger.find_discrepancies().await?;
        if discrepancies.is_empty() {
            return Ok(());
        }
        for d in &discrepancies {
            error!(
                user_id = d.user_id,
                stored_balance = d.stored_balance,
                ledger_sum = d.ledger_sum,
                "wallet balance does not match ledger"
            );
        }
        Err(LedgerInconsistencyError { discrepancies }.into())
    }

    pub async fn start_sweep(&self) {
        info!(
            "Starting reconciliation sweep (every {}s, grace {}s)",
            self.config.sweep_interval_secs, self.config.stall_grace_secs
        );
        let mut ticker = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                error!("Reconciliation sweep error: {}", e);
            }
        }
    }

    /// Runs the ledger check until it finds an inconsistency, which ends the job.
    pub async fn start_ledger_check(&self) -> LedgerInconsistencyError {
        let mut ticker = interval(Duration::from_secs(self.config.ledger_check_interval_secs.max(1)));
        loop {
            ticker.tick().await;
            match self.check_ledger().await {
                Ok(()) => {}
                Err(ReconciliationError::Inconsistent(e)) => {
                    error!("Ledger check stopped: {}", e);
                    return e;
                }
                Err(ReconciliationError::Store(e)) => warn!("Ledger check failed: {}", e),
            }
        }
    }
}
