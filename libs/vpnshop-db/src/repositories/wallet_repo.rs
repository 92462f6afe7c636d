use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::debug;

use super::text_column;
use crate::models::wallet::{
    AppliedCredit, CreditTransaction, LedgerDiscrepancy, NewCreditTransaction, WalletAccount,
};
use crate::store::{StoreError, StoreResult, WalletLedger};

#[derive(Debug, Clone)]
pub struct WalletRepository {
    pool: PgPool,
}

impl WalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_transaction(row: &PgRow) -> StoreResult<CreditTransaction> {
        Ok(CreditTransaction {
            id: row.try_get("id")?,
            wallet_user_id: row.try_get("wallet_user_id")?,
            delta: row.try_get("delta")?,
            reason: text_column(row, "reason")?,
            related_intent_id: row.try_get("related_intent_id")?,
            note: row.try_get("note")?,
            applied_at: row.try_get("applied_at")?,
        })
    }
}

#[async_trait]
impl WalletLedger for WalletRepository {
    async fn balance(&self, user_id: i64) -> StoreResult<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM wallets WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(balance.unwrap_or(0))
    }

    async fn account(&self, user_id: i64) -> StoreResult<Option<WalletAccount>> {
        let row = sqlx::query("SELECT user_id, balance, updated_at FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> StoreResult<WalletAccount> {
            Ok(WalletAccount {
                user_id: row.try_get("user_id")?,
                balance: row.try_get("balance")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn apply(&self, entry: NewCreditTransaction) -> StoreResult<AppliedCredit> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO wallets (user_id, balance) VALUES ($1, 0) ON CONFLICT (user_id) DO NOTHING")
            .bind(entry.wallet_user_id)
            .execute(&mut *tx)
            .await?;

        // Row lock serializes every ledger write for this wallet.
        let balance: i64 =
            sqlx::query_scalar("SELECT balance FROM wallets WHERE user_id = $1 FOR UPDATE")
                .bind(entry.wallet_user_id)
                .fetch_one(&mut *tx)
                .await?;

        if let Some(intent_id) = entry.related_intent_id {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM credit_transactions WHERE related_intent_id = $1 AND reason = $2",
            )
            .bind(intent_id)
            .bind(entry.reason.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(transaction_id) = existing {
                tx.commit().await?;
                debug!(%intent_id, reason = %entry.reason, "ledger entry already applied");
                return Ok(AppliedCredit {
                    transaction_id,
                    balance,
                    duplicate: true,
                });
            }
        }

        let Some(new_balance) = balance.checked_add(entry.delta) else {
            tx.rollback().await?;
            return Err(StoreError::BalanceOverflow {
                user_id: entry.wallet_user_id,
                balance,
                delta: entry.delta,
            });
        };
        if new_balance < 0 {
            tx.rollback().await?;
            return Err(StoreError::InsufficientFunds {
                balance,
                requested: entry.delta.saturating_neg(),
            });
        }

        let transaction_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO credit_transactions (wallet_user_id, delta, reason, related_intent_id, note)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(entry.wallet_user_id)
        .bind(entry.delta)
        .bind(entry.reason.as_str())
        .bind(entry.related_intent_id)
        .bind(entry.note.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE wallets SET balance = $1, updated_at = NOW() WHERE user_id = $2")
            .bind(new_balance)
            .bind(entry.wallet_user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(AppliedCredit {
            transaction_id,
            balance: new_balance,
            duplicate: false,
        })
    }

    async fn transactions(&self, user_id: i64, limit: i64) -> StoreResult<Vec<CreditTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, wallet_user_id, delta, reason, related_intent_id, note, applied_at
            FROM credit_transactions
            WHERE wallet_user_id = $1
            ORDER BY applied_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn find_discrepancies(&self) -> StoreResult<Vec<LedgerDiscrepancy>> {
        let rows = sqlx::query(
            r#"
            SELECT w.user_id, w.balance, COALESCE(SUM(t.delta), 0)::BIGINT AS ledger_sum
            FROM wallets w
            LEFT JOIN credit_transactions t ON t.wallet_user_id = w.user_id
            GROUP BY w.user_id, w.balance
            HAVING w.balance <> COALESCE(SUM(t.delta), 0)
            ORDER BY w.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<LedgerDiscrepancy> {
                Ok(LedgerDiscrepancy {
                    user_id: row.try_get("user_id")?,
                    stored_balance: row.try_get("balance")?,
                    ledger_sum: row.try_get("ledger_sum")?,
                })
            })
            .collect()
    }
}
