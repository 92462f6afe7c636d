use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::time::Duration;
use uuid::Uuid;
use vpnshop_shared::types::{GatewayKind, IntentState, PlanSpec};

use super::{is_unique_violation, json_column, optional_text_column, text_column};
use crate::models::payment::{NewPaymentIntent, PaymentIntent, StateChange};
use crate::store::{PaymentStore, StoreError, StoreResult, Transition};

const INTENT_COLUMNS: &str = "id, user_id, amount, purpose, gateway, gateway_ref, checkout_ref, \
    state, plan, upgrade_of, failure_reason, callback_payload, lease_owner, lease_expires_at, \
    created_at, updated_at, verified_at, finalized_at";

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_intent(row: &PgRow) -> StoreResult<PaymentIntent> {
        let plan = row
            .try_get::<Option<String>, _>("plan")?
            .map(|raw| json_column::<PlanSpec>(&raw, "plan"))
            .transpose()?;

        Ok(PaymentIntent {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            amount: row.try_get("amount")?,
            purpose: text_column(row, "purpose")?,
            gateway: text_column(row, "gateway")?,
            gateway_ref: row.try_get("gateway_ref")?,
            checkout_ref: row.try_get("checkout_ref")?,
            state: text_column(row, "state")?,
            plan,
            upgrade_of: row.try_get("upgrade_of")?,
            failure_reason: optional_text_column(row, "failure_reason")?,
            callback_payload: row.try_get("callback_payload")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            verified_at: row.try_get("verified_at")?,
            finalized_at: row.try_get("finalized_at")?,
        })
    }

    async fn fetch(&self, id: Uuid) -> StoreResult<Option<PaymentIntent>> {
        let row = sqlx::query(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_intent).transpose()
    }
}

#[async_trait]
impl PaymentStore for PaymentRepository {
    async fn create(&self, new: NewPaymentIntent) -> StoreResult<PaymentIntent> {
        new.validate()?;
        let plan = new
            .plan
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                column: "plan",
                detail: e.to_string(),
            })?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO payment_intents (id, user_id, amount, purpose, gateway, state, plan, upgrade_of)
            VALUES ($1, $2, $3, $4, $5, 'created', $6, $7)
            RETURNING {INTENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.amount)
        .bind(new.purpose.as_str())
        .bind(new.gateway.as_str())
        .bind(plan)
        .bind(new.upgrade_of)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_intent(&row)
    }

    async fn get(&self, id: Uuid) -> StoreResult<PaymentIntent> {
        self.fetch(id)
            .await?
            .ok_or_else(|| StoreError::not_found("payment intent", id))
    }

    async fn find_by_gateway_ref(
        &self,
        gateway: GatewayKind,
        gateway_ref: &str,
    ) -> StoreResult<Option<PaymentIntent>> {
        let row = sqlx::query(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents WHERE gateway = $1 AND gateway_ref = $2"
        ))
        .bind(gateway.as_str())
        .bind(gateway_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_intent).transpose()
    }

    async fn list_by_user(&self, user_id: i64, limit: i64) -> StoreResult<Vec<PaymentIntent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INTENT_COLUMNS} FROM payment_intents
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_intent).collect()
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

        let (checkout_ref, payload, gateway_ref, failure_reason) = match &change {
            StateChange::AwaitGateway { checkout_ref } => (checkout_ref.clone(), None, None, None),
            StateChange::BeginVerifying { payload } => (None, Some(payload.clone()), None, None),
            StateChange::Verified { gateway_ref } => (None, None, Some(gateway_ref.clone()), None),
            StateChange::Failed { reason } => (None, None, None, Some(reason.as_str())),
            StateChange::BeginFulfilling | StateChange::Finalized => (None, None, None, None),
        };

        let result = sqlx::query(&format!(
            r#"
            UPDATE payment_intents SET
                state = $3,
                checkout_ref = COALESCE($4, checkout_ref),
                callback_payload = COALESCE($5, callback_payload),
                gateway_ref = COALESCE($6, gateway_ref),
                failure_reason = COALESCE($7, failure_reason),
                verified_at = CASE WHEN $3 = 'verified' THEN NOW() ELSE verified_at END,
                finalized_at = CASE WHEN $3 IN ('finalized', 'failed') THEN NOW() ELSE finalized_at END,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING {INTENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(target.as_str())
        .bind(checkout_ref)
        .bind(payload)
        .bind(gateway_ref.clone())
        .bind(failure_reason)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => Ok(Transition::Applied(Self::row_to_intent(&row)?)),
            Ok(None) => Ok(Transition::Lost(self.get(id).await?)),
            Err(e) if is_unique_violation(&e, "payment_intents_gateway_ref_uq") => Err(
                StoreError::DuplicateGatewayRef(gateway_ref.unwrap_or_default()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn acquire_lease(&self, id: Uuid, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_intents
            SET lease_owner = $2, lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1
              AND (lease_owner IS NULL OR lease_owner = $2 OR lease_expires_at < NOW())
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_lease(&self, id: Uuid, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_intents
            SET lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND lease_owner = $2 AND state = $4
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .bind(IntentState::Fulfilling.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, id: Uuid, owner: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_intents
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_stalled(
        &self,
        states: &[IntentState],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentIntent>> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INTENT_COLUMNS} FROM payment_intents
            WHERE state = ANY($1) AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(states)
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_intent).collect()
    }
}
