use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;
use vpnshop_shared::types::PlanSpec;

use super::{json_column, text_column};
use crate::models::order::{NewServiceOrder, ServiceOrder};
use crate::store::{OrderStore, StoreError, StoreResult};

const ORDER_COLUMNS: &str = "id, user_id, related_intent_id, kind, spec, provisioning_state, \
    provider_ref, target_ref, credential_id, attempts, last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_order(row: &PgRow) -> StoreResult<ServiceOrder> {
        let spec: String = row.try_get("spec")?;
        Ok(ServiceOrder {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            related_intent_id: row.try_get("related_intent_id")?,
            kind: text_column(row, "kind")?,
            spec: json_column::<PlanSpec>(&spec, "spec")?,
            provisioning_state: text_column(row, "provisioning_state")?,
            provider_ref: row.try_get("provider_ref")?,
            target_ref: row.try_get("target_ref")?,
            credential_id: row.try_get("credential_id")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn update_returning(&self, sql: &str, id: i64, value: Option<&str>) -> StoreResult<ServiceOrder> {
        let row = sqlx::query(sql)
            .bind(id)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("service order", id))?;

        Self::row_to_order(&row)
    }
}

#[async_trait]
impl OrderStore for OrderRepository {
    async fn get_or_create(&self, new: NewServiceOrder) -> StoreResult<ServiceOrder> {
        let spec = serde_json::to_string(&new.spec).map_err(|e| StoreError::Corrupt {
            column: "spec",
            detail: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO service_orders (user_id, related_intent_id, kind, spec, target_ref, credential_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (related_intent_id) DO NOTHING
            "#,
        )
        .bind(new.user_id)
        .bind(new.related_intent_id)
        .bind(new.kind.as_str())
        .bind(spec)
        .bind(new.target_ref.as_deref())
        .bind(Uuid::new_v4())
        .execute(&self.pool)
        .await?;

        self.get_by_intent(new.related_intent_id)
            .await?
            .ok_or_else(|| StoreError::not_found("service order for intent", new.related_intent_id))
    }

    async fn get(&self, id: i64) -> StoreResult<ServiceOrder> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM service_orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("service order", id))?;

        Self::row_to_order(&row)
    }

    async fn get_by_intent(&self, intent_id: Uuid) -> StoreResult<Option<ServiceOrder>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM service_orders WHERE related_intent_id = $1"
        ))
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn record_attempt(&self, id: i64, error: Option<&str>) -> StoreResult<ServiceOrder> {
        self.update_returning(
            &format!(
                r#"
                UPDATE service_orders
                SET attempts = attempts + 1, last_error = COALESCE($2, last_error), updated_at = NOW()
                WHERE id = $1
                RETURNING {ORDER_COLUMNS}
                "#
            ),
            id,
            error,
        )
        .await
    }

    async fn record_provider_ref(&self, id: i64, provider_ref: &str) -> StoreResult<ServiceOrder> {
        self.update_returning(
            &format!(
                r#"
                UPDATE service_orders
                SET provider_ref = $2, updated_at = NOW()
                WHERE id = $1 AND provisioning_state = 'pending'
                RETURNING {ORDER_COLUMNS}
                "#
            ),
            id,
            Some(provider_ref),
        )
        .await
    }

    async fn mark_provisioned(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE service_orders
            SET provisioning_state = 'provisioned', updated_at = NOW()
            WHERE id = $1 AND provisioning_state = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: i64, error: &str) -> StoreResult<ServiceOrder> {
        self.update_returning(
            &format!(
                r#"
                UPDATE service_orders
                SET provisioning_state = 'failed', last_error = $2, updated_at = NOW()
                WHERE id = $1 AND provisioning_state <> 'provisioned'
                RETURNING {ORDER_COLUMNS}
                "#
            ),
            id,
            Some(error),
        )
        .await
    }

    async fn promote_finalized(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE service_orders o
            SET provisioning_state = 'provisioned', updated_at = NOW()
            FROM payment_intents p
            WHERE p.id = o.related_intent_id
              AND p.state = 'finalized'
              AND o.provisioning_state = 'pending'
              AND o.provider_ref IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
