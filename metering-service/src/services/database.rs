//! Database service for metering-service.

use crate::models::{
    NewUsageRecord, Subscription, SubscriptionSnapshot, SyncOutcome,
    UnreportedUsage, UsageMetric,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{SubscriptionStore, UsageStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, provider_customer_id, provider_subscription_id, \
     provider_price_id, plan, status, billing_cycle_anchor, current_period_start, \
     current_period_end, trial_start, trial_end, cancel_at, canceled_at, cancel_at_period_end, \
     default_payment_method_id, metadata, created_at, updated_at";

// Parameters $1..$11 of every snapshot write.
const SNAPSHOT_ASSIGNMENTS: &str = "plan = COALESCE($1, plan), \
     provider_price_id = CASE WHEN $1::TEXT IS NULL THEN provider_price_id ELSE $2 END, \
     status = $3, current_period_start = $4, current_period_end = $5, trial_start = $6, \
     trial_end = $7, cancel_at = $8, canceled_at = $9, cancel_at_period_end = $10, \
     default_payment_method_id = $11, updated_at = NOW()";

const SNAPSHOT_DIFFERS: &str = "(($1::TEXT IS NOT NULL AND (plan IS DISTINCT FROM $1 \
     OR provider_price_id IS DISTINCT FROM $2)) \
     OR status IS DISTINCT FROM $3 OR current_period_start IS DISTINCT FROM $4 \
     OR current_period_end IS DISTINCT FROM $5 OR trial_start IS DISTINCT FROM $6 \
     OR trial_end IS DISTINCT FROM $7 OR cancel_at IS DISTINCT FROM $8 \
     OR canceled_at IS DISTINCT FROM $9 OR cancel_at_period_end IS DISTINCT FROM $10 \
     OR default_payment_method_id IS DISTINCT FROM $11)";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    fn snapshot_query<'q>(
        sql: &'q str,
        snapshot: &'q SubscriptionSnapshot,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        sqlx::query(sql)
            .bind(snapshot.plan.map(|p| p.as_str()))
            .bind(snapshot.provider_price_id.as_deref())
            .bind(snapshot.status.as_str())
            .bind(snapshot.current_period_start)
            .bind(snapshot.current_period_end)
            .bind(snapshot.trial_start)
            .bind(snapshot.trial_end)
            .bind(snapshot.cancel_at)
            .bind(snapshot.canceled_at)
            .bind(snapshot.cancel_at_period_end)
            .bind(snapshot.default_payment_method_id.as_deref())
    }

    async fn fetch_subscription_by_tenant(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE tenant_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get subscription", e))
    }

    async fn require_subscription(&self, tenant_id: Uuid) -> Result<Subscription, AppError> {
        self.fetch_subscription_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))
    }
}

#[async_trait]
impl UsageStore for Database {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn insert_usage(&self, records: &[NewUsageRecord]) -> Result<u64, AppError> {
        if records.is_empty() {
            return Ok(0);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_usage"])
            .start_timer();

        let ids: Vec<Uuid> = records.iter().map(|_| Uuid::new_v4()).collect();
        let tenants: Vec<Uuid> = records.iter().map(|r| r.tenant_id).collect();
        let metrics: Vec<String> = records.iter().map(|r| r.metric.to_string()).collect();
        let quantities: Vec<i64> = records.iter().map(|r| r.quantity).collect();
        let starts: Vec<_> = records.iter().map(|r| r.period.start).collect();
        let ends: Vec<_> = records.iter().map(|r| r.period.end).collect();

        // Single statement, so the whole window lands or none of it does.
        let result = sqlx::query(
            r#"
            INSERT INTO usage_records (id, tenant_id, metric, quantity, period_start, period_end)
            SELECT * FROM UNNEST($1::UUID[], $2::UUID[], $3::TEXT[], $4::BIGINT[], $5::TIMESTAMPTZ[], $6::TIMESTAMPTZ[])
            "#,
        )
        .bind(&ids)
        .bind(&tenants)
        .bind(&metrics)
        .bind(&quantities)
        .bind(&starts)
        .bind(&ends)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert usage records", e))?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, metric = %metric))]
    async fn period_usage(
        &self,
        tenant_id: Uuid,
        metric: UsageMetric,
        at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["period_usage"])
            .start_timer();

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM usage_records
            WHERE tenant_id = $1 AND metric = $2 AND period_start <= $3 AND period_end > $3
            "#,
        )
        .bind(tenant_id)
        .bind(metric.as_str())
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to sum usage", e))?;

        timer.observe_duration();

        Ok(total)
    }

    #[instrument(skip(self))]
    async fn unreported_usage(&self) -> Result<Vec<UnreportedUsage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unreported_usage"])
            .start_timer();

        let groups = sqlx::query_as::<_, UnreportedUsage>(
            r#"
            SELECT tenant_id, metric, SUM(quantity)::BIGINT AS quantity,
                   period_start, period_end, ARRAY_AGG(id) AS record_ids
            FROM usage_records
            WHERE reported_to_provider = FALSE
            GROUP BY tenant_id, metric, period_start, period_end
            ORDER BY tenant_id, metric, period_start
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list unreported usage", e))?;

        timer.observe_duration();

        Ok(groups)
    }

    #[instrument(skip(self, record_ids), fields(count = record_ids.len()))]
    async fn mark_reported(
        &self,
        record_ids: &[Uuid],
        provider_usage_id: Option<&str>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_reported"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE usage_records
            SET reported_to_provider = TRUE, provider_usage_id = $2, reported_at = NOW(), updated_at = NOW()
            WHERE id = ANY($1) AND reported_to_provider = FALSE
            "#,
        )
        .bind(record_ids)
        .bind(provider_usage_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark usage reported", e))?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for Database {
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn find_by_tenant(&self, tenant_id: Uuid) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscription_by_tenant"])
            .start_timer();

        let subscription = self.fetch_subscription_by_tenant(tenant_id).await?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self))]
    async fn find_by_provider_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscription_by_provider_id"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE provider_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self, subscription), fields(tenant_id = %subscription.tenant_id))]
    async fn insert_if_absent(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_subscription"])
            .start_timer();

        let inserted = sqlx::query(
            r#"
            INSERT INTO subscriptions (id, tenant_id, plan, status, billing_cycle_anchor,
                current_period_start, current_period_end, cancel_at_period_end, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.tenant_id)
        .bind(&subscription.plan)
        .bind(&subscription.status)
        .bind(subscription.billing_cycle_anchor)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create subscription", e))?;

        if inserted.rows_affected() == 1 {
            info!(plan = %subscription.plan, "Subscription row created");
        }

        // Re-read: a concurrent first access may have won the insert.
        let stored = self.require_subscription(subscription.tenant_id).await?;

        timer.observe_duration();
        Ok(stored)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn set_provider_customer(
        &self,
        tenant_id: Uuid,
        provider_customer_id: &str,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_provider_customer"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "UPDATE subscriptions SET provider_customer_id = $2, updated_at = NOW() \
             WHERE tenant_id = $1 RETURNING {}",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(provider_customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to link provider customer", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self, snapshot), fields(tenant_id = %tenant_id, provider_subscription_id = %snapshot.provider_subscription_id))]
    async fn apply_snapshot(
        &self,
        tenant_id: Uuid,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_subscription_snapshot"])
            .start_timer();

        let sql = format!(
            "UPDATE subscriptions SET {}, provider_subscription_id = $12 WHERE tenant_id = $13",
            SNAPSHOT_ASSIGNMENTS
        );
        let result = Self::snapshot_query(&sql, snapshot)
            .bind(snapshot.provider_subscription_id.as_str())
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict(anyhow::anyhow!(
                        "Provider subscription is linked to another tenant"
                    ))
                }
                _ => db_error("Failed to update subscription", e),
            })?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!("Subscription not found")));
        }

        let subscription = self.require_subscription(tenant_id).await?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self, snapshot), fields(provider_subscription_id = %snapshot.provider_subscription_id))]
    async fn sync_snapshot(
        &self,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<SyncOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sync_subscription_snapshot"])
            .start_timer();

        let sql = format!(
            "UPDATE subscriptions SET {} WHERE provider_subscription_id = $12 AND {}",
            SNAPSHOT_ASSIGNMENTS, SNAPSHOT_DIFFERS
        );
        let result = Self::snapshot_query(&sql, snapshot)
            .bind(snapshot.provider_subscription_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to sync subscription", e))?;

        let outcome = if result.rows_affected() > 0 {
            SyncOutcome::Updated
        } else {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE provider_subscription_id = $1)",
            )
            .bind(snapshot.provider_subscription_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to check subscription", e))?;

            if exists {
                SyncOutcome::Unchanged
            } else {
                SyncOutcome::NotFound
            }
        };

        timer.observe_duration();
        Ok(outcome)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn mark_canceled(&self, tenant_id: Uuid) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "UPDATE subscriptions SET status = 'canceled', canceled_at = NOW(), updated_at = NOW() \
             WHERE tenant_id = $1 RETURNING {}",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to cancel subscription", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        timer.observe_duration();
        Ok(subscription)
    }
}
