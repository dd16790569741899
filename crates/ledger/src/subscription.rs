//! Subscription credit tracking
//!
//! One row per billing period that granted credits. Grants are idempotent
//! per (subscription, period) so webhook redelivery for the same invoice
//! never double-credits. The expiration sweep zeroes overdue remainders and
//! repairs the cached balance; it is safe to re-run and to overlap with
//! consumption because it takes the same locks in the same order.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use swapdeck_shared::types::{SubscriptionCredit, TransactionType};

use crate::balance::{set_lock_timeout, BalanceService};
use crate::error::{LedgerError, LedgerResult};

/// Outcome of a period grant
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GrantOutcome {
    Granted(SubscriptionCredit),
    /// This (subscription, period) was already granted; state unchanged
    AlreadyGranted(SubscriptionCredit),
}

impl GrantOutcome {
    pub fn record(&self) -> &SubscriptionCredit {
        match self {
            GrantOutcome::Granted(r) | GrantOutcome::AlreadyGranted(r) => r,
        }
    }
}

/// Summary of one expiration sweep run
#[derive(Debug, Clone, Serialize)]
pub struct ExpireSweepResult {
    pub expired_count: usize,
    pub affected_users: Vec<Uuid>,
}

/// Service for subscription credit periods
#[derive(Clone)]
pub struct SubscriptionCreditService {
    pool: PgPool,
    balance: BalanceService,
}

impl SubscriptionCreditService {
    pub fn new(pool: PgPool) -> Self {
        let balance = BalanceService::new(pool.clone());
        Self { pool, balance }
    }

    /// Grant credits for one billing period.
    ///
    /// Single-subscription policy: any other active period for a different
    /// subscription is cancelled (with an expiration ledger entry for its
    /// remainder) before the new grant lands.
    pub async fn grant_period(
        &self,
        user_id: Uuid,
        subscription_id: &str,
        credits: i32,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> LedgerResult<GrantOutcome> {
        if credits <= 0 {
            return Err(LedgerError::InvalidInput(format!(
                "period credits must be positive, got {}",
                credits
            )));
        }
        if period_end <= period_start {
            return Err(LedgerError::InvalidInput(
                "period_end must be after period_start".to_string(),
            ));
        }

        self.balance.get_or_create(user_id).await?;

        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx).await?;

        let (wallet,): (i32,) =
            sqlx::query_as("SELECT wallet_balance FROM user_balances WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        // Redelivered webhook for an already-granted period: no-op
        let existing: Option<SubscriptionCredit> = sqlx::query_as(
            r#"
            SELECT id, user_id, subscription_id, credits, remaining_credits,
                   period_start, period_end, status, created_at, updated_at
            FROM subscription_credits
            WHERE subscription_id = $1 AND period_start = $2 AND period_end = $3
            "#,
        )
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(record) = existing {
            tx.commit().await?;
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                "Duplicate period grant ignored"
            );
            return Ok(GrantOutcome::AlreadyGranted(record));
        }

        // Replace any other active subscription's periods. `in_total` marks
        // rows whose remainder is part of the current spendable total
        // (overdue-but-unswept rows are not).
        let displaced: Vec<(Uuid, String, i32, bool)> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, remaining_credits, period_end > NOW() AS in_total
            FROM subscription_credits
            WHERE user_id = $1 AND status = 'active' AND subscription_id != $2
            ORDER BY period_end ASC
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(subscription_id)
        .fetch_all(&mut *tx)
        .await?;

        let active_remainder: i32 = {
            let (sum,): (i64,) = sqlx::query_as(
                r#"
                SELECT COALESCE(SUM(remaining_credits), 0)
                FROM subscription_credits
                WHERE user_id = $1 AND status = 'active' AND period_end > NOW()
                "#,
            )
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
            sum as i32
        };
        let mut running_total = wallet + active_remainder;

        // Running total walks each ledger entry to its post-entry snapshot
        for (row_id, old_sub_id, remaining, in_total) in &displaced {
            if *remaining > 0 {
                if *in_total {
                    running_total -= remaining;
                }
                sqlx::query(
                    r#"
                    INSERT INTO credit_transactions
                        (user_id, amount, transaction_type, description, balance_after,
                         related_subscription_id, metadata)
                    VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb)
                    "#,
                )
                .bind(user_id)
                .bind(-remaining)
                .bind(TransactionType::Expiration)
                .bind("Subscription replaced")
                .bind(running_total)
                .bind(old_sub_id)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(
                r#"
                UPDATE subscription_credits
                SET status = 'cancelled', remaining_credits = 0, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(row_id)
            .execute(&mut *tx)
            .await?;
        }

        let inserted = sqlx::query_as::<_, SubscriptionCredit>(
            r#"
            INSERT INTO subscription_credits
                (user_id, subscription_id, credits, remaining_credits,
                 period_start, period_end, status)
            VALUES ($1, $2, $3, $3, $4, $5, 'active')
            RETURNING id, user_id, subscription_id, credits, remaining_credits,
                      period_start, period_end, status, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(subscription_id)
        .bind(credits)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&mut *tx)
        .await;

        let record = match inserted {
            Ok(record) => record,
            // Concurrent redelivery lost the insert race on the period index
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                drop(tx);
                let record: SubscriptionCredit = sqlx::query_as(
                    r#"
                    SELECT id, user_id, subscription_id, credits, remaining_credits,
                           period_start, period_end, status, created_at, updated_at
                    FROM subscription_credits
                    WHERE subscription_id = $1 AND period_start = $2 AND period_end = $3
                    "#,
                )
                .bind(subscription_id)
                .bind(period_start)
                .bind(period_end)
                .fetch_one(&self.pool)
                .await?;
                return Ok(GrantOutcome::AlreadyGranted(record));
            }
            Err(e) => return Err(LedgerError::from(e)),
        };

        // Grant appears in the ledger and the cached total immediately
        if period_end > OffsetDateTime::now_utc() {
            running_total += credits;
        }
        sqlx::query(
            r#"
            INSERT INTO credit_transactions
                (user_id, amount, transaction_type, description, balance_after,
                 related_subscription_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb)
            "#,
        )
        .bind(user_id)
        .bind(credits)
        .bind(TransactionType::Subscription)
        .bind(format!("Subscription credits for period ending {}", period_end))
        .bind(running_total)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE user_balances SET balance = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(running_total)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            credits = credits,
            period_end = %period_end,
            displaced = displaced.len(),
            "Subscription period granted"
        );

        Ok(GrantOutcome::Granted(record))
    }

    /// Zero out overdue active periods across all users.
    ///
    /// Re-runnable: already-expired rows are skipped. Safe alongside
    /// consumption: each affected user is processed under the standard
    /// balance-row-then-credit-rows lock order.
    pub async fn expire_credits(&self) -> LedgerResult<ExpireSweepResult> {
        let users: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT user_id FROM subscription_credits
            WHERE status = 'active' AND period_end <= NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut expired_count = 0usize;
        let mut affected_users = Vec::new();

        for (user_id,) in users {
            match self.expire_for_user(user_id).await {
                Ok(expired) if expired > 0 => {
                    expired_count += expired;
                    affected_users.push(user_id);
                }
                Ok(_) => {}
                Err(e) => {
                    // One contended user must not stall the sweep; the next
                    // run picks them up
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "Expiration sweep skipped user"
                    );
                }
            }
        }

        if expired_count > 0 {
            tracing::info!(
                expired_count = expired_count,
                affected_users = affected_users.len(),
                "Expiration sweep complete"
            );
        }

        Ok(ExpireSweepResult {
            expired_count,
            affected_users,
        })
    }

    async fn expire_for_user(&self, user_id: Uuid) -> LedgerResult<usize> {
        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx).await?;

        let (wallet,): (i32,) =
            sqlx::query_as("SELECT wallet_balance FROM user_balances WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        let overdue: Vec<(Uuid, String, i32, bool)> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, remaining_credits, period_end > NOW() AS in_total
            FROM subscription_credits
            WHERE user_id = $1 AND status = 'active' AND period_end <= NOW()
            ORDER BY period_end ASC
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        if overdue.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let expired =
            Self::retire_rows(&mut tx, user_id, wallet, &overdue, "Subscription credits expired")
                .await?;

        tx.commit().await?;
        Ok(expired)
    }

    /// Cancel all active periods for one subscription (subscription deleted
    /// upstream), recording the lost remainder and repairing the cache
    pub async fn cancel_subscription(
        &self,
        user_id: Uuid,
        subscription_id: &str,
    ) -> LedgerResult<usize> {
        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx).await?;

        let locked: Option<(i32,)> =
            sqlx::query_as("SELECT wallet_balance FROM user_balances WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((wallet,)) = locked else {
            tx.commit().await?;
            return Ok(0);
        };

        let rows: Vec<(Uuid, String, i32, bool)> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, remaining_credits, period_end > NOW() AS in_total
            FROM subscription_credits
            WHERE user_id = $1 AND status = 'active' AND subscription_id = $2
            ORDER BY period_end ASC
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(subscription_id)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let cancelled =
            Self::retire_rows(&mut tx, user_id, wallet, &rows, "Subscription cancelled").await?;

        // Rows were ledgered as expirations but keep the cancelled status
        for (row_id, _, _, _) in &rows {
            sqlx::query(
                "UPDATE subscription_credits SET status = 'cancelled', updated_at = NOW() WHERE id = $1",
            )
            .bind(row_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            cancelled = cancelled,
            "Subscription credits cancelled"
        );
        Ok(cancelled)
    }

    /// Zero `rows`, append one expiration ledger entry per non-empty
    /// remainder, and write the repaired cached total. Caller holds the
    /// balance row lock and the row locks; `in_total` on each row says
    /// whether its remainder is part of the current spendable total.
    async fn retire_rows(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        wallet: i32,
        rows: &[(Uuid, String, i32, bool)],
        description: &str,
    ) -> LedgerResult<usize> {
        // Spendable total before retiring: future-dated active rows only
        let (future_sum,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(remaining_credits), 0)
            FROM subscription_credits
            WHERE user_id = $1 AND status = 'active' AND period_end > NOW()
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;

        let mut running_total = wallet + future_sum as i32;
        let mut retired = 0usize;

        for (row_id, subscription_id, remaining, in_total) in rows {
            if *remaining > 0 {
                if *in_total {
                    running_total -= remaining;
                }
                sqlx::query(
                    r#"
                    INSERT INTO credit_transactions
                        (user_id, amount, transaction_type, description, balance_after,
                         related_subscription_id, metadata)
                    VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb)
                    "#,
                )
                .bind(user_id)
                .bind(-remaining)
                .bind(TransactionType::Expiration)
                .bind(description)
                .bind(running_total)
                .bind(subscription_id)
                .execute(&mut **tx)
                .await?;
            }
            sqlx::query(
                r#"
                UPDATE subscription_credits
                SET remaining_credits = 0, status = 'expired', updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(row_id)
            .execute(&mut **tx)
            .await?;
            retired += 1;
        }

        sqlx::query(
            "UPDATE user_balances SET balance = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(running_total)
        .execute(&mut **tx)
        .await?;

        Ok(retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_grant_is_idempotent_per_period() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let service = SubscriptionCreditService::new(pool);

        let user_id = Uuid::new_v4();
        let sub_id = format!("sub_test_{}", Uuid::new_v4());
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(30);

        let first = service
            .grant_period(user_id, &sub_id, 120, start, end)
            .await
            .expect("first grant");
        assert!(matches!(first, GrantOutcome::Granted(_)));

        let second = service
            .grant_period(user_id, &sub_id, 120, start, end)
            .await
            .expect("second grant");
        assert!(matches!(second, GrantOutcome::AlreadyGranted(_)));
        assert_eq!(second.record().credits, 120);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_expired_period_is_swept_once() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let service = SubscriptionCreditService::new(pool.clone());

        let user_id = Uuid::new_v4();
        let sub_id = format!("sub_test_{}", Uuid::new_v4());
        let start = OffsetDateTime::now_utc() - Duration::days(31);
        let end = OffsetDateTime::now_utc() - Duration::days(1);

        service
            .grant_period(user_id, &sub_id, 120, start, end)
            .await
            .expect("grant");

        let sweep = service.expire_credits().await.expect("sweep");
        assert!(sweep.affected_users.contains(&user_id));

        // Second sweep finds nothing for this user
        let again = service.expire_credits().await.expect("sweep again");
        assert!(!again.affected_users.contains(&user_id));

        let (remaining, status): (i32, String) = sqlx::query_as(
            "SELECT remaining_credits, status FROM subscription_credits WHERE subscription_id = $1",
        )
        .bind(&sub_id)
        .fetch_one(&pool)
        .await
        .expect("row");
        assert_eq!(remaining, 0);
        assert_eq!(status, "expired");
    }
}
