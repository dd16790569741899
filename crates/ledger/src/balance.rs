//! Balance store: lazy creation, balance queries, reconciliation
//!
//! The wallet column plus the subscription-credit rows are authoritative;
//! `user_balances.balance` caches the spendable total and is refreshed inside
//! every mutating transaction. `recalculate_balance` repairs the cache after
//! subscription lifecycle events.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use swapdeck_shared::types::{TransactionType, UserBalance, INITIAL_CREDIT_GRANT};

use crate::error::LedgerResult;

/// Balance snapshot returned to callers; `balance` is the live spendable
/// total (wallet + active subscription remainders), summed on read
#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub balance: i32,
    pub total_recharged: i32,
    pub total_consumed: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Service for the per-user balance rows
#[derive(Clone)]
pub struct BalanceService {
    pool: PgPool,
}

/// Bound every row-lock wait so a contended balance row fails fast with a
/// retryable error instead of head-of-line blocking the connection
pub(crate) async fn set_lock_timeout(tx: &mut Transaction<'_, Postgres>) -> sqlx::Result<()> {
    sqlx::query("SET LOCAL lock_timeout = '5s'")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Sum of spendable subscription remainders for a user.
/// Only safe against concurrent mutation when the caller already holds the
/// user's balance row lock (every mutating operation takes it first).
pub(crate) async fn active_subscription_remainder(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> sqlx::Result<i64> {
    let (sum,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(remaining_credits), 0)
        FROM subscription_credits
        WHERE user_id = $1 AND status = 'active' AND period_end > NOW()
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(sum)
}

impl BalanceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the balance row for a user, creating it with the initial grant on
    /// first access. Concurrent first access is resolved by the primary key:
    /// the loser of the insert race re-reads the winner's row.
    pub async fn get_or_create(&self, user_id: Uuid) -> LedgerResult<UserBalance> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<UserBalance> = sqlx::query_as(
            r#"
            INSERT INTO user_balances (user_id, wallet_balance, balance, total_recharged, total_consumed)
            VALUES ($1, $2, $2, $2, 0)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING user_id, wallet_balance, balance, total_recharged, total_consumed,
                      created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(INITIAL_CREDIT_GRANT)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = inserted {
            // Initial grant and its ledger entry commit together
            sqlx::query(
                r#"
                INSERT INTO credit_transactions
                    (user_id, amount, transaction_type, description, balance_after, metadata)
                VALUES ($1, $2, $3, 'Welcome credits', $2, '{}'::jsonb)
                "#,
            )
            .bind(user_id)
            .bind(INITIAL_CREDIT_GRANT)
            .bind(TransactionType::Initial)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::info!(
                user_id = %user_id,
                initial_credits = INITIAL_CREDIT_GRANT,
                "Created balance row with welcome grant"
            );
            return Ok(row);
        }

        tx.commit().await?;

        let row: UserBalance = sqlx::query_as(
            r#"
            SELECT user_id, wallet_balance, balance, total_recharged, total_consumed,
                   created_at, updated_at
            FROM user_balances WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Current balance summary, creating the row if absent.
    /// The returned `balance` is summed from the authoritative sources on
    /// read rather than trusting the cached column.
    pub async fn get_balance(&self, user_id: Uuid) -> LedgerResult<BalanceSummary> {
        let row = self.get_or_create(user_id).await?;

        let (sub_sum,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(remaining_credits), 0)
            FROM subscription_credits
            WHERE user_id = $1 AND status = 'active' AND period_end > NOW()
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(BalanceSummary {
            balance: row.wallet_balance + sub_sum as i32,
            total_recharged: row.total_recharged,
            total_consumed: row.total_consumed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    /// Recompute the cached total from the authoritative sources and
    /// overwrite the stored column. Run after expiration sweeps and
    /// subscription status changes to correct drift.
    pub async fn recalculate_balance(&self, user_id: Uuid) -> LedgerResult<UserBalance> {
        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx).await?;

        // Balance row lock first; same order as every other mutating op
        let _locked: Option<(i32,)> =
            sqlx::query_as("SELECT wallet_balance FROM user_balances WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;

        if _locked.is_none() {
            tx.commit().await?;
            return self.get_or_create(user_id).await;
        }

        let sub_sum = active_subscription_remainder(&mut tx, user_id).await?;

        let row: UserBalance = sqlx::query_as(
            r#"
            UPDATE user_balances
            SET balance = wallet_balance + $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, wallet_balance, balance, total_recharged, total_consumed,
                      created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(sub_sum as i32)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            user_id = %user_id,
            balance = row.balance,
            wallet_balance = row.wallet_balance,
            "Recalculated cached balance"
        );
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_first_access_creates_initial_grant() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url)
            .await
            .expect("pool");
        let service = BalanceService::new(pool.clone());

        let user_id = Uuid::new_v4();
        let row = service.get_or_create(user_id).await.expect("create");
        assert_eq!(row.balance, INITIAL_CREDIT_GRANT);
        assert_eq!(row.total_recharged, INITIAL_CREDIT_GRANT);
        assert_eq!(row.total_consumed, 0);

        // Second access returns the same row, no second grant
        let again = service.get_or_create(user_id).await.expect("read");
        assert_eq!(again.balance, INITIAL_CREDIT_GRANT);

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM credit_transactions WHERE user_id = $1 AND transaction_type = 'initial'",
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .expect("count");
        assert_eq!(count, 1);
    }
}
