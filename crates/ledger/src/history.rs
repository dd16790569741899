//! Transaction history queries

use sqlx::PgPool;
use uuid::Uuid;

use swapdeck_shared::types::CreditTransaction;

use crate::error::LedgerResult;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

/// Read-only view over the credit ledger
#[derive(Clone)]
pub struct TransactionHistoryService {
    pool: PgPool,
}

impl TransactionHistoryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Recent transactions for a user, newest first. `limit` is clamped to
    /// 1..=100; `offset` below zero reads as zero.
    pub async fn get_transactions(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> LedgerResult<Vec<CreditTransaction>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);

        let rows: Vec<CreditTransaction> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, transaction_type, description, balance_after,
                   related_subscription_id, metadata, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Total number of ledger entries for a user, for pagination headers
    pub async fn count_transactions(&self, user_id: Uuid) -> LedgerResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM credit_transactions WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_history_is_newest_first_and_clamped() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let history = TransactionHistoryService::new(pool.clone());
        let recharge = crate::recharge::RechargeService::new(pool);

        let user_id = Uuid::new_v4();
        for i in 1..=3 {
            recharge
                .recharge(user_id, i * 10, None, "test pack")
                .await
                .expect("recharge");
        }

        let rows = history
            .get_transactions(user_id, Some(500), None)
            .await
            .expect("history");
        // initial grant + 3 recharges, newest first
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].amount, 30);

        let page = history
            .get_transactions(user_id, Some(2), Some(1))
            .await
            .expect("page");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].amount, 20);
    }
}
