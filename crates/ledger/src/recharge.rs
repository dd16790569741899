//! Recharge, bonus, and refund grants
//!
//! Recharges are idempotent per external payment reference: the upstream
//! webhook transport delivers at-least-once, so the same payment must never
//! credit twice. The check runs under the user's row lock with a partial
//! unique index on the ledger as the storage-level backstop.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use swapdeck_shared::types::TransactionType;

use crate::balance::{active_subscription_remainder, set_lock_timeout, BalanceService};
use crate::error::{LedgerError, LedgerResult};

/// Outcome of a recharge attempt
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RechargeOutcome {
    Recharged {
        balance_after: i32,
        amount_added: i32,
        transaction_id: Uuid,
    },
    /// The payment reference was already recorded; state unchanged
    Duplicate { balance_after: i32 },
    InvalidAmount { amount: i32 },
}

/// Outcome of a bonus or refund grant
#[derive(Debug, Clone, Serialize)]
pub struct GrantReceipt {
    pub balance_after: i32,
    pub transaction_id: Uuid,
}

/// Service for credit-adding operations
#[derive(Clone)]
pub struct RechargeService {
    pool: PgPool,
    balance: BalanceService,
}

impl RechargeService {
    pub fn new(pool: PgPool) -> Self {
        let balance = BalanceService::new(pool.clone());
        Self { pool, balance }
    }

    /// Add paid credits to a user's wallet.
    ///
    /// `idempotency_key` is the external payment reference (payment intent
    /// id); when present, a second call with the same key returns
    /// `Duplicate` with the balance unchanged from the first call.
    pub async fn recharge(
        &self,
        user_id: Uuid,
        amount: i32,
        idempotency_key: Option<&str>,
        description: &str,
    ) -> LedgerResult<RechargeOutcome> {
        if amount <= 0 {
            return Ok(RechargeOutcome::InvalidAmount { amount });
        }

        self.balance.get_or_create(user_id).await?;

        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx).await?;

        let (wallet,): (i32,) =
            sqlx::query_as("SELECT wallet_balance FROM user_balances WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        if let Some(key) = idempotency_key {
            let prior: Option<(i32,)> = sqlx::query_as(
                r#"
                SELECT balance_after FROM credit_transactions
                WHERE transaction_type = 'recharge' AND metadata->>'payment_ref' = $1
                LIMIT 1
                "#,
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((balance_after,)) = prior {
                tx.commit().await?;
                tracing::info!(
                    user_id = %user_id,
                    payment_ref = %key,
                    "Duplicate recharge delivery ignored"
                );
                return Ok(RechargeOutcome::Duplicate { balance_after });
            }
        }

        let sub_sum = active_subscription_remainder(&mut tx, user_id).await? as i32;
        let balance_after = wallet + amount + sub_sum;

        sqlx::query(
            r#"
            UPDATE user_balances
            SET wallet_balance = wallet_balance + $2,
                balance = $3,
                total_recharged = total_recharged + $2,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(balance_after)
        .execute(&mut *tx)
        .await?;

        let metadata = match idempotency_key {
            Some(key) => serde_json::json!({ "payment_ref": key }),
            None => serde_json::json!({}),
        };

        let insert = sqlx::query_as::<_, (Uuid,)>(
            r#"
            INSERT INTO credit_transactions
                (user_id, amount, transaction_type, description, balance_after, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(TransactionType::Recharge)
        .bind(description)
        .bind(balance_after)
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await;

        let transaction_id = match insert {
            Ok((id,)) => id,
            // Unique index on payment_ref caught a race the pre-check missed
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                drop(tx);
                let key = idempotency_key.unwrap_or_default();
                let (balance_after,): (i32,) = sqlx::query_as(
                    r#"
                    SELECT balance_after FROM credit_transactions
                    WHERE transaction_type = 'recharge' AND metadata->>'payment_ref' = $1
                    LIMIT 1
                    "#,
                )
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
                tracing::warn!(
                    user_id = %user_id,
                    payment_ref = %key,
                    "Concurrent duplicate recharge caught by unique index"
                );
                return Ok(RechargeOutcome::Duplicate { balance_after });
            }
            Err(e) => return Err(LedgerError::from(e)),
        };

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            balance_after = balance_after,
            payment_ref = idempotency_key.unwrap_or("-"),
            "Credits recharged"
        );

        Ok(RechargeOutcome::Recharged {
            balance_after,
            amount_added: amount,
            transaction_id,
        })
    }

    /// Promotional/goodwill grant; same mutation as a recharge but tagged
    /// with a reason instead of a payment reference
    pub async fn grant_bonus(
        &self,
        user_id: Uuid,
        amount: i32,
        reason: &str,
        metadata: serde_json::Value,
    ) -> LedgerResult<GrantReceipt> {
        if amount <= 0 {
            return Err(LedgerError::InvalidInput(format!(
                "bonus amount must be positive, got {}",
                amount
            )));
        }
        self.add_to_wallet(user_id, amount, TransactionType::Bonus, reason, metadata, true)
            .await
    }

    /// Return credits after a failed delivery (charged but no result)
    pub async fn refund(
        &self,
        user_id: Uuid,
        amount: i32,
        reason: &str,
        related_transaction_id: Option<Uuid>,
    ) -> LedgerResult<GrantReceipt> {
        if amount <= 0 {
            return Err(LedgerError::InvalidInput(format!(
                "refund amount must be positive, got {}",
                amount
            )));
        }
        let metadata = match related_transaction_id {
            Some(id) => serde_json::json!({ "refunds_transaction": id }),
            None => serde_json::json!({}),
        };
        // Refunds restore the wallet but never rewind the monotonic counters
        self.add_to_wallet(user_id, amount, TransactionType::Refund, reason, metadata, false)
            .await
    }

    async fn add_to_wallet(
        &self,
        user_id: Uuid,
        amount: i32,
        transaction_type: TransactionType,
        description: &str,
        metadata: serde_json::Value,
        counts_as_recharged: bool,
    ) -> LedgerResult<GrantReceipt> {
        self.balance.get_or_create(user_id).await?;

        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx).await?;

        let (wallet,): (i32,) =
            sqlx::query_as("SELECT wallet_balance FROM user_balances WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        let sub_sum = active_subscription_remainder(&mut tx, user_id).await? as i32;
        let balance_after = wallet + amount + sub_sum;

        sqlx::query(
            r#"
            UPDATE user_balances
            SET wallet_balance = wallet_balance + $2,
                balance = $3,
                total_recharged = total_recharged + CASE WHEN $4 THEN $2 ELSE 0 END,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(balance_after)
        .bind(counts_as_recharged)
        .execute(&mut *tx)
        .await?;

        let (transaction_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (user_id, amount, transaction_type, description, balance_after, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(transaction_type)
        .bind(description)
        .bind(balance_after)
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            transaction_type = %transaction_type,
            balance_after = balance_after,
            "Credits granted"
        );

        Ok(GrantReceipt {
            balance_after,
            transaction_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_recharge_idempotency() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let service = RechargeService::new(pool.clone());

        let user_id = Uuid::new_v4();
        let key = format!("pi_test_{}", Uuid::new_v4());

        let first = service
            .recharge(user_id, 50, Some(&key), "50 credit pack")
            .await
            .expect("first");
        let first_balance = match first {
            RechargeOutcome::Recharged { balance_after, .. } => balance_after,
            other => panic!("expected Recharged, got {:?}", other),
        };

        let second = service
            .recharge(user_id, 50, Some(&key), "50 credit pack")
            .await
            .expect("second");
        match second {
            RechargeOutcome::Duplicate { balance_after } => {
                assert_eq!(balance_after, first_balance)
            }
            other => panic!("expected Duplicate, got {:?}", other),
        }

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM credit_transactions WHERE metadata->>'payment_ref' = $1",
        )
        .bind(&key)
        .fetch_one(&pool)
        .await
        .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_refund_restores_wallet_without_bumping_recharged() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let service = RechargeService::new(pool.clone());

        let user_id = Uuid::new_v4();
        let receipt = service
            .refund(user_id, 3, "delivery failed", None)
            .await
            .expect("refund");
        assert_eq!(
            receipt.balance_after,
            swapdeck_shared::types::INITIAL_CREDIT_GRANT + 3
        );

        let (total_recharged,): (i32,) =
            sqlx::query_as("SELECT total_recharged FROM user_balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&pool)
                .await
                .expect("row");
        // Refunds never count as recharges; only the welcome grant does
        assert_eq!(
            total_recharged,
            swapdeck_shared::types::INITIAL_CREDIT_GRANT
        );
    }
}
