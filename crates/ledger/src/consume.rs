//! Credit consumption
//!
//! All-or-nothing debit against a user's spendable total. Subscription
//! credits drain soonest-to-expire first; any shortfall comes out of the
//! wallet. The balance mutation and the ledger append commit in one
//! transaction under the user's row lock.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use swapdeck_shared::types::TransactionType;

use crate::balance::{set_lock_timeout, BalanceService};
use crate::error::LedgerResult;

/// Outcome of a consumption attempt. Expected failures are variants, not
/// errors, so webhook and API callers can branch without string matching.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConsumeOutcome {
    Consumed {
        balance_after: i32,
        amount_consumed: i32,
        transaction_id: Uuid,
    },
    InsufficientFunds {
        balance: i32,
        required: i32,
    },
    InvalidAmount {
        amount: i32,
    },
}

/// One active subscription-credit row participating in a drain, already
/// ordered soonest-period_end-first by the caller
#[derive(Debug, Clone)]
pub(crate) struct DrainSource {
    pub id: Uuid,
    pub subscription_id: String,
    pub remaining_credits: i32,
}

/// How a requested amount splits across subscription rows and the wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DrainPlan {
    /// (row id, amount to subtract) in drain order
    pub draws: Vec<(Uuid, i32)>,
    pub wallet_draw: i32,
}

/// Pure drain arithmetic: drain `sources` in order, then the wallet.
/// Returns None when wallet + remainders cannot cover `amount`.
pub(crate) fn plan_drain(wallet: i32, sources: &[DrainSource], amount: i32) -> Option<DrainPlan> {
    let available: i64 =
        wallet as i64 + sources.iter().map(|s| s.remaining_credits as i64).sum::<i64>();
    if (amount as i64) > available {
        return None;
    }

    let mut still_needed = amount;
    let mut draws = Vec::new();
    for source in sources {
        if still_needed == 0 {
            break;
        }
        let draw = source.remaining_credits.min(still_needed);
        if draw > 0 {
            draws.push((source.id, draw));
            still_needed -= draw;
        }
    }

    Some(DrainPlan {
        draws,
        wallet_draw: still_needed,
    })
}

/// Service for consuming credits
#[derive(Clone)]
pub struct ConsumeService {
    pool: PgPool,
    balance: BalanceService,
}

impl ConsumeService {
    pub fn new(pool: PgPool) -> Self {
        let balance = BalanceService::new(pool.clone());
        Self { pool, balance }
    }

    /// Consume `amount` credits for a user.
    ///
    /// Locks the balance row, then the user's spendable subscription rows in
    /// period_end order (fixed lock order across all operations). No partial
    /// debit: an insufficient balance leaves every table untouched.
    pub async fn consume(
        &self,
        user_id: Uuid,
        amount: i32,
        description: &str,
    ) -> LedgerResult<ConsumeOutcome> {
        if amount <= 0 {
            return Ok(ConsumeOutcome::InvalidAmount { amount });
        }

        // Lazy-create so a brand-new user spends from the welcome grant
        self.balance.get_or_create(user_id).await?;

        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx).await?;

        let (wallet,): (i32,) =
            sqlx::query_as("SELECT wallet_balance FROM user_balances WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        let rows: Vec<(Uuid, String, i32)> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, remaining_credits
            FROM subscription_credits
            WHERE user_id = $1 AND status = 'active'
              AND period_end > NOW() AND remaining_credits > 0
            ORDER BY period_end ASC
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let sources: Vec<DrainSource> = rows
            .into_iter()
            .map(|(id, subscription_id, remaining_credits)| DrainSource {
                id,
                subscription_id,
                remaining_credits,
            })
            .collect();

        let total_before =
            wallet + sources.iter().map(|s| s.remaining_credits).sum::<i32>();

        let Some(plan) = plan_drain(wallet, &sources, amount) else {
            // Transaction dropped without commit: nothing mutated
            tracing::info!(
                user_id = %user_id,
                balance = total_before,
                required = amount,
                "Consumption rejected: insufficient credits"
            );
            return Ok(ConsumeOutcome::InsufficientFunds {
                balance: total_before,
                required: amount,
            });
        };

        for (row_id, draw) in &plan.draws {
            sqlx::query(
                r#"
                UPDATE subscription_credits
                SET remaining_credits = remaining_credits - $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(row_id)
            .bind(draw)
            .execute(&mut *tx)
            .await?;
        }

        let balance_after = total_before - amount;
        sqlx::query(
            r#"
            UPDATE user_balances
            SET wallet_balance = wallet_balance - $2,
                balance = $3,
                total_consumed = total_consumed + $4,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(plan.wallet_draw)
        .bind(balance_after)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        let subscription_consumed: i32 = plan.draws.iter().map(|(_, d)| d).sum();
        let split = serde_json::json!({
            "subscription_consumed": subscription_consumed,
            "wallet_consumed": plan.wallet_draw,
            "sources": plan
                .draws
                .iter()
                .map(|(row_id, draw)| {
                    let sub_id = sources
                        .iter()
                        .find(|s| s.id == *row_id)
                        .map(|s| s.subscription_id.as_str())
                        .unwrap_or("");
                    serde_json::json!({ "subscription_id": sub_id, "amount": draw })
                })
                .collect::<Vec<_>>(),
        });

        let (transaction_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (user_id, amount, transaction_type, description, balance_after, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(-amount)
        .bind(TransactionType::Consumption)
        .bind(description)
        .bind(balance_after)
        .bind(&split)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            balance_after = balance_after,
            subscription_consumed = subscription_consumed,
            wallet_consumed = plan.wallet_draw,
            "Credits consumed"
        );

        Ok(ConsumeOutcome::Consumed {
            balance_after,
            amount_consumed: amount,
            transaction_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(remaining: i32) -> DrainSource {
        DrainSource {
            id: Uuid::new_v4(),
            subscription_id: "sub_test".to_string(),
            remaining_credits: remaining,
        }
    }

    #[test]
    fn test_plan_drain_insufficient() {
        assert_eq!(plan_drain(0, &[], 1), None);
        assert_eq!(plan_drain(2, &[source(3)], 6), None);
    }

    #[test]
    fn test_plan_drain_wallet_only() {
        let plan = plan_drain(5, &[], 3).expect("plan");
        assert!(plan.draws.is_empty());
        assert_eq!(plan.wallet_draw, 3);
    }

    #[test]
    fn test_plan_drain_drains_soonest_expiring_first() {
        // Sources arrive ordered by period_end; the first must hit zero
        // before the second is touched
        let soon = source(10);
        let later = source(50);
        let plan = plan_drain(0, &[soon.clone(), later.clone()], 25).expect("plan");
        assert_eq!(plan.draws, vec![(soon.id, 10), (later.id, 15)]);
        assert_eq!(plan.wallet_draw, 0);
    }

    #[test]
    fn test_plan_drain_overflows_into_wallet() {
        let only = source(4);
        let plan = plan_drain(10, &[only.clone()], 7).expect("plan");
        assert_eq!(plan.draws, vec![(only.id, 4)]);
        assert_eq!(plan.wallet_draw, 3);
    }

    #[test]
    fn test_plan_drain_exact_cover() {
        let a = source(2);
        let b = source(3);
        let plan = plan_drain(0, &[a.clone(), b.clone()], 5).expect("plan");
        assert_eq!(plan.draws, vec![(a.id, 2), (b.id, 3)]);
        assert_eq!(plan.wallet_draw, 0);
    }

    #[test]
    fn test_plan_drain_skips_empty_sources() {
        let empty = source(0);
        let full = source(5);
        let plan = plan_drain(0, &[empty, full.clone()], 5).expect("plan");
        assert_eq!(plan.draws, vec![(full.id, 5)]);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_sequential_consumes_chain_balance_snapshots() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let service = ConsumeService::new(pool.clone());

        let user_id = Uuid::new_v4();
        // New user holds exactly the welcome grant
        let grant = swapdeck_shared::types::INITIAL_CREDIT_GRANT;

        for expected_after in [grant - 1, grant - 2, grant - 3] {
            let outcome = service
                .consume(user_id, 1, "face swap")
                .await
                .expect("consume");
            match outcome {
                ConsumeOutcome::Consumed {
                    balance_after,
                    amount_consumed,
                    ..
                } => {
                    assert_eq!(balance_after, expected_after);
                    assert_eq!(amount_consumed, 1);
                }
                other => panic!("expected Consumed, got {:?}", other),
            }
        }

        let snapshots: Vec<(i32,)> = sqlx::query_as(
            r#"
            SELECT balance_after FROM credit_transactions
            WHERE user_id = $1 AND transaction_type = 'consumption'
            ORDER BY created_at ASC, balance_after DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&pool)
        .await
        .expect("snapshots");
        let snapshots: Vec<i32> = snapshots.into_iter().map(|(b,)| b).collect();
        assert_eq!(snapshots, vec![grant - 1, grant - 2, grant - 3]);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_consume_drains_subscription_before_wallet() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let service = ConsumeService::new(pool.clone());
        let balance = BalanceService::new(pool.clone());

        let user_id = Uuid::new_v4();
        balance.get_or_create(user_id).await.expect("balance row");

        let sub_id = format!("sub_test_{}", Uuid::new_v4());
        sqlx::query(
            r#"
            INSERT INTO subscription_credits
                (user_id, subscription_id, credits, remaining_credits,
                 period_start, period_end, status)
            VALUES ($1, $2, 3, 3, NOW(), NOW() + interval '30 days', 'active')
            "#,
        )
        .bind(user_id)
        .bind(&sub_id)
        .execute(&pool)
        .await
        .expect("subscription row");

        // 3 subscription credits drain first, the last 1 hits the wallet
        let outcome = service
            .consume(user_id, 4, "batch swap")
            .await
            .expect("consume");
        let transaction_id = match outcome {
            ConsumeOutcome::Consumed {
                balance_after,
                transaction_id,
                ..
            } => {
                assert_eq!(
                    balance_after,
                    swapdeck_shared::types::INITIAL_CREDIT_GRANT + 3 - 4
                );
                transaction_id
            }
            other => panic!("expected Consumed, got {:?}", other),
        };

        let (remaining,): (i32,) = sqlx::query_as(
            "SELECT remaining_credits FROM subscription_credits WHERE subscription_id = $1",
        )
        .bind(&sub_id)
        .fetch_one(&pool)
        .await
        .expect("remaining");
        assert_eq!(remaining, 0);

        let (split,): (serde_json::Value,) =
            sqlx::query_as("SELECT metadata FROM credit_transactions WHERE id = $1")
                .bind(transaction_id)
                .fetch_one(&pool)
                .await
                .expect("metadata");
        assert_eq!(split["subscription_consumed"], 3);
        assert_eq!(split["wallet_consumed"], 1);
        assert_eq!(split["sources"][0]["subscription_id"], sub_id.as_str());
        assert_eq!(split["sources"][0]["amount"], 3);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_insufficient_funds_leaves_state_untouched() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = swapdeck_shared::db::create_pool(&url).await.expect("pool");
        let service = ConsumeService::new(pool.clone());

        let user_id = Uuid::new_v4();
        // New user holds exactly the welcome grant
        let outcome = service
            .consume(user_id, 100, "too much")
            .await
            .expect("consume");
        match outcome {
            ConsumeOutcome::InsufficientFunds { balance, required } => {
                assert_eq!(balance, swapdeck_shared::types::INITIAL_CREDIT_GRANT);
                assert_eq!(required, 100);
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM credit_transactions WHERE user_id = $1 AND transaction_type = 'consumption'",
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .expect("count");
        assert_eq!(count, 0);
    }
}
