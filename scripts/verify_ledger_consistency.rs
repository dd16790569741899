#!/usr/bin/env rust-script
//! Ledger Consistency Verification Script
//!
//! Runs the ledger invariant checks against a live database and prints a
//! human-readable report.
//!
//! ## Usage
//! ```bash
//! cargo run --bin verify_ledger_consistency
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string

use std::env;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("Swapdeck Ledger Consistency Verification");
    println!("==========================================\n");

    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set");

    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;

    println!("✓ Connected to database\n");

    // ========================================================================
    // Check 1: Cached balance matches wallet + active remainders
    // ========================================================================
    println!("Check 1: Verifying cached balances...");

    let stale_balances: Vec<(uuid::Uuid, i32, i64)> = sqlx::query_as(
        r#"
        SELECT ub.user_id, ub.balance,
               ub.wallet_balance + COALESCE(sc.remaining, 0) AS expected
        FROM user_balances ub
        LEFT JOIN (
            SELECT user_id, SUM(remaining_credits) AS remaining
            FROM subscription_credits
            WHERE status = 'active' AND period_end > NOW()
            GROUP BY user_id
        ) sc ON sc.user_id = ub.user_id
        WHERE ub.balance != ub.wallet_balance + COALESCE(sc.remaining, 0)
        "#
    )
    .fetch_all(&pool)
    .await?;

    if stale_balances.is_empty() {
        println!("  ✓ All cached balances match wallet + active remainders");
    } else {
        println!("  ⚠ Found {} users with stale cached balances", stale_balances.len());
        for (user_id, cached, expected) in &stale_balances {
            println!("    - {}: cached {} expected {}", user_id, cached, expected);
        }
    }

    // ========================================================================
    // Check 2: Ledger replay reproduces the cached balance
    // ========================================================================
    println!("\nCheck 2: Verifying ledger replay...");

    let replay_mismatches: Vec<(uuid::Uuid, i32, i64)> = sqlx::query_as(
        r#"
        SELECT ub.user_id, ub.balance, COALESCE(ct.replayed, 0) AS replayed
        FROM user_balances ub
        LEFT JOIN (
            SELECT user_id, SUM(amount) AS replayed
            FROM credit_transactions
            GROUP BY user_id
        ) ct ON ct.user_id = ub.user_id
        WHERE ub.balance != COALESCE(ct.replayed, 0)
          AND NOT EXISTS (
              SELECT 1 FROM subscription_credits sc
              WHERE sc.user_id = ub.user_id
                AND sc.status = 'active'
                AND sc.period_end <= NOW()
                AND sc.remaining_credits > 0
          )
        "#
    )
    .fetch_all(&pool)
    .await?;

    if replay_mismatches.is_empty() {
        println!("  ✓ Every ledger replays to its cached balance");
    } else {
        println!("  ⚠ Found {} users whose ledger does not replay", replay_mismatches.len());
        for (user_id, cached, replayed) in &replay_mismatches {
            println!("    - {}: cached {} replayed {}", user_id, cached, replayed);
        }
    }

    // ========================================================================
    // Check 3: No negative balances or remainders
    // ========================================================================
    println!("\nCheck 3: Verifying non-negativity...");

    let negatives: Vec<(uuid::Uuid, i32, i32)> = sqlx::query_as(
        r#"
        SELECT user_id, wallet_balance, balance
        FROM user_balances
        WHERE wallet_balance < 0 OR balance < 0
        "#
    )
    .fetch_all(&pool)
    .await?;

    let negative_remainders: Vec<(uuid::Uuid, String, i32)> = sqlx::query_as(
        r#"
        SELECT user_id, subscription_id, remaining_credits
        FROM subscription_credits
        WHERE remaining_credits < 0 OR remaining_credits > credits
        "#
    )
    .fetch_all(&pool)
    .await?;

    if negatives.is_empty() && negative_remainders.is_empty() {
        println!("  ✓ No negative balances, all remainders within granted amounts");
    } else {
        println!("  ⚠ Found {} negative balances", negatives.len());
        for (user_id, wallet, balance) in &negatives {
            println!("    - {}: wallet {} balance {}", user_id, wallet, balance);
        }
        println!("  ⚠ Found {} out-of-range remainders", negative_remainders.len());
        for (user_id, sub_id, remaining) in &negative_remainders {
            println!("    - {}: {} remaining {}", user_id, sub_id, remaining);
        }
    }

    // ========================================================================
    // Check 4: One active subscription per user
    // ========================================================================
    println!("\nCheck 4: Verifying single active subscription per user...");

    let multi_subs: Vec<(uuid::Uuid, i64)> = sqlx::query_as(
        r#"
        SELECT user_id, COUNT(DISTINCT subscription_id) AS subs
        FROM subscription_credits
        WHERE status = 'active' AND period_end > NOW()
        GROUP BY user_id
        HAVING COUNT(DISTINCT subscription_id) > 1
        "#
    )
    .fetch_all(&pool)
    .await?;

    if multi_subs.is_empty() {
        println!("  ✓ No user holds credits from more than one active subscription");
    } else {
        println!("  ⚠ Found {} users with multiple active subscriptions", multi_subs.len());
        for (user_id, subs) in &multi_subs {
            println!("    - {}: {} active subscriptions", user_id, subs);
        }
    }

    // ========================================================================
    // Check 5: Overdue active periods the sweep has missed
    // ========================================================================
    println!("\nCheck 5: Verifying expiration sweep coverage...");

    let stale_periods: Vec<(uuid::Uuid, String, i32)> = sqlx::query_as(
        r#"
        SELECT user_id, subscription_id, remaining_credits
        FROM subscription_credits
        WHERE status = 'active'
          AND period_end < NOW() - INTERVAL '1 day'
          AND remaining_credits > 0
        "#
    )
    .fetch_all(&pool)
    .await?;

    if stale_periods.is_empty() {
        println!("  ✓ No overdue active periods older than a day");
    } else {
        println!("  ⚠ Found {} overdue active periods (sweep may be down)", stale_periods.len());
        for (user_id, sub_id, remaining) in &stale_periods {
            println!("    - {}: {} remaining {}", user_id, sub_id, remaining);
        }
    }

    // ========================================================================
    // Summary Report
    // ========================================================================
    println!("\n========================================");
    println!("Summary");
    println!("========================================");

    let total_issues = stale_balances.len()
        + replay_mismatches.len()
        + negatives.len()
        + negative_remainders.len()
        + multi_subs.len()
        + stale_periods.len();

    if total_issues == 0 {
        println!("✓ No ledger inconsistencies detected!");
    } else {
        println!("⚠ Found {} total issues", total_issues);
        println!("\nRecommendations:");
        println!("1. Re-run balance reconciliation for the flagged users");
        println!("2. Check worker logs for failed expiration sweeps");
        println!("3. Review unresolved webhook events for missed grants");
    }

    Ok(())
}
