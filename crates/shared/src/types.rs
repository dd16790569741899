//! Common types used across Swapdeck

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Credits granted to a brand-new user on first balance access
pub const INITIAL_CREDIT_GRANT: i32 = 5;

// =============================================================================
// Enums
// =============================================================================

/// Kind of balance-affecting event recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// First-access welcome grant
    Initial,
    /// Paid top-up (one-time payment)
    Recharge,
    /// Promotional or goodwill grant
    Bonus,
    /// Credits granted for a subscription billing period
    Subscription,
    /// Credits spent on a face swap
    Consumption,
    /// Unused subscription credits removed at period end
    Expiration,
    /// Credits returned after a failed delivery
    Refund,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Recharge => write!(f, "recharge"),
            Self::Bonus => write!(f, "bonus"),
            Self::Subscription => write!(f, "subscription"),
            Self::Consumption => write!(f, "consumption"),
            Self::Expiration => write!(f, "expiration"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initial" => Ok(Self::Initial),
            "recharge" => Ok(Self::Recharge),
            "bonus" => Ok(Self::Bonus),
            "subscription" => Ok(Self::Subscription),
            "consumption" => Ok(Self::Consumption),
            "expiration" => Ok(Self::Expiration),
            "refund" => Ok(Self::Refund),
            _ => Err(format!("Invalid transaction type: {}", s)),
        }
    }
}

/// Lifecycle state of a subscription credit period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionCreditStatus {
    /// Within the validity window, remaining credits spendable
    Active,
    /// Validity window passed, remainder zeroed by the expiration sweep
    Expired,
    /// Subscription ended or replaced before the window closed
    Cancelled,
}

impl std::fmt::Display for SubscriptionCreditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for SubscriptionCreditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid subscription credit status: {}", s)),
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// Per-user balance row
///
/// `wallet_balance` is the authoritative non-expiring component (recharges,
/// bonuses, refunds, the initial grant). `balance` caches the spendable total
/// (wallet + active subscription remainders) and is refreshed inside every
/// mutating transaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserBalance {
    pub user_id: Uuid,
    pub wallet_balance: i32,
    pub balance: i32,
    pub total_recharged: i32,
    pub total_consumed: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Append-only ledger entry, one per balance-affecting event
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Signed: positive = credit, negative = debit
    pub amount: i32,
    pub transaction_type: TransactionType,
    pub description: String,
    /// Total spendable balance immediately after this transaction applied
    pub balance_after: i32,
    pub related_subscription_id: Option<String>,
    /// Free-form bag; carries idempotency keys (`payment_ref`) and the
    /// subscription/wallet consumption split
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Credits granted for one subscription billing period
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionCredit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: String,
    pub credits: i32,
    pub remaining_credits: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub status: SubscriptionCreditStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionCredit {
    /// Whether this period can still be drained at `now`
    pub fn is_spendable(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionCreditStatus::Active
            && self.period_end > now
            && self.remaining_credits > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use time::Duration;

    #[test]
    fn test_transaction_type_round_trip() {
        for t in [
            TransactionType::Initial,
            TransactionType::Recharge,
            TransactionType::Bonus,
            TransactionType::Subscription,
            TransactionType::Consumption,
            TransactionType::Expiration,
            TransactionType::Refund,
        ] {
            assert_eq!(TransactionType::from_str(&t.to_string()), Ok(t));
        }
    }

    #[test]
    fn test_transaction_type_rejects_unknown() {
        assert!(TransactionType::from_str("chargeback").is_err());
    }

    #[test]
    fn test_subscription_credit_status_display() {
        assert_eq!(SubscriptionCreditStatus::Active.to_string(), "active");
        assert_eq!(SubscriptionCreditStatus::Expired.to_string(), "expired");
        assert_eq!(SubscriptionCreditStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_is_spendable() {
        let now = OffsetDateTime::now_utc();
        let credit = SubscriptionCredit {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            subscription_id: "sub_123".to_string(),
            credits: 120,
            remaining_credits: 40,
            period_start: now - Duration::days(10),
            period_end: now + Duration::days(20),
            status: SubscriptionCreditStatus::Active,
            created_at: now,
            updated_at: now,
        };
        assert!(credit.is_spendable(now));

        let expired = SubscriptionCredit {
            period_end: now - Duration::days(1),
            ..credit.clone()
        };
        assert!(!expired.is_spendable(now));

        let drained = SubscriptionCredit {
            remaining_credits: 0,
            ..credit
        };
        assert!(!drained.is_spendable(now));
    }
}
