// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Swapdeck Credit Ledger
//!
//! The authoritative record of every credit a user holds and spends.
//!
//! ## Features
//!
//! - **Balances**: lazy-created per-user balance rows with a welcome grant
//! - **Consumption**: all-or-nothing debits, subscription credits drain
//!   soonest-to-expire first, then the wallet
//! - **Recharges**: one-time pack purchases, idempotent per payment reference
//! - **Subscriptions**: per-period credit grants that expire with the period
//! - **Webhooks**: Stripe event verification and ledger application
//! - **Invariants**: runnable consistency checks over the whole ledger

pub mod balance;
pub mod client;
pub mod consume;
pub mod customer;
pub mod error;
pub mod history;
pub mod invariants;
pub mod recharge;
pub mod subscription;
pub mod webhooks;

// Balance
pub use balance::{BalanceService, BalanceSummary};

// Client
pub use client::{CreditPacks, StripeClient, StripeConfig};

// Consume
pub use consume::{ConsumeOutcome, ConsumeService};

// Customer
pub use customer::{CustomerDirectory, ResolutionConfidence, ResolvedUser};

// Error
pub use error::{LedgerError, LedgerResult};

// History
pub use history::TransactionHistoryService;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Recharge
pub use recharge::{GrantReceipt, RechargeOutcome, RechargeService};

// Subscription
pub use subscription::{ExpireSweepResult, GrantOutcome, SubscriptionCreditService};

// Webhooks
pub use webhooks::{WebhookDisposition, WebhookHandler};
