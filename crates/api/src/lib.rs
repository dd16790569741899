// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Swapdeck API
//!
//! HTTP surface over the credit ledger: balance and history reads, the
//! face swap endpoint, and the Stripe payment webhook.

pub mod auth;
pub mod config;
pub mod error;
pub mod faceswap;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
