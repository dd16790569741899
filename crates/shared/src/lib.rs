// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Swapdeck Shared Types and Utilities
//!
//! This crate contains types and database utilities shared across the
//! Swapdeck platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
