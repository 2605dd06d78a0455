// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ClipVault Shared Library
//!
//! Common types and database helpers used across the ClipVault crates.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{
    Feature, Limit, PaginatedResponse, Period, Subscription, SubscriptionStatus, SubscriptionTier,
    UsageEvent, UsageEventType, UsageRecord, UserId,
};
