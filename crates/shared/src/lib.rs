#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! RegDesk Shared
//!
//! Domain enums used by every crate and the Postgres plumbing (pool creation and
//! migrations) the binaries share.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{ParseEnumError, PlanTier, SubscriptionStatus};
