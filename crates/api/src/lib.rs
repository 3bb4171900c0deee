// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! RegDesk API Library
//!
//! HTTP surface over the billing engine: usage checks for the registration path and
//! the upgrade, cancellation and coupon endpoints the billing dashboard calls.
//! Authentication happens upstream; handlers trust the org and user ids they receive.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
