// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Tutorly API Library
//!
//! HTTP surface for enrollment checkout, Stripe webhooks and account flows.

pub mod accounts;
pub mod config;
pub mod email;
pub mod error;
pub mod routes;
pub mod state;

pub use accounts::{AccountError, AccountService};
pub use config::{Config, ConfigError};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
