//! Stratum Pool
//!
//! A mining pool backend built around a Stratum v1 server:
//! - Connection reactor and per-session protocol dispatch
//! - Block-template jobs for Bitcoin and Equihash coin families
//! - Share validation with duplicate detection and vardiff
//! - PROP and PPLNS round accounting
//! - Block submission and maturity tracking

pub mod block;
pub mod chain;
pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod job;
pub mod logging;
pub mod pool;
pub mod round;
pub mod share;
pub mod stats;
pub mod store;
pub mod stratum;
pub mod types;
pub mod utils;
pub mod vardiff;

pub use config::Config;
pub use error::{Error, Result};
pub use pool::Pool;
pub use types::*;

/// Application information
pub const APP_NAME: &str = "stratum-pool";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
