//! account-polld library crate.
//!
//! Polls linked online accounts on behalf of the platform notification
//! service. Each account is run by its own supervisor actor; a single
//! coordinator maps credential events to supervisors and drives bulk poll
//! cycles.

pub mod accounts;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod notification;
pub mod panic_hook;
pub mod plugins;
pub mod scheduler;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Error, Result};
