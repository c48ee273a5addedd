//! Service pollers.
//!
//! A [`ServicePoller`] wraps one remote service and performs a single poll
//! per call. The daemon runs pollers as external executables
//! ([`CommandPoller`]); tests and embedders can register in-process ones.

mod command;
mod error;
mod poller;
mod state;

pub use command::{
    CommandPluginConfig, CommandPoller, DEFAULT_PLUGIN_RUNTIME, ERR_AUTH_FAILED, ERR_INVALID_AUTH,
    ERR_NETWORK,
};
pub use error::{ErrorClass, PollError};
pub use poller::{PollerFactory, PollerRegistry, ServicePoller};
pub use state::FileStateStore;
