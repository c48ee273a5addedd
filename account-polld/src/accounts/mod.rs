//! Account identity and credential types.
//!
//! The credential feed itself lives outside the daemon. It is represented
//! here by the values it emits ([`AccountCredentials`]) and the single
//! operation it accepts ([`RefreshRequester`]).

mod refresh;
mod types;

pub use refresh::{ChannelRefresher, RefreshRequest, RefreshRequester};
pub use types::{AccountCredentials, AccountId, AccountKey, AuthFault, AuthTokens};
