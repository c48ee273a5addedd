//! Poll scheduling.
//!
//! - [`AccountSupervisor`] runs the poll and penalty state machine of one
//!   account.
//! - [`AccountActor`] owns a supervisor and serializes every call to it.
//! - [`Coordinator`] maps accounts to actors, reacts to credential events and
//!   drives bulk poll cycles.
//! - [`PollBus`] is the external "poll now" trigger.

mod account;
pub mod actor;
mod penalty;
mod pollbus;
mod service;

pub use account::{
    AccountSupervisor, CycleOutcome, DEFAULT_BOOTSTRAP_POLL_TIMEOUT, DEFAULT_POLL_TIMEOUT,
    SupervisorConfig, SupervisorContext, SupervisorSnapshot, SupervisorState,
};
pub use actor::{
    AccountActor, AccountHandle, AccountMessage, AccountRegistry, ActorOutcome, SendError,
};
pub use penalty::{
    AuthEscalation, DEFAULT_AUTH_FAILURE_PENALTY, DEFAULT_AUTH_TRIES_UNTIL_PENALTY,
    DEFAULT_MAX_PENALTY, PenaltyConfig, PenaltyTracker,
};
pub use pollbus::{DEFAULT_POLL_QUEUE_CAPACITY, PollBus, PollRequest};
pub use service::{
    BulkPollReport, Coordinator, CoordinatorConfig, DEFAULT_SHUTDOWN_TIMEOUT, ShutdownReport,
};
