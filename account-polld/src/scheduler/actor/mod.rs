//! Account actors.
//!
//! - `AccountActor`: owns one supervisor and handles its mailbox in order
//! - `AccountHandle`: cloneable sender side, with a snapshot receiver
//! - `AccountRegistry`: live actors, their tasks, and the per-account poll gates

mod account_actor;
mod handle;
mod messages;
mod registry;

pub use account_actor::{AccountActor, ActorError, ActorOutcome, ActorResult};
pub use handle::{
    AccountHandle, ActorMetadata, DEFAULT_MAILBOX_CAPACITY, DEFAULT_SEND_TIMEOUT, SendError,
};
pub use messages::AccountMessage;
pub use registry::{AccountRegistry, ActorTaskResult, RegistryError};
