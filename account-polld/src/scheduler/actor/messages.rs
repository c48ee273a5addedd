//! Messages accepted by account actors.
//!
//! Credentials do not travel through the mailbox. They are published on the
//! handle's latest-value slot and applied before the next message.

use tokio::sync::oneshot;

use crate::scheduler::account::{CycleOutcome, SupervisorSnapshot};

#[derive(Debug)]
pub enum AccountMessage {
    /// Run one poll cycle. `done` receives the outcome when it ends.
    RunCycle {
        bootstrap: bool,
        /// Started by a credential trigger; releases the handle's queued flag.
        triggered: bool,
        done: Option<oneshot::Sender<CycleOutcome>>,
    },
    GetState(oneshot::Sender<SupervisorSnapshot>),
    /// Finish the current message and exit.
    Stop,
}

impl AccountMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunCycle { .. } => "RunCycle",
            Self::GetState(_) => "GetState",
            Self::Stop => "Stop",
        }
    }
}
