//! Actor that owns one [`AccountSupervisor`].
//!
//! Messages are handled one at a time, so poll cycles of an account never
//! overlap. Cancellation is only observed between messages: a cycle that
//! has started always runs to completion or to its poll timeout.
//!
//! Published credentials are applied while idle and again right before each
//! message, so a cycle always sees the newest ones.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::handle::{AccountHandle, ActorMetadata};
use super::messages::AccountMessage;
use crate::accounts::{AccountCredentials, AccountKey};
use crate::scheduler::account::AccountSupervisor;

/// Priority mailbox capacity. Only `Stop` uses it.
const PRIORITY_MAILBOX_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorOutcome {
    /// Received `Stop` or every handle was dropped.
    Stopped,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ActorError {
    pub message: String,
}

impl ActorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActorError {}

pub type ActorResult = Result<ActorOutcome, ActorError>;

pub struct AccountActor {
    supervisor: AccountSupervisor,
    mailbox: mpsc::Receiver<AccountMessage>,
    priority_mailbox: mpsc::Receiver<AccountMessage>,
    credentials: watch::Receiver<Option<AccountCredentials>>,
    cycle_queued: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
    metadata: ActorMetadata,
}

impl AccountActor {
    /// Create an actor and its handle.
    pub fn new(
        supervisor: AccountSupervisor,
        generation: u64,
        mailbox_capacity: usize,
        cancellation_token: CancellationToken,
    ) -> (Self, AccountHandle) {
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let (priority_tx, priority_rx) = mpsc::channel(PRIORITY_MAILBOX_CAPACITY);
        let (credentials_tx, credentials_rx) = watch::channel(None);
        let cycle_queued = Arc::new(AtomicBool::new(false));
        let metadata = ActorMetadata::new(supervisor.key().clone(), generation);
        let handle = AccountHandle::new(
            tx,
            priority_tx,
            credentials_tx,
            Arc::clone(&cycle_queued),
            cancellation_token.clone(),
            supervisor.subscribe(),
            metadata.clone(),
        );

        let actor = Self {
            supervisor,
            mailbox: rx,
            priority_mailbox: priority_rx,
            credentials: credentials_rx,
            cycle_queued,
            cancellation_token,
            metadata,
        };
        (actor, handle)
    }

    pub fn key(&self) -> &AccountKey {
        &self.metadata.key
    }

    pub fn generation(&self) -> u64 {
        self.metadata.generation
    }

    pub async fn run(mut self) -> ActorResult {
        debug!(account = %self.metadata.key, generation = self.metadata.generation, "Account actor starting");

        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!(account = %self.metadata.key, "Account actor cancelled");
                    return Ok(ActorOutcome::Cancelled);
                }

                Some(msg) = self.priority_mailbox.recv() => {
                    if self.handle_message(msg).await {
                        break;
                    }
                }

                Ok(()) = self.credentials.changed() => {
                    self.apply_credentials();
                }

                msg = self.mailbox.recv() => {
                    match msg {
                        Some(msg) => {
                            if self.handle_message(msg).await {
                                break;
                            }
                        }
                        None => {
                            debug!(account = %self.metadata.key, "All handles dropped");
                            break;
                        }
                    }
                }
            }
        }

        debug!(
            account = %self.metadata.key,
            uptime = ?self.metadata.uptime(),
            "Account actor stopped"
        );
        Ok(ActorOutcome::Stopped)
    }

    fn apply_credentials(&mut self) {
        let latest = self.credentials.borrow_and_update().clone();
        if let Some(credentials) = latest {
            self.supervisor.update_credentials(credentials);
        }
    }

    /// Returns `true` when the actor should stop.
    async fn handle_message(&mut self, msg: AccountMessage) -> bool {
        trace!(account = %self.metadata.key, message = msg.name(), "Handling message");
        if let AccountMessage::RunCycle { triggered: true, .. } = &msg {
            // Release before reading credentials so a later update queues a new cycle.
            self.cycle_queued.store(false, Ordering::SeqCst);
        }
        if self.credentials.has_changed().unwrap_or(false) {
            self.apply_credentials();
        }

        match msg {
            AccountMessage::RunCycle { bootstrap, done, .. } => {
                let outcome = self.supervisor.run_cycle(bootstrap).await;
                if let Some(done) = done {
                    let _ = done.send(outcome);
                }
                false
            }
            AccountMessage::GetState(reply) => {
                let _ = reply.send(self.supervisor.snapshot());
                false
            }
            AccountMessage::Stop => true,
        }
    }
}
