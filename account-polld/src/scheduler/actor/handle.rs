//! Handle for sending messages to an account actor.
//!
//! Sends use a `try_send` fast path and fall back to waiting for mailbox
//! space with a timeout. `Stop` travels on a separate priority channel so it
//! overtakes queued cycles.
//!
//! Credentials bypass the mailbox: [`AccountHandle::update_credentials`]
//! replaces the value in a watch slot and never waits. At most one triggered
//! cycle is queued per account; later triggers are absorbed by it because the
//! actor applies the newest credentials right before each message.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::messages::AccountMessage;
use crate::accounts::{AccountCredentials, AccountKey};
use crate::scheduler::account::{CycleOutcome, SupervisorSnapshot};

/// Default mailbox capacity for account actors.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Default timeout for send operations when the mailbox is full.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The actor has stopped and is no longer accepting messages.
    ActorStopped,
    /// The mailbox is full.
    MailboxFull,
    /// Waiting for mailbox space timed out.
    Timeout,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::ActorStopped => write!(f, "Actor has stopped"),
            SendError::MailboxFull => write!(f, "Mailbox is full"),
            SendError::Timeout => write!(f, "Send operation timed out"),
        }
    }
}

impl std::error::Error for SendError {}

#[derive(Debug, Clone)]
pub struct ActorMetadata {
    pub key: AccountKey,
    /// Distinguishes successive actors for the same account.
    pub generation: u64,
    pub spawned_at: Instant,
}

impl ActorMetadata {
    pub fn new(key: AccountKey, generation: u64) -> Self {
        Self {
            key,
            generation,
            spawned_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }
}

pub struct AccountHandle {
    sender: mpsc::Sender<AccountMessage>,
    priority_sender: mpsc::Sender<AccountMessage>,
    credentials: watch::Sender<Option<AccountCredentials>>,
    /// Set while a triggered cycle sits in the mailbox.
    cycle_queued: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
    snapshot: watch::Receiver<SupervisorSnapshot>,
    pub metadata: ActorMetadata,
}

impl AccountHandle {
    pub fn new(
        sender: mpsc::Sender<AccountMessage>,
        priority_sender: mpsc::Sender<AccountMessage>,
        credentials: watch::Sender<Option<AccountCredentials>>,
        cycle_queued: Arc<AtomicBool>,
        cancellation_token: CancellationToken,
        snapshot: watch::Receiver<SupervisorSnapshot>,
        metadata: ActorMetadata,
    ) -> Self {
        Self {
            sender,
            priority_sender,
            credentials,
            cycle_queued,
            cancellation_token,
            snapshot,
            metadata,
        }
    }

    pub async fn send(&self, msg: AccountMessage) -> Result<(), SendError> {
        self.send_with_timeout(msg, DEFAULT_SEND_TIMEOUT).await
    }

    pub async fn send_with_timeout(
        &self,
        msg: AccountMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        Self::send_on(&self.sender, msg, timeout).await
    }

    /// Send on the priority channel.
    pub async fn send_priority(&self, msg: AccountMessage) -> Result<(), SendError> {
        Self::send_on(&self.priority_sender, msg, DEFAULT_SEND_TIMEOUT).await
    }

    async fn send_on(
        sender: &mpsc::Sender<AccountMessage>,
        msg: AccountMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                match tokio::time::timeout(timeout, sender.reserve()).await {
                    Ok(Ok(permit)) => {
                        permit.send(msg);
                        Ok(())
                    }
                    Ok(Err(_)) => Err(SendError::ActorStopped),
                    Err(_) => Err(SendError::Timeout),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::ActorStopped),
        }
    }

    pub fn try_send(&self, msg: AccountMessage) -> Result<(), SendError> {
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::MailboxFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::ActorStopped),
        }
    }

    /// Publish new credentials. Credentials the actor has not applied yet
    /// are replaced.
    pub fn update_credentials(&self, credentials: AccountCredentials) -> Result<(), SendError> {
        if self.sender.is_closed() {
            return Err(SendError::ActorStopped);
        }
        self.credentials.send_replace(Some(credentials));
        Ok(())
    }

    /// Claim the account's triggered-cycle slot.
    ///
    /// Returns `false` when a triggered cycle is already queued; that cycle
    /// will run with the newest credentials.
    pub fn claim_cycle(&self) -> bool {
        !self.cycle_queued.swap(true, Ordering::SeqCst)
    }

    pub fn cycle_queued(&self) -> bool {
        self.cycle_queued.load(Ordering::SeqCst)
    }

    /// Queue the cycle claimed with [`claim_cycle`](Self::claim_cycle) and
    /// wait for it to end.
    ///
    /// Waits for mailbox space without a deadline; only one claimed cycle
    /// per account can be waiting. The claim is released if the actor is
    /// gone.
    pub async fn run_claimed_cycle(&self, bootstrap: bool) -> Result<CycleOutcome, SendError> {
        let (tx, rx) = oneshot::channel();
        let msg = AccountMessage::RunCycle {
            bootstrap,
            triggered: true,
            done: Some(tx),
        };
        if self.sender.send(msg).await.is_err() {
            self.cycle_queued.store(false, Ordering::SeqCst);
            return Err(SendError::ActorStopped);
        }
        rx.await.map_err(|_| SendError::ActorStopped)
    }

    /// Queue a poll cycle and wait for it to end.
    ///
    /// The wait has no deadline of its own: the cycle is bounded by the
    /// supervisor's poll timeout. If the actor exits before running the
    /// cycle the result is `ActorStopped`.
    pub async fn run_cycle(&self, bootstrap: bool) -> Result<CycleOutcome, SendError> {
        let (tx, rx) = oneshot::channel();
        self.send(AccountMessage::RunCycle {
            bootstrap,
            triggered: false,
            done: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| SendError::ActorStopped)
    }

    /// Ask the actor for its current snapshot.
    pub async fn get_state(&self) -> Result<SupervisorSnapshot, SendError> {
        let (tx, rx) = oneshot::channel();
        self.send(AccountMessage::GetState(tx)).await?;
        rx.await.map_err(|_| SendError::ActorStopped)
    }

    /// Latest published snapshot, without a round trip.
    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.snapshot.clone()
    }

    pub fn mailbox_capacity(&self) -> (usize, usize) {
        (self.sender.capacity(), self.sender.max_capacity())
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn key(&self) -> &AccountKey {
        &self.metadata.key
    }

    pub fn generation(&self) -> u64 {
        self.metadata.generation
    }
}

impl Clone for AccountHandle {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            priority_sender: self.priority_sender.clone(),
            credentials: self.credentials.clone(),
            cycle_queued: Arc::clone(&self.cycle_queued),
            cancellation_token: self.cancellation_token.clone(),
            snapshot: self.snapshot.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Debug for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountHandle")
            .field("metadata", &self.metadata)
            .field("capacity", &self.mailbox_capacity())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::account::SupervisorState;

    struct Parts {
        handle: AccountHandle,
        rx: mpsc::Receiver<AccountMessage>,
        prx: mpsc::Receiver<AccountMessage>,
        credentials: watch::Receiver<Option<AccountCredentials>>,
    }

    fn handle(capacity: usize) -> Parts {
        let key = AccountKey::new("mail", 1);
        let (tx, rx) = mpsc::channel(capacity);
        let (ptx, prx) = mpsc::channel(1);
        let (credentials_tx, credentials) = watch::channel(None);
        let (_snapshot_tx, snapshot_rx) = watch::channel(SupervisorSnapshot {
            key: key.clone(),
            state: SupervisorState::AwaitingCredentials,
            penalty_count: 0,
            auth_failures: 0,
            credentials_enabled: false,
            awaiting_refresh: false,
            cycles: 0,
        });
        let handle = AccountHandle::new(
            tx,
            ptx,
            credentials_tx,
            Arc::new(AtomicBool::new(false)),
            CancellationToken::new(),
            snapshot_rx,
            ActorMetadata::new(key, 7),
        );
        Parts {
            handle,
            rx,
            prx,
            credentials,
        }
    }

    #[tokio::test]
    async fn test_mailbox_full() {
        let Parts { handle, rx: _rx, .. } = handle(1);

        handle.try_send(AccountMessage::Stop).unwrap();
        assert_eq!(handle.try_send(AccountMessage::Stop), Err(SendError::MailboxFull));
        assert_eq!(
            handle
                .send_with_timeout(AccountMessage::Stop, Duration::from_millis(10))
                .await,
            Err(SendError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_stopped_actor() {
        let Parts { handle, rx, .. } = handle(4);
        drop(rx);

        assert_eq!(handle.send(AccountMessage::Stop).await, Err(SendError::ActorStopped));
        assert_eq!(handle.run_cycle(false).await, Err(SendError::ActorStopped));
        assert_eq!(
            handle.update_credentials(AccountCredentials::disabled("mail", 1)),
            Err(SendError::ActorStopped)
        );
    }

    #[tokio::test]
    async fn test_dropped_cycle_reply_reads_as_stopped() {
        let Parts { handle, mut rx, .. } = handle(4);
        let waiter = tokio::spawn(async move { handle.run_cycle(true).await });

        match rx.recv().await.unwrap() {
            AccountMessage::RunCycle {
                bootstrap,
                triggered,
                done,
            } => {
                assert!(bootstrap);
                assert!(!triggered);
                drop(done);
            }
            other => panic!("unexpected {}", other.name()),
        }
        assert_eq!(waiter.await.unwrap(), Err(SendError::ActorStopped));
    }

    #[tokio::test]
    async fn test_priority_channel_is_separate() {
        let Parts {
            handle,
            mut rx,
            mut prx,
            ..
        } = handle(4);

        handle.try_send(AccountMessage::Stop).unwrap();
        handle.send_priority(AccountMessage::Stop).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "Stop");
        assert_eq!(prx.recv().await.unwrap().name(), "Stop");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_credentials_skip_a_full_mailbox() {
        let Parts {
            handle,
            rx: _rx,
            mut credentials,
            ..
        } = handle(1);
        handle.try_send(AccountMessage::Stop).unwrap();

        for token in ["t1", "t2", "t3"] {
            let mut update = AccountCredentials::enabled("mail", 1, Default::default());
            update.auth.access_token = token.into();
            handle.update_credentials(update).unwrap();
        }

        assert!(credentials.has_changed().unwrap());
        let latest = credentials.borrow_and_update().clone().unwrap();
        assert_eq!(latest.auth.access_token, "t3");
    }

    #[tokio::test]
    async fn test_triggered_cycle_is_claimed_once() {
        let Parts { handle, mut rx, .. } = handle(4);

        assert!(handle.claim_cycle());
        assert!(!handle.claim_cycle());
        assert!(!handle.clone().claim_cycle());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.run_claimed_cycle(false).await })
        };
        match rx.recv().await.unwrap() {
            AccountMessage::RunCycle { triggered, .. } => assert!(triggered),
            other => panic!("unexpected {}", other.name()),
        }
        // Held until an actor starts the cycle.
        assert!(handle.cycle_queued());
        assert_eq!(waiter.await.unwrap(), Err(SendError::ActorStopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_cycle_waits_for_mailbox_space() {
        let Parts { handle, mut rx, .. } = handle(1);
        handle.try_send(AccountMessage::Stop).unwrap();

        assert!(handle.claim_cycle());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.run_claimed_cycle(false).await })
        };
        tokio::time::sleep(DEFAULT_SEND_TIMEOUT * 5).await;
        assert!(!waiter.is_finished());

        assert_eq!(rx.recv().await.unwrap().name(), "Stop");
        match rx.recv().await.unwrap() {
            AccountMessage::RunCycle { triggered, done, .. } => {
                assert!(triggered);
                done.unwrap().send(CycleOutcome::NoCredentials).unwrap();
            }
            other => panic!("unexpected {}", other.name()),
        }
        assert_eq!(waiter.await.unwrap(), Ok(CycleOutcome::NoCredentials));
    }

    #[tokio::test]
    async fn test_failed_send_releases_claim() {
        let Parts { handle, rx, .. } = handle(4);
        drop(rx);

        assert!(handle.claim_cycle());
        assert_eq!(handle.run_claimed_cycle(false).await, Err(SendError::ActorStopped));
        assert!(!handle.cycle_queued());
        assert!(handle.claim_cycle());
    }

    #[test]
    fn test_metadata_and_snapshot() {
        let Parts { handle, .. } = handle(4);
        assert_eq!(handle.generation(), 7);
        assert_eq!(handle.key(), &AccountKey::new("mail", 1));
        assert_eq!(handle.snapshot().state, SupervisorState::AwaitingCredentials);

        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
