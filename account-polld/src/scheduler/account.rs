//! Per-account poll supervisor.
//!
//! An [`AccountSupervisor`] holds one account's credentials and penalty
//! counters and decides, once per poll opportunity, whether to poll, how long
//! to wait, and what to do with the result. It is driven by an
//! [`AccountActor`](super::actor::AccountActor), which serializes all calls.
//!
//! At most one poll runs per account. The poll itself executes on its own
//! task holding the account's poll gate; if the supervisor stops waiting
//! (timeout) the task keeps the gate until it finishes and its result is
//! dropped with the task.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use super::actor::DEFAULT_MAILBOX_CAPACITY;
use super::penalty::{AuthEscalation, PenaltyConfig, PenaltyTracker};
use crate::accounts::{AccountCredentials, AccountKey, AuthFault, RefreshRequester};
use crate::notification::{ApplicationId, Delivery, NotificationSink, PushMessageBatch};
use crate::plugins::{ErrorClass, PollError, ServicePoller};

/// Default deadline for a steady-state poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for the first poll after an account appears.
pub const DEFAULT_BOOTSTRAP_POLL_TIMEOUT: Duration = Duration::from_secs(4 * 60);

/// Configuration shared by all account supervisors.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_timeout: Duration,
    pub bootstrap_poll_timeout: Duration,
    pub penalty: PenaltyConfig,
    /// Mailbox capacity of each account actor.
    pub mailbox_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            bootstrap_poll_timeout: DEFAULT_BOOTSTRAP_POLL_TIMEOUT,
            penalty: PenaltyConfig::default(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// No enabled credentials seen yet.
    AwaitingCredentials,
    Idle,
    /// Idle, with penalty cycles to skip.
    Penalized,
    Polling,
    /// Credentials are disabled, by the feed or while awaiting a refresh.
    Disabled,
}

/// Point-in-time view of a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorSnapshot {
    pub key: AccountKey,
    pub state: SupervisorState,
    pub penalty_count: u32,
    pub auth_failures: u32,
    pub credentials_enabled: bool,
    /// A refresh was requested and no new credentials have arrived yet.
    pub awaiting_refresh: bool,
    pub cycles: u64,
}

/// How a single poll cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    NoCredentials,
    PenaltySkip { remaining: u32 },
    /// A previously abandoned poll still holds the poll gate.
    PollStillRunning,
    TimedOut,
    Delivered { batches: usize, messages: usize },
    Failed(ErrorClass),
}

impl CycleOutcome {
    /// Whether the service poller was invoked.
    pub fn polled(&self) -> bool {
        matches!(
            self,
            Self::TimedOut | Self::Delivered { .. } | Self::Failed(_)
        )
    }
}

/// Collaborators shared by every supervisor of a coordinator.
#[derive(Clone)]
pub struct SupervisorContext {
    pub sink: Arc<dyn NotificationSink>,
    pub refresher: Arc<dyn RefreshRequester>,
}

enum PollAttempt {
    Finished(Result<Vec<PushMessageBatch>, PollError>),
    Busy,
    TimedOut(Duration),
}

pub struct AccountSupervisor {
    key: AccountKey,
    application_id: ApplicationId,
    credentials: Option<AccountCredentials>,
    /// Credentials arrived since the last cycle.
    fresh: bool,
    /// The pending credentials answer our own refresh request.
    answers_refresh: bool,
    awaiting_refresh: bool,
    penalty: PenaltyTracker,
    state: SupervisorState,
    cycles: u64,
    poller: Arc<dyn ServicePoller>,
    poll_gate: Arc<Semaphore>,
    context: SupervisorContext,
    config: SupervisorConfig,
    snapshot_tx: watch::Sender<SupervisorSnapshot>,
}

impl AccountSupervisor {
    /// Create a supervisor. `poll_gate` must be the single-permit semaphore
    /// shared by every supervisor ever created for `key`.
    pub fn new(
        key: AccountKey,
        application_id: ApplicationId,
        poller: Arc<dyn ServicePoller>,
        poll_gate: Arc<Semaphore>,
        context: SupervisorContext,
        config: SupervisorConfig,
    ) -> Self {
        let initial = SupervisorSnapshot {
            key: key.clone(),
            state: SupervisorState::AwaitingCredentials,
            penalty_count: 0,
            auth_failures: 0,
            credentials_enabled: false,
            awaiting_refresh: false,
            cycles: 0,
        };
        let (snapshot_tx, _) = watch::channel(initial);

        Self {
            key,
            application_id,
            credentials: None,
            fresh: false,
            answers_refresh: false,
            awaiting_refresh: false,
            penalty: PenaltyTracker::with_config(config.penalty),
            state: SupervisorState::AwaitingCredentials,
            cycles: 0,
            poller,
            poll_gate,
            context,
            config,
            snapshot_tx,
        }
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn credentials(&self) -> Option<&AccountCredentials> {
        self.credentials.as_ref()
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            key: self.key.clone(),
            state: self.state,
            penalty_count: self.penalty.penalty_count(),
            auth_failures: self.penalty.auth_failures(),
            credentials_enabled: self.credentials.as_ref().is_some_and(|c| c.enabled),
            awaiting_refresh: self.awaiting_refresh,
            cycles: self.cycles,
        }
    }

    /// Receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Replace the held credentials.
    pub fn update_credentials(&mut self, credentials: AccountCredentials) {
        if credentials.key() != self.key {
            warn!(account = %self.key, other = %credentials.key(), "Ignoring credentials for another account");
            return;
        }

        if !credentials.enabled {
            info!(account = %self.key, "Account no longer enabled");
            self.credentials = Some(credentials);
            self.fresh = false;
            self.answers_refresh = false;
            self.awaiting_refresh = false;
            self.set_state(SupervisorState::Disabled);
            return;
        }

        let redelivered = self.awaiting_refresh
            && self
                .credentials
                .as_ref()
                .is_some_and(|held| held.auth == credentials.auth);
        if redelivered {
            debug!(account = %self.key, "Expired credentials delivered again, still waiting for refresh");
            return;
        }

        if let Some(fault) = &credentials.error {
            debug!(account = %self.key, "Credentials delivered with fault: {}", fault);
        }
        self.answers_refresh = std::mem::take(&mut self.awaiting_refresh);
        self.fresh = true;
        if self.penalty.is_penalized() {
            debug!(account = %self.key, "New credentials, clearing penalty");
            self.penalty.clear_penalty();
        }
        self.credentials = Some(credentials);
        self.settle();
    }

    /// Run one poll opportunity.
    pub async fn run_cycle(&mut self, bootstrap: bool) -> CycleOutcome {
        self.cycles += 1;
        info!(account = %self.key, bootstrap, "Starting poll cycle");

        let outcome = self.cycle(bootstrap).await;
        self.settle();

        info!(
            account = %self.key,
            ?outcome,
            penalty = self.penalty.penalty_count(),
            auth_failures = self.penalty.auth_failures(),
            "Ending poll cycle"
        );
        outcome
    }

    async fn cycle(&mut self, bootstrap: bool) -> CycleOutcome {
        let Some(credentials) = self.credentials.as_mut().filter(|c| c.enabled) else {
            info!(account = %self.key, "No enabled credentials, nothing to poll");
            return CycleOutcome::NoCredentials;
        };

        let fresh = std::mem::take(&mut self.fresh);
        let answers_refresh = std::mem::take(&mut self.answers_refresh);

        if let Some(remaining) = self.penalty.take_penalty_cycle() {
            info!(account = %self.key, remaining, "Skipping poll while penalized");
            return CycleOutcome::PenaltySkip { remaining };
        }

        if !fresh && let Some(fault) = credentials.error.take() {
            info!(account = %self.key, "Retrying account with previous fault: {}", fault);
        }
        let credentials = credentials.clone();

        let result = match credentials.error.clone() {
            Some(fault) => {
                warn!(account = %self.key, "Account failed to authenticate: {}", fault);
                Err(PollError::AlreadyReported(fault))
            }
            None => match self.poll(credentials, bootstrap).await {
                PollAttempt::Finished(result) => result,
                PollAttempt::Busy => {
                    let penalty = self.penalty.record_timeout();
                    warn!(account = %self.key, penalty, "Previous poll is still running");
                    return CycleOutcome::PollStillRunning;
                }
                PollAttempt::TimedOut(timeout) => {
                    let penalty = self.penalty.record_timeout();
                    warn!(account = %self.key, penalty, "Poll timed out after {:?}", timeout);
                    return CycleOutcome::TimedOut;
                }
            },
        };

        match result {
            Ok(batches) => self.on_success(batches).await,
            Err(e) => self.on_failure(e, answers_refresh),
        }
    }

    async fn poll(&mut self, credentials: AccountCredentials, bootstrap: bool) -> PollAttempt {
        let Ok(permit) = Arc::clone(&self.poll_gate).try_acquire_owned() else {
            return PollAttempt::Busy;
        };
        let timeout = if bootstrap {
            self.config.bootstrap_poll_timeout
        } else {
            self.config.poll_timeout
        };

        self.set_state(SupervisorState::Polling);
        let poller = Arc::clone(&self.poller);
        let task = tokio::spawn(async move {
            let _permit = permit;
            poller.poll(&credentials).await
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => PollAttempt::Finished(result),
            Ok(Err(e)) => PollAttempt::Finished(Err(PollError::Crashed(e.to_string()))),
            Err(_) => PollAttempt::TimedOut(timeout),
        }
    }

    async fn on_success(&mut self, batches: Vec<PushMessageBatch>) -> CycleOutcome {
        self.penalty.record_success();

        let batches: Vec<PushMessageBatch> = batches.into_iter().filter(|b| !b.is_empty()).collect();
        for batch in &batches {
            debug!(account = %self.key, tag = %batch.tag, count = batch.len(), "Updates to report");
        }
        let outcome = CycleOutcome::Delivered {
            batches: batches.len(),
            messages: batches.iter().map(PushMessageBatch::len).sum(),
        };
        info!(account = %self.key, "Poll was successful");

        if !batches.is_empty() {
            let delivery = Delivery {
                application_id: self.application_id.clone(),
                account_id: self.key.account_id,
                batches,
            };
            if let Err(e) = self.context.sink.deliver(delivery).await {
                warn!(account = %self.key, "Failed to forward notifications: {}", e);
            }
        }
        outcome
    }

    fn on_failure(&mut self, error: PollError, answers_refresh: bool) -> CycleOutcome {
        let class = error.class();
        match &error {
            PollError::AlreadyReported(_) => {}
            PollError::Crashed(_) => error!(account = %self.key, "Poll failed: {}", error),
            _ => warn!(account = %self.key, "Poll failed: {}", error),
        }

        if !class.is_auth() {
            self.penalty.record_transient_failure();
            return CycleOutcome::Failed(class);
        }

        match self.penalty.record_auth_failure() {
            AuthEscalation::Penalized(penalty) => {
                info!(account = %self.key, penalty, "Authentication keeps failing, backing off");
            }
            AuthEscalation::Counted(_) if class == ErrorClass::TokenExpired => {
                if answers_refresh {
                    warn!(account = %self.key, "Refreshed credentials are already expired");
                } else {
                    self.request_refresh();
                }
            }
            AuthEscalation::Counted(_) => {}
        }
        CycleOutcome::Failed(class)
    }

    fn request_refresh(&mut self) {
        if let Some(credentials) = self.credentials.as_mut() {
            credentials.enabled = false;
            credentials.error = Some(AuthFault::TokenExpired);
        }
        self.awaiting_refresh = true;
        self.context
            .refresher
            .request_refresh(self.key.account_id, &self.key.service_name);
        info!(account = %self.key, "Token expired, requested credential refresh");
    }

    fn settle(&mut self) {
        let state = match &self.credentials {
            None => SupervisorState::AwaitingCredentials,
            Some(c) if !c.enabled => SupervisorState::Disabled,
            Some(_) if self.penalty.is_penalized() => SupervisorState::Penalized,
            Some(_) => SupervisorState::Idle,
        };
        self.set_state(state);
    }

    fn set_state(&mut self, state: SupervisorState) {
        self.state = state;
        self.snapshot_tx.send_replace(self.snapshot());
    }
}
