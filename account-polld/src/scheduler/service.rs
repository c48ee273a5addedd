//! Fleet coordinator.
//!
//! The [`Coordinator`] owns the registry of account actors and is the only
//! code that mutates it. Credential events, bulk poll requests, the optional
//! periodic tick, and actor task completions are all handled on the single
//! loop in [`Coordinator::run`], in that priority order.
//!
//! # Cycle exclusion
//!
//! Cycles started by credential events are tracked in a `JoinSet`. A bulk
//! poll first drains that set, then runs one cycle per account and waits for
//! all of them before the loop picks up the next event. Each account actor
//! additionally processes its mailbox one message at a time, so no two cycles
//! of the same account ever overlap.
//!
//! Routing a credential event never waits on an actor: credentials go to the
//! handle's latest-value slot and at most one triggered cycle per account is
//! queued at a time.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::account::{
    AccountSupervisor, CycleOutcome, SupervisorConfig, SupervisorContext, SupervisorSnapshot,
};
use super::actor::{AccountActor, AccountHandle, AccountMessage, AccountRegistry, ActorTaskResult, SendError};
use super::pollbus::PollRequest;
use crate::accounts::{AccountCredentials, AccountKey, RefreshRequester};
use crate::notification::{ApplicationId, NotificationSink};
use crate::plugins::PollerFactory;

/// Default time actors get to stop before they are cancelled.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub supervisor: SupervisorConfig,
    /// Run a bulk cycle on this schedule in addition to external requests.
    pub poll_interval: Option<Duration>,
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            poll_interval: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Result of one bulk poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkPollReport {
    /// Accounts whose cycle ran to an outcome.
    pub polled: usize,
    /// Accounts skipped because a token refresh is outstanding.
    pub skipped_refreshing: usize,
    /// Accounts whose actor could not run the cycle.
    pub failed_to_dispatch: usize,
    pub delivered: usize,
    pub messages: usize,
    pub penalty_skips: usize,
    pub timed_out: usize,
    pub still_running: usize,
    pub failed: usize,
    pub auth_failures: usize,
    pub no_credentials: usize,
    pub duration_ms: u64,
}

impl BulkPollReport {
    fn record(&mut self, outcome: &CycleOutcome) {
        self.polled += 1;
        match outcome {
            CycleOutcome::NoCredentials => self.no_credentials += 1,
            CycleOutcome::PenaltySkip { .. } => self.penalty_skips += 1,
            CycleOutcome::PollStillRunning => self.still_running += 1,
            CycleOutcome::TimedOut => self.timed_out += 1,
            CycleOutcome::Delivered { messages, .. } => {
                self.delivered += 1;
                self.messages += messages;
            }
            CycleOutcome::Failed(class) => {
                self.failed += 1;
                if class.is_auth() {
                    self.auth_failures += 1;
                }
            }
        }
    }
}

/// Summary of a coordinator shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub total_actors: usize,
    pub graceful_stops: usize,
    pub forced_terminations: usize,
    pub stop_message_failures: usize,
}

impl ShutdownReport {
    pub fn all_graceful(&self) -> bool {
        self.forced_terminations == 0 && self.stop_message_failures == 0
    }
}

type CycleResult = (AccountKey, Result<CycleOutcome, SendError>);

pub struct Coordinator {
    registry: AccountRegistry,
    factory: Arc<dyn PollerFactory>,
    context: SupervisorContext,
    config: CoordinatorConfig,
    cancellation_token: CancellationToken,
    /// Cycles triggered by credential events.
    in_flight: JoinSet<CycleResult>,
}

impl Coordinator {
    pub fn new(
        factory: Arc<dyn PollerFactory>,
        sink: Arc<dyn NotificationSink>,
        refresher: Arc<dyn RefreshRequester>,
        config: CoordinatorConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            // Actors are stopped by `shutdown`, not by the coordinator's token.
            registry: AccountRegistry::new(CancellationToken::new()),
            factory,
            context: SupervisorContext { sink, refresher },
            config,
            cancellation_token,
            in_flight: JoinSet::new(),
        }
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn account_count(&self) -> usize {
        self.registry.len()
    }

    /// Latest snapshot of every registered account.
    pub fn snapshots(&self) -> Vec<SupervisorSnapshot> {
        let mut snapshots: Vec<_> = self.registry.handles().map(|(_, h)| h.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn snapshot(&self, key: &AccountKey) -> Option<SupervisorSnapshot> {
        self.registry.get(key).map(AccountHandle::snapshot)
    }

    /// Run until cancelled or until the credential feed closes, then shut
    /// every actor down.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<AccountCredentials>,
        poll_requests: mpsc::Receiver<PollRequest>,
    ) -> ShutdownReport {
        info!(interval = ?self.config.poll_interval, "Starting account coordinator");

        let mut poll_requests = Some(poll_requests);
        let mut ticker = self.config.poll_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!("Coordinator received cancellation signal");
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(credentials) => self.on_credential_event(credentials),
                        None => {
                            info!("Credential feed closed");
                            break;
                        }
                    }
                }

                request = async {
                    match &mut poll_requests {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match request {
                        Some(request) => {
                            let report = self.on_system_poll_request().await;
                            request.complete(report);
                        }
                        None => {
                            debug!("Poll request channel closed");
                            poll_requests = None;
                        }
                    }
                }

                _ = async {
                    match &mut ticker {
                        Some(ticker) => ticker.tick().await,
                        None => std::future::pending().await,
                    }
                } => {
                    debug!("Periodic poll");
                    self.on_system_poll_request().await;
                }

                Some(result) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    Self::log_cycle_result(result);
                }

                result = Self::join_next_if_pending(&mut self.registry) => {
                    if let Some(join_result) = result {
                        self.on_actor_finished(join_result);
                    }
                }
            }
        }

        if let Some(rx) = poll_requests.as_mut() {
            Self::answer_queued_polls(rx);
        }
        self.shutdown().await
    }

    /// Close the request queue and acknowledge what is still in it with an
    /// empty report.
    fn answer_queued_polls(rx: &mut mpsc::Receiver<PollRequest>) {
        rx.close();
        let mut answered = 0;
        while let Ok(request) = rx.try_recv() {
            request.complete(BulkPollReport::default());
            answered += 1;
        }
        if answered > 0 {
            info!("Answered {} queued poll requests without polling", answered);
        }
    }

    async fn join_next_if_pending(
        registry: &mut AccountRegistry,
    ) -> Option<std::result::Result<ActorTaskResult, tokio::task::JoinError>> {
        if registry.has_pending_tasks() {
            registry.join_next().await
        } else {
            std::future::pending().await
        }
    }

    fn on_actor_finished(&mut self, result: std::result::Result<ActorTaskResult, tokio::task::JoinError>) {
        match result {
            Ok(task_result) => {
                let task_result = self.registry.handle_task_completion(task_result);
                if task_result.is_crash() {
                    warn!(account = %task_result.key, "Account dropped after crash, waiting for new credentials");
                }
            }
            Err(e) => error!("Account actor task failed: {}", e),
        }
    }

    fn log_cycle_result(result: std::result::Result<CycleResult, tokio::task::JoinError>) {
        match result {
            Ok((key, Ok(outcome))) => debug!(account = %key, ?outcome, "Triggered cycle finished"),
            Ok((key, Err(e))) => debug!(account = %key, "Triggered cycle not run: {}", e),
            Err(e) => error!("Triggered cycle task failed: {}", e),
        }
    }

    /// Route one credential event.
    pub fn on_credential_event(&mut self, credentials: AccountCredentials) {
        let key = credentials.key();
        let existing = self.registry.get(&key).cloned();

        match (existing, credentials.enabled) {
            (Some(handle), true) => {
                debug!(account = %key, "Updating credentials");
                match handle.update_credentials(credentials.clone()) {
                    Ok(()) => self.trigger_cycle(handle, false),
                    Err(e) => {
                        warn!(account = %key, "Supervisor has stopped ({}), recreating it", e);
                        self.registry.remove(&key);
                        self.start_account(&key, credentials);
                    }
                }
            }
            (Some(_), false) => {
                info!(account = %key, "Account disabled, removing supervisor");
                self.registry.remove(&key);
            }
            (None, true) => self.start_account(&key, credentials),
            (None, false) => {
                debug!(account = %key, "Ignoring disabled account without supervisor");
            }
        }
    }

    fn start_account(&mut self, key: &AccountKey, credentials: AccountCredentials) {
        let Some(handle) = self.spawn_supervisor(key) else {
            return;
        };
        if let Err(e) = handle.update_credentials(credentials) {
            warn!(account = %key, "Failed to deliver credentials: {}", e);
            return;
        }
        self.trigger_cycle(handle, true);
    }

    fn spawn_supervisor(&mut self, key: &AccountKey) -> Option<AccountHandle> {
        let Some(poller) = self.factory.create(&key.service_name, key.account_id) else {
            warn!(account = %key, "Unknown service, ignoring account");
            return None;
        };
        let application_id = match ApplicationId::parse(poller.application_id()) {
            Ok(id) => id,
            Err(e) => {
                warn!(account = %key, "Ignoring account with unroutable application id: {}", e);
                return None;
            }
        };

        let supervisor = AccountSupervisor::new(
            key.clone(),
            application_id,
            poller,
            self.registry.poll_gate(key),
            self.context.clone(),
            self.config.supervisor.clone(),
        );
        let generation = self.registry.next_generation();
        let (actor, handle) = AccountActor::new(
            supervisor,
            generation,
            self.config.supervisor.mailbox_capacity,
            self.registry.child_token(),
        );

        match self.registry.spawn(actor, handle) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(account = %key, "Failed to register supervisor: {}", e);
                None
            }
        }
    }

    fn trigger_cycle(&mut self, handle: AccountHandle, bootstrap: bool) {
        if !handle.claim_cycle() {
            debug!(account = %handle.key(), "Cycle already queued, it will use the new credentials");
            return;
        }
        self.in_flight.spawn(async move {
            let key = handle.key().clone();
            let result = handle.run_claimed_cycle(bootstrap).await;
            (key, result)
        });
    }

    /// Wait for every cycle started by a credential event.
    pub async fn settle(&mut self) {
        while let Some(result) = self.in_flight.join_next().await {
            Self::log_cycle_result(result);
        }
    }

    /// Run one cycle for every registered account and wait for all of them.
    pub async fn on_system_poll_request(&mut self) -> BulkPollReport {
        let started = Instant::now();
        self.settle().await;

        let mut report = BulkPollReport::default();
        let mut cycles: JoinSet<CycleResult> = JoinSet::new();
        for (key, handle) in self.registry.handles() {
            if handle.snapshot().awaiting_refresh {
                debug!(account = %key, "Skipping account awaiting token refresh");
                report.skipped_refreshing += 1;
                continue;
            }
            let handle = handle.clone();
            cycles.spawn(async move {
                let key = handle.key().clone();
                let result = handle.run_cycle(false).await;
                (key, result)
            });
        }
        info!(accounts = cycles.len(), skipped = report.skipped_refreshing, "Starting bulk poll");

        while let Some(result) = cycles.join_next().await {
            match result {
                Ok((_, Ok(outcome))) => report.record(&outcome),
                Ok((key, Err(e))) => {
                    warn!(account = %key, "Could not run bulk cycle: {}", e);
                    report.failed_to_dispatch += 1;
                }
                Err(e) => {
                    error!("Bulk cycle task failed: {}", e);
                    report.failed_to_dispatch += 1;
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            polled = report.polled,
            delivered = report.delivered,
            failed = report.failed,
            timed_out = report.timed_out,
            "Bulk poll done"
        );
        report
    }

    /// Stop every actor.
    ///
    /// Actors get `Stop` on their priority channel and finish the message
    /// they are handling. Whatever is still running after the shutdown
    /// timeout is cancelled and then aborted.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport {
            total_actors: self.registry.len(),
            ..ShutdownReport::default()
        };
        info!("Stopping {} account actors", report.total_actors);

        let handles: Vec<AccountHandle> = self.registry.handles().map(|(_, h)| h.clone()).collect();
        for handle in handles {
            if let Err(e) = handle.send_priority(AccountMessage::Stop).await {
                warn!(account = %handle.key(), "Failed to send Stop: {}", e);
                report.stop_message_failures += 1;
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.registry.has_pending_tasks() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let remaining = self.registry.pending_task_count();
                    warn!("Shutdown timeout reached, {} actors still running", remaining);
                    self.registry.cancel_all();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if self.registry.has_pending_tasks() {
                        report.forced_terminations += self.registry.pending_task_count();
                        self.registry.abort_all();
                        while self.registry.join_next().await.is_some() {}
                    }
                    break;
                }
                result = self.registry.join_next() => {
                    match result {
                        Some(Ok(task_result)) => {
                            let task_result = self.registry.handle_task_completion(task_result);
                            if task_result.is_crash() {
                                report.forced_terminations += 1;
                            } else {
                                report.graceful_stops += 1;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Actor join error during shutdown: {}", e);
                            report.forced_terminations += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        self.in_flight.shutdown().await;

        info!(
            "Shutdown complete: {} total, {} graceful, {} forced, {} message failures",
            report.total_actors,
            report.graceful_stops,
            report.forced_terminations,
            report.stop_message_failures
        );
        report
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("accounts", &self.registry.len())
            .field("in_flight", &self.in_flight.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ErrorClass;

    #[test]
    fn test_report_counts_outcomes() {
        let mut report = BulkPollReport::default();
        report.record(&CycleOutcome::Delivered { batches: 1, messages: 3 });
        report.record(&CycleOutcome::Failed(ErrorClass::TokenExpired));
        report.record(&CycleOutcome::Failed(ErrorClass::Transient));
        report.record(&CycleOutcome::PenaltySkip { remaining: 2 });
        report.record(&CycleOutcome::TimedOut);

        assert_eq!(report.polled, 5);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.messages, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.auth_failures, 1);
        assert_eq!(report.penalty_skips, 1);
        assert_eq!(report.timed_out, 1);
    }

    #[test]
    fn test_report_serializes() {
        let report = BulkPollReport {
            polled: 1,
            ..BulkPollReport::default()
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["polled"], 1);
        assert_eq!(value["skipped_refreshing"], 0);
    }

    #[test]
    fn test_shutdown_report() {
        let mut report = ShutdownReport {
            total_actors: 2,
            graceful_stops: 2,
            ..ShutdownReport::default()
        };
        assert!(report.all_graceful());
        report.forced_terminations = 1;
        assert!(!report.all_graceful());
    }
}
