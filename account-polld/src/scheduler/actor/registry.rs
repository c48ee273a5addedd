//! Registry of live account actors.
//!
//! Besides the actor handles, the registry owns the per-account poll gates.
//! A gate outlives the actor that used it so that a replacement supervisor
//! for the same account cannot start polling while an abandoned poll from
//! its predecessor is still running.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::account_actor::{AccountActor, ActorOutcome};
use super::handle::AccountHandle;
use crate::accounts::AccountKey;

/// Result of an actor task completion.
#[derive(Debug)]
pub struct ActorTaskResult {
    pub key: AccountKey,
    pub generation: u64,
    pub outcome: Result<ActorOutcome, String>,
}

impl ActorTaskResult {
    /// Whether the actor ended with an error or a panic.
    pub fn is_crash(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

pub struct AccountRegistry {
    actors: HashMap<AccountKey, AccountHandle>,
    gates: HashMap<AccountKey, Arc<Semaphore>>,
    task_set: JoinSet<ActorTaskResult>,
    cancellation_token: CancellationToken,
    generation: u64,
}

impl AccountRegistry {
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            actors: HashMap::new(),
            gates: HashMap::new(),
            task_set: JoinSet::new(),
            cancellation_token,
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn contains(&self, key: &AccountKey) -> bool {
        self.actors.contains_key(key)
    }

    pub fn get(&self, key: &AccountKey) -> Option<&AccountHandle> {
        self.actors.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &AccountKey> {
        self.actors.keys()
    }

    pub fn handles(&self) -> impl Iterator<Item = (&AccountKey, &AccountHandle)> {
        self.actors.iter()
    }

    /// Generation number for the next actor.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// The poll gate for `key`, created on first use.
    pub fn poll_gate(&mut self, key: &AccountKey) -> Arc<Semaphore> {
        Arc::clone(
            self.gates
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    /// Number of gates currently retained.
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// Spawn an actor and register its handle.
    pub fn spawn(
        &mut self,
        actor: AccountActor,
        handle: AccountHandle,
    ) -> Result<AccountHandle, RegistryError> {
        let key = actor.key().clone();
        if self.actors.contains_key(&key) {
            return Err(RegistryError::ActorExists(key));
        }

        let generation = actor.generation();
        info!(account = %key, generation, "Spawning account actor");
        self.actors.insert(key.clone(), handle.clone());

        self.task_set.spawn(async move {
            let outcome = match AssertUnwindSafe(actor.run()).catch_unwind().await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(payload) => Err(panic_message(payload)),
            };
            ActorTaskResult {
                key,
                generation,
                outcome,
            }
        });

        Ok(handle)
    }

    /// Unregister an actor and cancel it.
    ///
    /// The actor finishes the message it is handling; queued messages are
    /// dropped. Its task is collected by [`join_next`](Self::join_next).
    pub fn remove(&mut self, key: &AccountKey) -> Option<AccountHandle> {
        let handle = self.actors.remove(key)?;
        debug!(account = %key, generation = handle.generation(), "Removing account actor");
        handle.cancel();
        Some(handle)
    }

    pub async fn join_next(&mut self) -> Option<Result<ActorTaskResult, tokio::task::JoinError>> {
        self.task_set.join_next().await
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.task_set.is_empty()
    }

    pub fn pending_task_count(&self) -> usize {
        self.task_set.len()
    }

    pub fn cancel_all(&mut self) {
        info!("Cancelling all {} account actors", self.actors.len());
        for handle in self.actors.values() {
            handle.cancel();
        }
    }

    pub fn abort_all(&mut self) {
        warn!("Forcefully aborting all account actor tasks");
        self.task_set.abort_all();
    }

    /// Bookkeeping for a finished actor task.
    ///
    /// The handle is only dropped when the finished task belongs to the
    /// registered generation; a newer actor for the same account stays.
    pub fn handle_task_completion(&mut self, result: ActorTaskResult) -> ActorTaskResult {
        let current = self
            .actors
            .get(&result.key)
            .is_some_and(|h| h.generation() == result.generation);
        if current {
            self.actors.remove(&result.key);
        }

        match &result.outcome {
            Err(e) => error!(account = %result.key, generation = result.generation, "Account actor crashed: {}", e),
            Ok(outcome) => debug!(account = %result.key, generation = result.generation, ?outcome, "Account actor finished"),
        }

        self.prune_gates();
        result
    }

    /// Drop gates that no actor or running poll refers to.
    pub fn prune_gates(&mut self) {
        let actors = &self.actors;
        self.gates
            .retain(|key, gate| actors.contains_key(key) || Arc::strong_count(gate) > 1);
    }

    pub fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    ActorExists(AccountKey),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::ActorExists(key) => write!(f, "Actor already exists: {}", key),
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::accounts::{AccountCredentials, AuthTokens};
    use crate::notification::ApplicationId;
    use crate::scheduler::account::{AccountSupervisor, SupervisorConfig, SupervisorContext};
    use crate::testing::{RecordingRefresher, RecordingSink, ScriptedPoller, Step};

    fn actor(
        registry: &mut AccountRegistry,
        key: &AccountKey,
        poller: Arc<ScriptedPoller>,
    ) -> (AccountActor, AccountHandle) {
        let supervisor = AccountSupervisor::new(
            key.clone(),
            ApplicationId::parse("pkg_app").unwrap(),
            poller,
            registry.poll_gate(key),
            SupervisorContext {
                sink: Arc::new(RecordingSink::default()),
                refresher: Arc::new(RecordingRefresher::default()),
            },
            SupervisorConfig::default(),
        );
        let generation = registry.next_generation();
        AccountActor::new(supervisor, generation, 8, registry.child_token())
    }

    #[tokio::test]
    async fn test_spawn_and_duplicate() {
        let mut registry = AccountRegistry::new(CancellationToken::new());
        let key = AccountKey::new("mail", 1);
        let poller = Arc::new(ScriptedPoller::new("pkg_app"));

        let (a, h) = actor(&mut registry, &key, poller.clone());
        registry.spawn(a, h).unwrap();
        let (b, h2) = actor(&mut registry, &key, poller);
        assert_eq!(
            registry.spawn(b, h2).unwrap_err(),
            RegistryError::ActorExists(key.clone())
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&key).unwrap().generation(), 1);

        registry.cancel_all();
        while let Some(result) = registry.join_next().await {
            let result = registry.handle_task_completion(result.unwrap());
            assert!(!result.is_crash());
        }
        assert!(registry.is_empty());
        assert_eq!(registry.gate_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_completion_keeps_newer_actor() {
        let mut registry = AccountRegistry::new(CancellationToken::new());
        let key = AccountKey::new("mail", 1);
        let poller = Arc::new(ScriptedPoller::new("pkg_app"));

        let (a, h) = actor(&mut registry, &key, poller.clone());
        registry.spawn(a, h).unwrap();
        registry.remove(&key).unwrap();
        let (b, h2) = actor(&mut registry, &key, poller);
        registry.spawn(b, h2).unwrap();

        let finished = registry.join_next().await.unwrap().unwrap();
        assert_eq!(finished.generation, 1);
        registry.handle_task_completion(finished);

        assert_eq!(registry.get(&key).unwrap().generation(), 2);
        assert_eq!(registry.gate_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_survives_while_abandoned_poll_runs() {
        let mut registry = AccountRegistry::new(CancellationToken::new());
        let key = AccountKey::new("mail", 1);
        let poller = Arc::new(
            ScriptedPoller::new("pkg_app").then(Step::delayed(Duration::from_secs(100), Step::ok())),
        );

        let (a, h) = actor(&mut registry, &key, poller.clone());
        let handle = registry.spawn(a, h).unwrap();
        handle
            .update_credentials(AccountCredentials::enabled("mail", 1, AuthTokens::default()))
            .unwrap();
        handle.run_cycle(false).await.unwrap();
        assert_eq!(poller.in_flight(), 1);

        let gate = registry.poll_gate(&key);
        registry.remove(&key);
        drop(handle);
        let finished = registry.join_next().await.unwrap().unwrap();
        registry.handle_task_completion(finished);

        // Still held by the detached poll task.
        assert_eq!(gate.available_permits(), 0);
        drop(gate);
        registry.prune_gates();
        assert_eq!(registry.gate_count(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        registry.prune_gates();
        assert_eq!(registry.gate_count(), 0);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "panicked: boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "panicked: bang");
        assert_eq!(panic_message(Box::new(3u8)), "panicked");
    }
}
