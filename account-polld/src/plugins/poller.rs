//! Service poller abstraction and the service-name lookup table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::PollError;
use crate::accounts::{AccountCredentials, AccountId};
use crate::notification::PushMessageBatch;

/// Wraps one remote service. Performs exactly one poll per call.
///
/// Must be safe to call concurrently for different accounts. Supervisors
/// never run two polls for the same account at once.
#[async_trait]
pub trait ServicePoller: Send + Sync + 'static {
    /// Application the results are posted to, e.g. `dekko.dekkoproject_dekko`.
    fn application_id(&self) -> &str;

    async fn poll(
        &self,
        credentials: &AccountCredentials,
    ) -> Result<Vec<PushMessageBatch>, PollError>;
}

/// Creates a poller for an account, or `None` for unknown services.
pub trait PollerFactory: Send + Sync + 'static {
    fn create(&self, service_name: &str, account_id: AccountId) -> Option<Arc<dyn ServicePoller>>;
}

type PollerConstructor = Arc<dyn Fn(AccountId) -> Arc<dyn ServicePoller> + Send + Sync>;

/// Maps service names to poller constructors.
#[derive(Default, Clone)]
pub struct PollerRegistry {
    constructors: HashMap<String, PollerConstructor>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. Replaces any existing entry for the service.
    pub fn register<F>(&mut self, service_name: impl Into<String>, constructor: F)
    where
        F: Fn(AccountId) -> Arc<dyn ServicePoller> + Send + Sync + 'static,
    {
        self.constructors
            .insert(service_name.into(), Arc::new(constructor));
    }

    /// Register one shared poller instance for every account of a service.
    pub fn register_shared(&mut self, service_name: impl Into<String>, poller: Arc<dyn ServicePoller>) {
        self.register(service_name, move |_| Arc::clone(&poller));
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl PollerFactory for PollerRegistry {
    fn create(&self, service_name: &str, account_id: AccountId) -> Option<Arc<dyn ServicePoller>> {
        self.constructors
            .get(service_name)
            .map(|constructor| constructor(account_id))
    }
}

impl std::fmt::Debug for PollerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<_> = self.services().collect();
        services.sort_unstable();
        f.debug_struct("PollerRegistry")
            .field("services", &services)
            .finish()
    }
}
