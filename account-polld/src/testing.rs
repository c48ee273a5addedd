//! Scripted collaborators for exercising supervisors and the coordinator.
//!
//! Built for this crate's unit tests, and for integration tests when the
//! `test-utils` feature is enabled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use push_message::PushMessage;

use crate::accounts::{AccountCredentials, AccountId, RefreshRequest, RefreshRequester};
use crate::notification::{Delivery, NotificationSink, PushMessageBatch};
use crate::plugins::{PollError, ServicePoller};

/// What a [`ScriptedPoller`] does for one poll.
#[derive(Clone)]
pub enum Step {
    Reply(Result<Vec<PushMessageBatch>, PollError>),
    /// Sleep, then behave like the inner step.
    Delayed(Duration, Box<Step>),
    /// Never return.
    Hang,
    Panic,
}

impl Step {
    pub fn ok() -> Self {
        Self::Reply(Ok(Vec::new()))
    }

    /// One batch of `count` standard messages.
    pub fn messages(count: usize, limit: usize) -> Self {
        let messages = (0..count)
            .map(|i| PushMessage::standard(format!("message {i}"), "", "", "", 0, "test"))
            .collect();
        Self::Reply(Ok(vec![PushMessageBatch::new(messages, limit, "test")]))
    }

    pub fn fail(error: PollError) -> Self {
        Self::Reply(Err(error))
    }

    pub fn delayed(delay: Duration, step: Step) -> Self {
        Self::Delayed(delay, Box::new(step))
    }
}

/// Poller that replays a script and records concurrency.
pub struct ScriptedPoller {
    application_id: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    completed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedPoller {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Step::ok(),
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue a step.
    pub fn then(self, step: Step) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Step used once the script is exhausted.
    pub fn fallback(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Access token of every poll, in call order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServicePoller for ScriptedPoller {
    fn application_id(&self) -> &str {
        &self.application_id
    }

    async fn poll(
        &self,
        credentials: &AccountCredentials,
    ) -> Result<Vec<PushMessageBatch>, PollError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().push(credentials.auth.access_token.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let next = self.script.lock().pop_front();
        let mut step = next.unwrap_or_else(|| self.fallback.clone());
        let result = loop {
            match step {
                Step::Reply(result) => break result,
                Step::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                }
                Step::Hang => std::future::pending::<()>().await,
                Step::Panic => panic!("scripted poller panic"),
            }
        };

        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Sink that keeps every delivery.
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingSink {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.deliveries.lock().iter().map(Delivery::message_count).sum()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, delivery: Delivery) -> crate::Result<()> {
        self.deliveries.lock().push(delivery);
        Ok(())
    }
}

/// Refresh requester that keeps every request.
#[derive(Default)]
pub struct RecordingRefresher {
    requests: Mutex<Vec<RefreshRequest>>,
}

impl RecordingRefresher {
    pub fn requests(&self) -> Vec<RefreshRequest> {
        self.requests.lock().clone()
    }
}

impl RefreshRequester for RecordingRefresher {
    fn request_refresh(&self, account_id: AccountId, service_name: &str) {
        self.requests.lock().push(RefreshRequest {
            account_id,
            service_name: service_name.to_string(),
        });
    }
}
