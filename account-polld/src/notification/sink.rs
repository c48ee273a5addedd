//! The notification sink seen by account supervisors.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ApplicationId, PushMessageBatch};
use crate::accounts::AccountId;
use crate::{Error, Result};

/// Results of one successful poll, addressed to an application.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub application_id: ApplicationId,
    pub account_id: AccountId,
    pub batches: Vec<PushMessageBatch>,
}

impl Delivery {
    pub fn message_count(&self) -> usize {
        self.batches.iter().map(PushMessageBatch::len).sum()
    }
}

/// Accepts normalized batches for platform delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn deliver(&self, delivery: Delivery) -> Result<()>;
}

/// Sink that queues deliveries for a [`PostOffice`](super::PostOffice).
#[derive(Debug, Clone)]
pub struct PostOfficeHandle {
    tx: mpsc::Sender<Delivery>,
}

impl PostOfficeHandle {
    pub(super) fn new(tx: mpsc::Sender<Delivery>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationSink for PostOfficeHandle {
    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.tx
            .send(delivery)
            .await
            .map_err(|_| Error::Other("post office has shut down".to_string()))
    }
}
