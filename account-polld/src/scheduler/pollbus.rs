//! External "poll now" trigger.
//!
//! A [`PollBus`] hands [`PollRequest`]s to the coordinator. Each request
//! carries a oneshot that the coordinator completes with the report of the
//! bulk cycle it ran.

use tokio::sync::{mpsc, oneshot};

use super::service::BulkPollReport;
use crate::{Error, Result};

/// Default capacity of the poll request queue.
pub const DEFAULT_POLL_QUEUE_CAPACITY: usize = 8;

#[derive(Debug)]
pub struct PollRequest {
    done: oneshot::Sender<BulkPollReport>,
}

impl PollRequest {
    pub fn new() -> (Self, oneshot::Receiver<BulkPollReport>) {
        let (tx, rx) = oneshot::channel();
        (Self { done: tx }, rx)
    }

    /// Acknowledge the request.
    pub fn complete(self, report: BulkPollReport) {
        let _ = self.done.send(report);
    }
}

#[derive(Debug, Clone)]
pub struct PollBus {
    tx: mpsc::Sender<PollRequest>,
}

impl PollBus {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PollRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Request a bulk poll and wait until it is done.
    pub async fn request_poll(&self) -> Result<BulkPollReport> {
        let (request, done) = PollRequest::new();
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::Other("coordinator is not running".to_string()))?;
        done.await
            .map_err(|_| Error::Other("coordinator stopped before the poll finished".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_is_acknowledged() {
        let (bus, mut rx) = PollBus::channel(1);
        let waiter = tokio::spawn(async move { bus.request_poll().await });

        let request = rx.recv().await.unwrap();
        request.complete(BulkPollReport {
            polled: 2,
            ..BulkPollReport::default()
        });

        assert_eq!(waiter.await.unwrap().unwrap().polled, 2);
    }

    #[tokio::test]
    async fn test_closed_bus() {
        let (bus, rx) = PollBus::channel(1);
        drop(rx);
        assert!(bus.is_closed());
        assert!(bus.request_poll().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_request_is_an_error() {
        let (bus, mut rx) = PollBus::channel(1);
        let waiter = tokio::spawn(async move { bus.request_poll().await });
        drop(rx.recv().await.unwrap());
        assert!(waiter.await.unwrap().is_err());
    }
}
