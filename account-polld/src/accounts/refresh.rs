//! Refresh requests flowing back to the credential feed.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use super::AccountId;

/// A request for the feed to re-authenticate an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshRequest {
    pub account_id: AccountId,
    pub service_name: String,
}

/// Fire-and-forget refresh operation exposed by the credential feed.
///
/// Implementations must not block: supervisors call this from inside a poll
/// cycle.
pub trait RefreshRequester: Send + Sync + 'static {
    fn request_refresh(&self, account_id: AccountId, service_name: &str);
}

/// Refresh requester that queues requests on an unbounded channel.
///
/// The receiving side forwards them to the credential feed.
#[derive(Debug, Clone)]
pub struct ChannelRefresher {
    tx: mpsc::UnboundedSender<RefreshRequest>,
}

impl ChannelRefresher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RefreshRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RefreshRequester for ChannelRefresher {
    fn request_refresh(&self, account_id: AccountId, service_name: &str) {
        let request = RefreshRequest {
            account_id,
            service_name: service_name.to_string(),
        };
        if self.tx.send(request).is_err() {
            warn!(%account_id, service = service_name, "Refresh request dropped, feed is gone");
        }
    }
}
