//! Post office: applies the overflow policy and hands messages to the
//! postal transport.

use std::sync::Arc;

use push_message::PushMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sink::{Delivery, PostOfficeHandle};
use super::{ApplicationId, PushMessageBatch};
use crate::Result;

/// Default capacity of the delivery queue.
pub const DEFAULT_POST_OFFICE_CAPACITY: usize = 64;

/// Platform delivery of a single message.
pub trait PostalTransport: Send + Sync + 'static {
    fn post(
        &self,
        application_id: &ApplicationId,
        object_path: &str,
        message: &PushMessage,
    ) -> Result<()>;
}

/// Apply the presentation policy to one batch.
///
/// Only the first message keeps its sound and vibration. An overflowing batch
/// loses popups, keeps its first `limit` messages and gains one
/// non-persistent overflow message tagged `<tag>-overflow`.
pub fn consolidate(batch: &PushMessageBatch) -> Vec<PushMessage> {
    let overflowing = batch.is_overflowing();
    let shown = if overflowing {
        batch.limit
    } else {
        batch.messages.len()
    };

    let mut out: Vec<PushMessage> = Vec::with_capacity(shown + 1);
    for (i, message) in batch.messages.iter().take(shown).enumerate() {
        let mut message = message.clone();
        if i > 0 {
            message.notification.sound = None;
            message.notification.vibrate = None;
        }
        if overflowing && let Some(card) = message.card_mut() {
            card.popup = false;
        }
        out.push(message);
    }

    if overflowing {
        let mut overflow = (batch.overflow)(&batch.messages);
        overflow.notification.vibrate = None;
        if !out.is_empty() {
            overflow.notification.sound = None;
        }
        if let Some(card) = overflow.card_mut() {
            card.persist = false;
            card.popup = false;
        }
        if !batch.tag.is_empty() {
            overflow.notification.tag = format!("{}-overflow", batch.tag);
        }
        out.push(overflow);
    }

    out
}

/// Consumes deliveries and posts their messages in order.
pub struct PostOffice {
    rx: mpsc::Receiver<Delivery>,
    transport: Arc<dyn PostalTransport>,
    cancellation_token: CancellationToken,
}

impl PostOffice {
    pub fn new(
        transport: Arc<dyn PostalTransport>,
        capacity: usize,
        cancellation_token: CancellationToken,
    ) -> (Self, PostOfficeHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let office = Self {
            rx,
            transport,
            cancellation_token,
        };
        (office, PostOfficeHandle::new(tx))
    }

    /// Run until cancelled or every handle is dropped. Deliveries already
    /// queued at cancellation are still posted.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    self.rx.close();
                    while let Some(delivery) = self.rx.recv().await {
                        self.dispatch(delivery);
                    }
                    debug!("Post office shutting down");
                    break;
                }
                delivery = self.rx.recv() => {
                    match delivery {
                        Some(delivery) => self.dispatch(delivery),
                        None => {
                            debug!("All post office handles dropped");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        let object_path = delivery.application_id.push_object_path();
        let mut posted = 0usize;

        for batch in delivery.batches.iter().filter(|b| !b.is_empty()) {
            for message in consolidate(batch) {
                match self
                    .transport
                    .post(&delivery.application_id, &object_path, &message)
                {
                    Ok(()) => posted += 1,
                    Err(e) => warn!(
                        app_id = %delivery.application_id,
                        account_id = %delivery.account_id,
                        "Failed to post message: {}", e
                    ),
                }
            }
        }

        debug!(
            app_id = %delivery.application_id,
            account_id = %delivery.account_id,
            posted,
            "Delivery dispatched"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountId;
    use crate::notification::NotificationSink;
    use parking_lot::Mutex;

    fn message(n: usize) -> PushMessage {
        PushMessage::standard(format!("msg {n}"), "body", "app://open", "icon", 0, "mail")
    }

    fn batch(count: usize, limit: usize) -> PushMessageBatch {
        PushMessageBatch::new((0..count).map(message).collect(), limit, "mail")
    }

    #[derive(Default)]
    struct RecordingTransport {
        posted: Mutex<Vec<(String, PushMessage)>>,
    }

    impl PostalTransport for RecordingTransport {
        fn post(&self, _app: &ApplicationId, path: &str, message: &PushMessage) -> Result<()> {
            self.posted.lock().push((path.to_string(), message.clone()));
            Ok(())
        }
    }

    #[test]
    fn test_overflow_posts_limit_plus_summary() {
        let out = consolidate(&batch(3, 2));
        assert_eq!(out.len(), 3);

        assert!(out.iter().all(|m| !m.notification.card.as_ref().unwrap().popup));
        assert_eq!(out[0].notification.card.as_ref().unwrap().summary, "msg 0");
        assert_eq!(out[1].notification.card.as_ref().unwrap().summary, "msg 1");

        let overflow = &out[2];
        assert_eq!(overflow.notification.tag, "mail-overflow");
        assert!(!overflow.notification.card.as_ref().unwrap().persist);
        assert!(overflow.notification.vibrate.is_none());
        assert_eq!(
            overflow.notification.card.as_ref().unwrap().summary,
            "3 new notifications"
        );
    }

    #[test]
    fn test_within_limit_keeps_popups() {
        let out = consolidate(&batch(2, 5));
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.notification.card.as_ref().unwrap().popup));
    }

    #[test]
    fn test_only_first_message_alerts() {
        let out = consolidate(&batch(3, 10));
        assert!(out[0].notification.sound.is_some());
        assert!(out[0].notification.vibrate.is_some());
        for m in &out[1..] {
            assert!(m.notification.sound.is_none());
            assert!(m.notification.vibrate.is_none());
        }
    }

    #[test]
    fn test_custom_overflow_handler() {
        let b = batch(4, 1).with_overflow(|msgs| {
            PushMessage::standard(format!("{} unread", msgs.len()), "", "", "", 0, "")
        });
        let out = consolidate(&b);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].notification.card.as_ref().unwrap().summary, "4 unread");
    }

    #[tokio::test]
    async fn test_post_office_posts_to_object_path() {
        let transport = Arc::new(RecordingTransport::default());
        let cancel = CancellationToken::new();
        let (office, handle) = PostOffice::new(transport.clone(), 8, cancel.clone());
        let task = tokio::spawn(office.run());

        handle
            .deliver(Delivery {
                application_id: ApplicationId::parse("com.ubuntu.music_music").unwrap(),
                account_id: AccountId(1),
                batches: vec![batch(3, 2), batch(0, 2)],
            })
            .await
            .unwrap();

        cancel.cancel();
        task.await.unwrap();

        let posted = transport.posted.lock();
        assert_eq!(posted.len(), 3);
        assert!(
            posted
                .iter()
                .all(|(path, _)| path == "/com/ubuntu/Postal/com_2eubuntu_2emusic")
        );
    }
}
