//! Message batches produced by a successful poll.

use std::fmt;
use std::sync::Arc;

use push_message::PushMessage;

/// Builds the single message that stands in for an overflowing batch.
pub type OverflowHandler = Arc<dyn Fn(&[PushMessage]) -> PushMessage + Send + Sync>;

/// A group of messages sharing a presentation tag and overflow policy.
#[derive(Clone)]
pub struct PushMessageBatch {
    pub messages: Vec<PushMessage>,
    /// Number of messages shown individually before consolidating.
    pub limit: usize,
    pub overflow: OverflowHandler,
    pub tag: String,
}

impl PushMessageBatch {
    /// Batch with the generic "N new notifications" overflow message.
    pub fn new(messages: Vec<PushMessage>, limit: usize, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        let overflow_tag = tag.clone();
        Self {
            messages,
            limit,
            overflow: Arc::new(move |messages| default_overflow(messages, &overflow_tag)),
            tag,
        }
    }

    pub fn with_overflow(
        mut self,
        handler: impl Fn(&[PushMessage]) -> PushMessage + Send + Sync + 'static,
    ) -> Self {
        self.overflow = Arc::new(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_overflowing(&self) -> bool {
        self.messages.len() > self.limit
    }
}

impl fmt::Debug for PushMessageBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushMessageBatch")
            .field("messages", &self.messages.len())
            .field("limit", &self.limit)
            .field("tag", &self.tag)
            .finish()
    }
}

fn default_overflow(messages: &[PushMessage], tag: &str) -> PushMessage {
    let icon = messages
        .iter()
        .find_map(|m| m.notification.card.as_ref().map(|c| c.icon.clone()))
        .unwrap_or_default();
    let action = messages
        .iter()
        .find_map(|m| {
            m.notification
                .card
                .as_ref()
                .and_then(|c| c.actions.first().cloned())
        })
        .unwrap_or_default();
    let timestamp = chrono::Utc::now().timestamp();

    PushMessage::standard(
        format!("{} new notifications", messages.len()),
        "",
        action,
        icon,
        timestamp,
        tag,
    )
}
