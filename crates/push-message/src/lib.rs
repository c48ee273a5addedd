//! Push notification payloads as understood by the platform postal service.
//!
//! These types are shared between the daemon and out-of-process pollers,
//! which emit them as JSON.

use serde::{Deserialize, Serialize};

/// Sound played for a standard notification.
pub const DEFAULT_SOUND: &str = "sounds/ubuntu/notifications/Blip.ogg";

/// Vibration length for a standard notification, in milliseconds.
pub const DEFAULT_VIBRATION_MS: u32 = 200;

/// A single message handed to the postal service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub notification: Notification,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<Card>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibrate: Option<Vibrate>,
    #[serde(
        default,
        rename = "emblem-counter",
        skip_serializing_if = "Option::is_none"
    )]
    pub emblem_counter: Option<EmblemCounter>,
    /// Grouping tag used by the postal service to replace older messages.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

/// Visible part of a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default)]
    pub popup: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default)]
    pub persist: bool,
    /// Seconds since the Unix epoch.
    #[serde(default, rename = "Timestamp", skip_serializing_if = "is_zero")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vibrate {
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub duration: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pattern: Vec<u32>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub repeat: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmblemCounter {
    pub count: u32,
    pub visible: bool,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

impl PushMessage {
    /// Build a popup, persistent message with the default sound and vibration.
    pub fn standard(
        summary: impl Into<String>,
        body: impl Into<String>,
        action: impl Into<String>,
        icon: impl Into<String>,
        timestamp: i64,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            message: String::new(),
            notification: Notification {
                sound: Some(DEFAULT_SOUND.to_string()),
                card: Some(Card {
                    summary: summary.into(),
                    body: body.into(),
                    popup: true,
                    actions: vec![action.into()],
                    icon: icon.into(),
                    persist: true,
                    timestamp,
                }),
                vibrate: Some(Vibrate {
                    duration: DEFAULT_VIBRATION_MS,
                    ..Vibrate::default()
                }),
                emblem_counter: None,
                tag: tag.into(),
            },
        }
    }

    pub fn card_mut(&mut self) -> Option<&mut Card> {
        self.notification.card.as_mut()
    }
}
