use push_message::PushMessage;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::accounts::{AccountCredentials, RefreshRequest};
use crate::scheduler::BulkPollReport;

/// A line read from the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Credential event.
    Account(AccountCredentials),
    /// Bulk poll request.
    Poll,
}

/// A line written to the host.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound<'a> {
    Post {
        application_id: &'a str,
        object_path: &'a str,
        message: &'a PushMessage,
    },
    Refresh(&'a RefreshRequest),
    Done(&'a BulkPollReport),
}

pub fn parse_line(line: &str) -> Result<Inbound> {
    Ok(serde_json::from_str(line)?)
}
