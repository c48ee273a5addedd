//! JSON-lines front end.
//!
//! The daemon talks to its host over stdin and stdout, one JSON object per
//! line:
//!
//! - in: `{"type":"account", ...credentials}` and `{"type":"poll"}`
//! - out: `{"type":"post", ...}`, `{"type":"refresh", ...}` and
//!   `{"type":"done", ...report}`
//!
//! The host is the credential feed and the postal service; the daemon only
//! ever sees it through these messages.

mod protocol;
mod reader;
mod writer;

pub use protocol::{Inbound, Outbound, parse_line};
pub use reader::{forward_refresh_requests, pump};
pub use writer::JsonLineWriter;
