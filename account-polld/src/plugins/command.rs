//! Out-of-process pollers.
//!
//! Each poll spawns the configured plugin executable, writes one JSON request
//! to its stdin and reads one JSON reply from its stdout:
//!
//! ```text
//! -> {"ApplicationId": "...", "AccountId": 3, "Auth": {"accessToken": "..."}, "State": {...}}
//! <- {"notifications": [...], "limit": 2, "tag": "mail", "overflow": {...}, "state": {...}}
//! <- {"error": {"message": "...", "code": "ERR_INVALID_AUTH"}}
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use push_message::PushMessage;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{FileStateStore, PollError, PollerRegistry, ServicePoller};
use crate::accounts::{AccountCredentials, AccountId, AuthTokens};
use crate::notification::PushMessageBatch;

/// Upper bound on a single plugin run.
pub const DEFAULT_PLUGIN_RUNTIME: Duration = Duration::from_secs(300);

/// Error code for an access token that must be refreshed.
pub const ERR_INVALID_AUTH: &str = "ERR_INVALID_AUTH";
/// Error code for credentials rejected outright.
pub const ERR_AUTH_FAILED: &str = "ERR_AUTH_FAILED";
/// Error code for a transport failure inside the plugin.
pub const ERR_NETWORK: &str = "ERR_NETWORK";

/// One entry of the plugin table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPluginConfig {
    /// Service name reported by the credential feed.
    pub service: String,
    pub application_id: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Name under which plugin state is persisted. Defaults to the service.
    #[serde(default)]
    pub name: Option<String>,
}

impl CommandPluginConfig {
    pub fn plugin_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.service)
    }
}

#[derive(Serialize)]
struct PluginRequest<'a> {
    #[serde(rename = "ApplicationId")]
    application_id: &'a str,
    #[serde(rename = "AccountId")]
    account_id: AccountId,
    #[serde(rename = "Auth")]
    auth: &'a AuthTokens,
    #[serde(rename = "State", skip_serializing_if = "Option::is_none")]
    state: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct PluginReply {
    #[serde(default)]
    notifications: Vec<PushMessage>,
    limit: Option<usize>,
    tag: Option<String>,
    overflow: Option<PushMessage>,
    state: Option<serde_json::Value>,
    error: Option<PluginErrorReply>,
}

#[derive(Debug, Deserialize)]
struct PluginErrorReply {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

impl From<PluginErrorReply> for PollError {
    fn from(reply: PluginErrorReply) -> Self {
        match reply.code.as_deref() {
            Some(ERR_INVALID_AUTH) => PollError::TokenExpired,
            Some(ERR_AUTH_FAILED) => PollError::AuthFailed(reply.message),
            Some(ERR_NETWORK) => PollError::Network(reply.message),
            _ => PollError::Other(reply.message),
        }
    }
}

/// Poller backed by an external executable.
#[derive(Debug, Clone)]
pub struct CommandPoller {
    config: CommandPluginConfig,
    state: Option<Arc<FileStateStore>>,
    max_runtime: Duration,
}

impl CommandPoller {
    pub fn new(config: CommandPluginConfig) -> Self {
        Self {
            config,
            state: None,
            max_runtime: DEFAULT_PLUGIN_RUNTIME,
        }
    }

    pub fn with_state_store(mut self, store: Arc<FileStateStore>) -> Self {
        self.state = Some(store);
        self
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    async fn load_state(&self, account_id: AccountId) -> Option<serde_json::Value> {
        let store = self.state.as_ref()?;
        match store.load(self.config.plugin_name(), account_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(plugin = %self.config.plugin_name(), %account_id, "Failed to load plugin state: {}", e);
                None
            }
        }
    }

    async fn save_state(&self, account_id: AccountId, state: &serde_json::Value) {
        let Some(store) = self.state.as_ref() else {
            return;
        };
        if let Err(e) = store.store(self.config.plugin_name(), account_id, state).await {
            warn!(plugin = %self.config.plugin_name(), %account_id, "Failed to persist plugin state: {}", e);
        }
    }

    async fn run_plugin(&self, request: &[u8]) -> Result<PluginReply, PollError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            PollError::Protocol(format!(
                "failed to spawn {}: {}",
                self.config.command.display(),
                e
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A plugin may exit without reading its request.
            if let Err(e) = stdin.write_all(request).await {
                debug!(plugin = %self.config.plugin_name(), "Plugin closed stdin early: {}", e);
            }
        }

        let output = tokio::time::timeout(self.max_runtime, child.wait_with_output())
            .await
            .map_err(|_| {
                PollError::Protocol(format!(
                    "plugin ran longer than {}s and was killed",
                    self.max_runtime.as_secs()
                ))
            })?
            .map_err(|e| PollError::Protocol(format!("failed to wait for plugin: {}", e)))?;

        match serde_json::from_slice::<PluginReply>(&output.stdout) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(PollError::Protocol(format!(
                    "unreadable reply (exit code {}): {}; stderr: {}",
                    output.status.code().unwrap_or(-1),
                    e,
                    stderr.trim()
                )))
            }
        }
    }
}

#[async_trait]
impl ServicePoller for CommandPoller {
    fn application_id(&self) -> &str {
        &self.config.application_id
    }

    async fn poll(
        &self,
        credentials: &AccountCredentials,
    ) -> Result<Vec<PushMessageBatch>, PollError> {
        let request = PluginRequest {
            application_id: &self.config.application_id,
            account_id: credentials.account_id,
            auth: &credentials.auth,
            state: self.load_state(credentials.account_id).await,
        };
        let request = serde_json::to_vec(&request)
            .map_err(|e| PollError::Other(format!("failed to encode request: {}", e)))?;

        let reply = self.run_plugin(&request).await?;
        if let Some(error) = reply.error {
            return Err(error.into());
        }
        if let Some(state) = &reply.state {
            self.save_state(credentials.account_id, state).await;
        }
        if reply.notifications.is_empty() {
            return Ok(Vec::new());
        }

        let limit = reply.limit.unwrap_or(reply.notifications.len());
        let mut batch = PushMessageBatch::new(
            reply.notifications,
            limit,
            reply.tag.unwrap_or_else(|| self.config.plugin_name().to_string()),
        );
        if let Some(overflow) = reply.overflow {
            batch = batch.with_overflow(move |_| overflow.clone());
        }
        Ok(vec![batch])
    }
}

impl PollerRegistry {
    /// Registry with one [`CommandPoller`] per plugin table entry.
    pub fn from_command_plugins(
        plugins: &[CommandPluginConfig],
        state: Option<Arc<FileStateStore>>,
    ) -> Self {
        let mut registry = Self::new();
        for plugin in plugins {
            let mut poller = CommandPoller::new(plugin.clone());
            if let Some(store) = &state {
                poller = poller.with_state_store(Arc::clone(store));
            }
            debug!(service = %plugin.service, command = %plugin.command.display(), "Registered plugin");
            registry.register_shared(plugin.service.clone(), Arc::new(poller));
        }
        registry
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugins::PollerFactory;

    fn poller(script: &str) -> CommandPoller {
        CommandPoller::new(CommandPluginConfig {
            service: "svc".into(),
            application_id: "pkg_app".into(),
            command: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
            name: None,
        })
    }

    fn credentials() -> AccountCredentials {
        AccountCredentials::enabled(
            "svc",
            5,
            AuthTokens {
                access_token: "tok".into(),
                ..AuthTokens::default()
            },
        )
    }

    #[tokio::test]
    async fn test_notifications_become_one_batch() {
        let p = poller(
            r#"cat > /dev/null; echo '{"notifications":[{"notification":{"card":{"summary":"a"}}},{"notification":{"card":{"summary":"b"}}}],"limit":1,"tag":"inbox"}'"#,
        );

        let batches = p.poll(&credentials()).await.unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0].limit, 1);
        assert_eq!(batches[0].tag, "inbox");
    }

    #[tokio::test]
    async fn test_request_carries_credentials() {
        let p = poller(
            r#"req=$(cat); case "$req" in *'"accessToken":"tok"'*'"AccountId"'*|*'"AccountId"'*'"accessToken":"tok"'*) echo '{"notifications":[]}';; *) echo '{"error":{"message":"bad request"}}';; esac"#,
        );
        assert!(p.poll(&credentials()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_codes_map_to_poll_errors() {
        let expired = poller(
            r#"cat > /dev/null; echo '{"error":{"message":"expired","code":"ERR_INVALID_AUTH"}}'"#,
        );
        assert!(matches!(
            expired.poll(&credentials()).await,
            Err(PollError::TokenExpired)
        ));

        let rejected = poller(
            r#"cat > /dev/null; echo '{"error":{"message":"denied","code":"ERR_AUTH_FAILED"}}'"#,
        );
        assert!(matches!(
            rejected.poll(&credentials()).await,
            Err(PollError::AuthFailed(m)) if m == "denied"
        ));

        let other = poller(r#"cat > /dev/null; echo '{"error":{"message":"quota"}}'"#);
        assert!(matches!(other.poll(&credentials()).await, Err(PollError::Other(_))));
    }

    #[tokio::test]
    async fn test_garbage_output_is_protocol_error() {
        let p = poller("cat > /dev/null; echo nope; exit 3");
        match p.poll(&credentials()).await {
            Err(PollError::Protocol(msg)) => assert!(msg.contains("exit code 3")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_state_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path()));
        let p = poller(
            r#"req=$(cat); case "$req" in *'"State"'*) echo '{"notifications":[],"state":{"seen":2}}';; *) echo '{"notifications":[],"state":{"seen":1}}';; esac"#,
        )
        .with_state_store(store.clone());

        p.poll(&credentials()).await.unwrap();
        let first: Option<serde_json::Value> = store.load("svc", AccountId(5)).await.unwrap();
        assert_eq!(first, Some(serde_json::json!({"seen": 1})));

        p.poll(&credentials()).await.unwrap();
        let second: Option<serde_json::Value> = store.load("svc", AccountId(5)).await.unwrap();
        assert_eq!(second, Some(serde_json::json!({"seen": 2})));
    }

    #[test]
    fn test_registry_from_plugin_table() {
        let table: Vec<CommandPluginConfig> = serde_json::from_str(
            r#"[{"service": "google-caldav", "application_id": "com.ubuntu.calendar_calendar", "command": "/usr/lib/account-polld/caldav"}]"#,
        )
        .unwrap();
        assert_eq!(table[0].plugin_name(), "google-caldav");

        let registry = PollerRegistry::from_command_plugins(&table, None);
        let p = registry.create("google-caldav", AccountId(1)).unwrap();
        assert_eq!(p.application_id(), "com.ubuntu.calendar_calendar");
    }

    #[tokio::test]
    async fn test_runaway_plugin_is_killed() {
        let p = poller("sleep 5").with_max_runtime(Duration::from_millis(100));
        assert!(matches!(
            p.poll(&credentials()).await,
            Err(PollError::Protocol(_))
        ));
    }
}
