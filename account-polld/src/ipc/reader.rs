use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Inbound, JsonLineWriter, Outbound, parse_line};
use crate::{Error, Result};
use crate::accounts::{AccountCredentials, RefreshRequest};
use crate::scheduler::PollBus;

/// Feed host lines to the coordinator until EOF or cancellation.
///
/// Credential events go to `events` in arrival order. Each poll line runs on
/// its own task that writes a `done` line once the bulk cycle finished, so
/// reading continues while a poll is in progress.
pub async fn pump<R>(
    input: R,
    events: mpsc::Sender<AccountCredentials>,
    bus: PollBus,
    writer: Arc<JsonLineWriter>,
    cancellation_token: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut pending_polls = tokio::task::JoinSet::new();

    loop {
        let line = tokio::select! {
            _ = cancellation_token.cancelled() => break,
            line = lines.next_line() => line.map_err(|e| Error::feed(format!("failed to read input: {e}")))?,
        };
        let Some(line) = line else {
            info!("Input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            Ok(Inbound::Account(credentials)) => {
                debug!(account = %credentials.key(), enabled = credentials.enabled, "Credential event");
                if events.send(credentials).await.is_err() {
                    warn!("Coordinator is gone, stopping input");
                    break;
                }
            }
            Ok(Inbound::Poll) => {
                let bus = bus.clone();
                let writer = Arc::clone(&writer);
                pending_polls.spawn(async move {
                    match bus.request_poll().await {
                        Ok(report) => {
                            if let Err(e) = writer.write(&Outbound::Done(&report)) {
                                warn!("Failed to write poll acknowledgement: {}", e);
                            }
                        }
                        Err(e) => warn!("Poll request failed: {}", e),
                    }
                });
            }
            Err(e) => warn!("Skipping malformed input line: {}", e),
        }

        while pending_polls.try_join_next().is_some() {}
    }

    // The coordinator acknowledges queued polls with an empty report when it
    // stops; requests sent after that fail.
    pending_polls.detach_all();
    Ok(())
}

/// Write every refresh request as a `refresh` line.
pub async fn forward_refresh_requests(
    mut requests: mpsc::UnboundedReceiver<RefreshRequest>,
    writer: Arc<JsonLineWriter>,
) {
    while let Some(request) = requests.recv().await {
        info!(account_id = %request.account_id, service = %request.service_name, "Requesting credential refresh");
        if let Err(e) = writer.write(&Outbound::Refresh(&request)) {
            warn!("Failed to write refresh request: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountId, ChannelRefresher, RefreshRequester};
    use crate::ipc::writer::tests::SharedBuf;
    use crate::scheduler::BulkPollReport;

    #[tokio::test]
    async fn test_pump_routes_lines() {
        let input = concat!(
            r#"{"type":"account","account_id":1,"service_name":"mail","enabled":true}"#,
            "\n\nnot json\n",
            r#"{"type":"poll"}"#,
            "\n",
            r#"{"type":"account","account_id":1,"service_name":"mail","enabled":false}"#,
            "\n",
        );
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (bus, mut polls) = PollBus::channel(4);
        let buf = SharedBuf::default();
        let writer = Arc::new(JsonLineWriter::new(buf.clone()));

        let responder = tokio::spawn(async move {
            let request = polls.recv().await.unwrap();
            request.complete(BulkPollReport {
                polled: 1,
                ..BulkPollReport::default()
            });
        });

        pump(
            input.as_bytes(),
            events_tx,
            bus,
            writer,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        responder.await.unwrap();

        assert!(events_rx.recv().await.unwrap().enabled);
        assert!(!events_rx.recv().await.unwrap().enabled);
        assert!(events_rx.recv().await.is_none());

        // The acknowledgement is written by a detached task.
        for _ in 0..100 {
            if !buf.lines().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let lines = buf.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "done");
        assert_eq!(lines[0]["polled"], 1);
    }

    #[tokio::test]
    async fn test_refresh_requests_become_lines() {
        let buf = SharedBuf::default();
        let writer = Arc::new(JsonLineWriter::new(buf.clone()));
        let (refresher, rx) = ChannelRefresher::channel();

        refresher.request_refresh(AccountId(4), "webapp-twitter");
        drop(refresher);
        forward_refresh_requests(rx, writer).await;

        let lines = buf.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "refresh");
        assert_eq!(lines[0]["account_id"], 4);
        assert_eq!(lines[0]["service_name"], "webapp-twitter");
    }
}
