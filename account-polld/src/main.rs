use std::sync::Arc;

use account_polld::accounts::ChannelRefresher;
use account_polld::config::PolldConfig;
use account_polld::ipc::{self, JsonLineWriter};
use account_polld::notification::{DEFAULT_POST_OFFICE_CAPACITY, PostOffice};
use account_polld::plugins::{FileStateStore, PollerRegistry};
use account_polld::scheduler::{Coordinator, DEFAULT_POLL_QUEUE_CAPACITY, PollBus};
use account_polld::{logging, panic_hook};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capacity of the credential event queue.
const EVENT_QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = PolldConfig::from_env()?;
    let _log_guard = logging::init(&config.logging())?;
    panic_hook::install(config.log_dir.clone());

    let shutdown = CancellationToken::new();
    if let Some(dir) = &config.log_dir {
        logging::start_retention_cleanup(dir.clone(), shutdown.child_token());
    }

    let plugins = config.load_plugins()?;
    if plugins.is_empty() {
        warn!("No plugins configured, accounts will not be polled");
    }
    let state = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Some(Arc::new(FileStateStore::new(dir)))
        }
        None => None,
    };
    let factory = Arc::new(PollerRegistry::from_command_plugins(&plugins, state));
    info!(services = ?factory.services().collect::<Vec<_>>(), "account-polld starting");

    let writer = Arc::new(JsonLineWriter::stdout());

    // The post office outlives the coordinator so queued deliveries drain.
    let post_office_token = CancellationToken::new();
    let (post_office, sink) = PostOffice::new(
        writer.clone(),
        DEFAULT_POST_OFFICE_CAPACITY,
        post_office_token.clone(),
    );
    let post_office_task = tokio::spawn(post_office.run());

    let (refresher, refresh_rx) = ChannelRefresher::channel();
    tokio::spawn(ipc::forward_refresh_requests(refresh_rx, writer.clone()));

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (bus, poll_rx) = PollBus::channel(DEFAULT_POLL_QUEUE_CAPACITY);

    let mut coordinator = Coordinator::new(
        factory,
        Arc::new(sink),
        Arc::new(refresher),
        config.coordinator.clone(),
        shutdown.clone(),
    );
    let coordinator_task = tokio::spawn(async move { coordinator.run(events_rx, poll_rx).await });

    let input = tokio::spawn(ipc::pump(
        BufReader::new(tokio::io::stdin()),
        events_tx,
        bus,
        writer,
        shutdown.clone(),
    ));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Interrupted, shutting down");
        }
        result = input => {
            match result {
                Ok(Ok(())) => info!("Input finished, shutting down"),
                Ok(Err(e)) => warn!("Input failed: {}", e),
                Err(e) => warn!("Input task failed: {}", e),
            }
        }
    }

    shutdown.cancel();
    let report = coordinator_task.await?;
    if !report.all_graceful() {
        warn!(
            forced = report.forced_terminations,
            failed_stops = report.stop_message_failures,
            "Some accounts did not stop cleanly"
        );
    }

    post_office_token.cancel();
    post_office_task.await?;
    info!("account-polld stopped");
    Ok(())
}
