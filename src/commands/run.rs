use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tweetwatch::clock::{Clock, SystemClock};
use tweetwatch::config::{spawn_reload_watcher, Config};
use tweetwatch::coordinator::Coordinator;
use tweetwatch::fetch::{FetchOrchestrator, FetchPolicy};
use tweetwatch::notify::{Dispatcher, TelegramTransport};
use tweetwatch::source::{FallbackSource, RssHubSource, SyndicationSource};
use tweetwatch::state::StateStore;
use tweetwatch::throttle::GlobalThrottle;

const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Run the watcher until Ctrl+C or SIGTERM
pub async fn execute(env_file: &Path) -> Result<()> {
    let config = Config::load(env_file)?;
    config.validate_for_delivery()?;
    let config = Arc::new(config);

    info!(
        "Watching: {accounts}",
        accounts = config
            .accounts
            .iter()
            .map(|a| format!("@{a}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("Poll interval: {interval:?}", interval = config.poll_interval);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let throttle = Arc::new(GlobalThrottle::new(
        clock.clone(),
        config.global_min_request_interval,
    ));

    let transport = Arc::new(TelegramTransport::new(
        &config.telegram_bot_token,
        &config.telegram_chat_id,
        &config.telegram_api_base,
    )?);
    let fallback = Arc::new(RssHubSource::new(
        &config.fallback_base_url,
        config.fallback_timeout,
    )?);

    let orchestrator = FetchOrchestrator::new(
        Arc::new(SyndicationSource::new()?),
        Some(fallback.clone() as Arc<dyn FallbackSource>),
        throttle,
        clock.clone(),
        FetchPolicy::from_config(&config),
        shutdown.clone(),
    );
    let dispatcher = Dispatcher::new(transport.clone(), config.display_utc_offset_hours);
    let store = StateStore::load(&config.state_file);

    let (config_rx, watcher) = spawn_reload_watcher(
        env_file.to_path_buf(),
        config.clone(),
        RELOAD_POLL_INTERVAL,
        shutdown.clone(),
    );
    let endpoints = spawn_endpoint_updater(
        config_rx.clone(),
        transport,
        fallback,
        shutdown.clone(),
    );

    let mut coordinator = Coordinator::new(config, orchestrator, dispatcher, store, clock, shutdown.clone())
        .with_config_updates(config_rx);
    coordinator.run().await;

    shutdown.cancel();
    join_logged("reload watcher", watcher).await;
    join_logged("endpoint updater", endpoints).await;
    info!("Stopped");
    Ok(())
}

/// Wait for a background task, logging a panic or cancellation instead of propagating it
async fn join_logged(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Background {name} task ended abnormally: {e}");
            false
        }
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal, finishing current step...");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    match unix_signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            debug!("Cannot listen for SIGTERM: {e}");
            let _ = signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
}

/// Keep transport credentials and the fallback endpoint in line with reloads
fn spawn_endpoint_updater(
    mut rx: watch::Receiver<Arc<Config>>,
    transport: Arc<TelegramTransport>,
    fallback: Arc<RssHubSource>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let config = rx.borrow_and_update().clone();
            transport.update_credentials(
                &config.telegram_bot_token,
                &config.telegram_chat_id,
                &config.telegram_api_base,
            );
            fallback.update(&config.fallback_base_url, config.fallback_timeout);
            debug!("Applied reloaded endpoints");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_logged_reports_task_outcome() {
        let finished = tokio::spawn(async {});
        assert!(join_logged("finished", finished).await);

        let panicked = tokio::spawn(async { panic!("boom") });
        assert!(!join_logged("panicked", panicked).await);

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(!join_logged("aborted", aborted).await);
    }
}
