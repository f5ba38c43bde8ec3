//! The poll loop: walks every account once per cycle, then idles.

use crate::account::AccountPollState;
use crate::clock::{random_between, sleep_or_cancel, Clock};
use crate::config::Config;
use crate::dedup;
use crate::fetch::FetchOrchestrator;
use crate::notify::{reload_notice, shutdown_notice, startup_notice, Dispatcher};
use crate::state::StateStore;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WAIT_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub poll_interval: Duration,
    /// Random pause before each account within a cycle
    pub account_jitter: (Duration, Duration),
    /// Pause between two deliveries
    pub delivery_gap: Duration,
    pub suppress_existing_on_start: bool,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            account_jitter: (Duration::from_secs(2), Duration::from_secs(8)),
            delivery_gap: Duration::from_secs(1),
            suppress_existing_on_start: config.suppress_existing_on_start,
        }
    }
}

/// Running totals, logged after each cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub fetched: u64,
    pub delivered: u64,
    pub failed_deliveries: u64,
}

pub struct Coordinator {
    accounts: HashMap<String, AccountPollState>,
    order: Vec<String>,
    orchestrator: FetchOrchestrator,
    dispatcher: Dispatcher,
    store: StateStore,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    settings: CoordinatorSettings,
    config: Arc<Config>,
    config_rx: Option<watch::Receiver<Arc<Config>>>,
    stats: CycleStats,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        orchestrator: FetchOrchestrator,
        dispatcher: Dispatcher,
        store: StateStore,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let accounts = config
            .accounts
            .iter()
            .map(|name| {
                let state = AccountPollState::restored(name.clone(), store.get_last_seen_id(name));
                (name.clone(), state)
            })
            .collect();

        Self {
            accounts,
            order: config.accounts.clone(),
            orchestrator,
            dispatcher,
            store,
            clock,
            shutdown,
            settings: CoordinatorSettings::from_config(&config),
            config,
            config_rx: None,
            stats: CycleStats::default(),
        }
    }

    /// Pick up configuration snapshots from `rx` between cycles
    pub fn with_config_updates(mut self, rx: watch::Receiver<Arc<Config>>) -> Self {
        self.config_rx = Some(rx);
        self
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    pub fn account(&self, name: &str) -> Option<&AccountPollState> {
        self.accounts.get(name)
    }

    pub fn accounts(&self) -> &[String] {
        &self.order
    }

    /// Run cycles until shutdown is requested
    pub async fn run(&mut self) {
        info!(
            "Watching {count} accounts every {interval:?}",
            count = self.order.len(),
            interval = self.settings.poll_interval
        );
        if !self.dispatcher.announce(&startup_notice(&self.order)).await {
            warn!("Start-up notice could not be delivered");
        }

        while !self.shutdown.is_cancelled() {
            self.apply_config_update().await;
            self.run_cycle().await;
            if !self.wait_for_next_cycle().await {
                break;
            }
        }

        info!(
            "Shutting down after {cycles} cycles: {fetched} posts fetched, {delivered} delivered, {failed} failed",
            cycles = self.stats.cycles,
            fetched = self.stats.fetched,
            delivered = self.stats.delivered,
            failed = self.stats.failed_deliveries
        );
        if !self.dispatcher.announce(&shutdown_notice()).await {
            warn!("Shutdown notice could not be delivered");
        }
    }

    /// One pass over every account in random order
    pub async fn run_cycle(&mut self) {
        let mut order = self.order.clone();
        order.shuffle(&mut rand::rng());

        for name in order {
            let (min, max) = self.settings.account_jitter;
            if !sleep_or_cancel(&self.clock, random_between(min, max), &self.shutdown).await {
                debug!("Shutdown requested, ending cycle early");
                break;
            }
            self.poll_account(&name).await;
        }

        self.stats.cycles += 1;
        info!(
            "Cycle {cycle} done: {fetched} fetched, {delivered} delivered, {failed} failed so far",
            cycle = self.stats.cycles,
            fetched = self.stats.fetched,
            delivered = self.stats.delivered,
            failed = self.stats.failed_deliveries
        );
    }

    /// Fetch one account and deliver whatever is new.
    ///
    /// Sources return timelines newest first; delivery runs oldest first so
    /// the chat reads chronologically, with `delivery_gap` between posts.
    /// A failed delivery is counted but not retried, and the mark is still
    /// persisted afterwards.
    async fn poll_account(&mut self, name: &str) {
        let Some(state) = self.accounts.get_mut(name) else {
            return;
        };

        let posts = self.orchestrator.fetch(state).await;
        self.stats.fetched += posts.len() as u64;

        let (new_posts, changed) =
            if self.settings.suppress_existing_on_start && state.is_fresh() && !posts.is_empty() {
                (Vec::new(), dedup::prime(&posts, state))
            } else {
                let outcome = dedup::select_new(posts, state);
                (outcome.new_posts, outcome.high_water_changed)
            };

        if !new_posts.is_empty() {
            info!("@{name}: {count} new posts", count = new_posts.len());
        }

        for (idx, post) in new_posts.iter().rev().enumerate() {
            if idx > 0
                && !sleep_or_cancel(&self.clock, self.settings.delivery_gap, &self.shutdown).await
            {
                warn!("@{name}: shutdown requested, skipping remaining deliveries");
                break;
            }
            if self.dispatcher.deliver(post).await {
                self.stats.delivered += 1;
            } else {
                self.stats.failed_deliveries += 1;
            }
        }

        if changed {
            if let Some(id) = &state.last_seen_id {
                if let Err(e) = self.store.set_last_seen_id(name, id) {
                    error!("@{name}: failed to persist last seen id {id}: {e}");
                }
            }
        }
    }

    async fn wait_for_next_cycle(&self) -> bool {
        let mut remaining = self.settings.poll_interval;
        while !remaining.is_zero() {
            let slice = remaining.min(WAIT_SLICE);
            if !sleep_or_cancel(&self.clock, slice, &self.shutdown).await {
                return false;
            }
            remaining -= slice;
        }
        !self.shutdown.is_cancelled()
    }

    async fn apply_config_update(&mut self) {
        let Some(rx) = self.config_rx.as_mut() else {
            return;
        };
        if !rx.has_changed().unwrap_or(false) {
            return;
        }
        let next = rx.borrow_and_update().clone();
        self.apply_config(next).await;
    }

    /// Swap in a new configuration snapshot
    pub async fn apply_config(&mut self, next: Arc<Config>) {
        if *next == *self.config {
            return;
        }

        for name in &next.accounts {
            if !self.accounts.contains_key(name) {
                info!("Now watching @{name}");
                let state =
                    AccountPollState::restored(name.clone(), self.store.get_last_seen_id(name));
                self.accounts.insert(name.clone(), state);
            }
        }

        let removed: Vec<String> = self
            .accounts
            .keys()
            .filter(|name| !next.accounts.contains(name))
            .cloned()
            .collect();
        for name in removed {
            info!("No longer watching @{name}");
            self.accounts.remove(&name);
            if let Err(e) = self.store.remove(&name) {
                error!("@{name}: failed to drop persisted state: {e}");
            }
        }

        self.order = next.accounts.clone();
        self.orchestrator
            .throttle()
            .set_min_request_interval(next.global_min_request_interval);
        let policy = self.orchestrator.policy().clone().with_config(&next);
        self.orchestrator.set_policy(policy);
        self.settings.poll_interval = next.poll_interval;
        self.settings.suppress_existing_on_start = next.suppress_existing_on_start;
        self.dispatcher
            .set_utc_offset_hours(next.display_utc_offset_hours);

        if next.state_file != self.config.state_file {
            warn!(
                "STATE_FILE changed to {path}; restart to use it",
                path = next.state_file.display()
            );
        }

        self.config = next;
        info!("Configuration reloaded");
        if !self.dispatcher.announce(&reload_notice(&self.order)).await {
            warn!("Reload notice could not be delivered");
        }
    }
}
