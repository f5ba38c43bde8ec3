use futures_util::future::BoxFuture;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use tweetwatch::clock::{Clock, ManualClock};
use tweetwatch::config::Config;
use tweetwatch::coordinator::{Coordinator, CoordinatorSettings};
use tweetwatch::fetch::{FetchOrchestrator, FetchPolicy};
use tweetwatch::notify::{DeliveryError, DeliveryResult, Dispatcher, GroupItem, TextFormat, Transport};
use tweetwatch::post::{Media, MediaKind, Post, PostId};
use tweetwatch::source::{FetchResult, PrimarySource};
use tweetwatch::state::StateStore;
use tweetwatch::throttle::GlobalThrottle;

/// Serves whatever timeline the test put in place for each account
#[derive(Default)]
struct TimelineSource {
    timelines: Mutex<HashMap<String, Vec<Post>>>,
    calls: AtomicUsize,
    /// Request shutdown during the n-th fetch
    cancel_on_call: Option<(usize, CancellationToken)>,
}

impl TimelineSource {
    fn set(&self, account: &str, posts: Vec<Post>) {
        self.timelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.to_string(), posts);
    }

    fn push(&self, account: &str, post: Post) {
        self.timelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(account.to_string())
            .or_default()
            .push(post);
    }
}

impl PrimarySource for TimelineSource {
    fn fetch<'a>(&'a self, account: &'a str) -> BoxFuture<'a, FetchResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = &self.cancel_on_call {
            if call == *at {
                token.cancel();
            }
        }
        let posts = self
            .timelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(posts) })
    }

    fn rotate_identity(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Text(String),
    Media(MediaKind, String),
    Group(usize),
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    fn record(&self, sent: Sent) -> DeliveryResult {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sent);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Transport("connection reset".to_string()));
        }
        Ok(())
    }

    fn sent(&self) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send_text<'a>(&'a self, text: &'a str, _format: TextFormat) -> BoxFuture<'a, DeliveryResult> {
        let result = self.record(Sent::Text(text.to_string()));
        Box::pin(async move { result })
    }

    fn send_media<'a>(
        &'a self,
        kind: MediaKind,
        url: &'a str,
        _caption: Option<&'a str>,
        _format: TextFormat,
    ) -> BoxFuture<'a, DeliveryResult> {
        let result = self.record(Sent::Media(kind, url.to_string()));
        Box::pin(async move { result })
    }

    fn send_media_group<'a>(
        &'a self,
        items: &'a [GroupItem],
        _format: TextFormat,
    ) -> BoxFuture<'a, DeliveryResult> {
        let result = self.record(Sent::Group(items.len()));
        Box::pin(async move { result })
    }

    fn caption_limit(&self) -> usize {
        1024
    }
}

fn post(account: &str, id: &str) -> Post {
    Post {
        id: id.parse::<PostId>().unwrap(),
        text: format!("post number {id}"),
        created_at: "Wed Oct 10 20:19:24 +0000 2018".to_string(),
        author: account.to_string(),
        canonical_url: format!("https://twitter.com/{account}/status/{id}"),
        media: Vec::new(),
        is_pinned: false,
    }
}

fn config(accounts: &str, state_file: &Path, suppress: bool) -> Arc<Config> {
    let state_file = state_file.display().to_string();
    let suppress = suppress.to_string();
    let accounts = accounts.to_string();
    Arc::new(
        Config::from_lookup(|key| match key {
            "ACCOUNTS" => Some(accounts.clone()),
            "STATE_FILE" => Some(state_file.clone()),
            "SUPPRESS_EXISTING_ON_START" => Some(suppress.clone()),
            "TELEGRAM_BOT_TOKEN" => Some("123:abc".to_string()),
            "TELEGRAM_CHAT_ID" => Some("-100".to_string()),
            _ => None,
        })
        .unwrap(),
    )
}

struct World {
    clock: Arc<ManualClock>,
    source: Arc<TimelineSource>,
    transport: Arc<RecordingTransport>,
    shutdown: CancellationToken,
    coordinator: Coordinator,
}

fn world(config: Arc<Config>, source: Arc<TimelineSource>, shutdown: CancellationToken) -> World {
    let clock = Arc::new(ManualClock::new());
    let transport = Arc::new(RecordingTransport::default());
    let policy = FetchPolicy::from_config(&config);
    let settings = CoordinatorSettings::from_config(&config);
    let coordinator = coordinator(
        config,
        source.clone(),
        transport.clone(),
        clock.clone(),
        shutdown.clone(),
        policy,
        settings,
    );

    World {
        clock,
        source,
        transport,
        shutdown,
        coordinator,
    }
}

fn coordinator(
    config: Arc<Config>,
    source: Arc<TimelineSource>,
    transport: Arc<RecordingTransport>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    policy: FetchPolicy,
    settings: CoordinatorSettings,
) -> Coordinator {
    let throttle = Arc::new(GlobalThrottle::new(
        clock.clone(),
        config.global_min_request_interval,
    ));
    let orchestrator = FetchOrchestrator::new(
        source,
        None,
        throttle,
        clock.clone(),
        policy,
        shutdown.clone(),
    );
    let dispatcher = Dispatcher::new(transport, config.display_utc_offset_hours);
    let store = StateStore::load(&config.state_file);

    Coordinator::new(config, orchestrator, dispatcher, store, clock, shutdown).with_settings(settings)
}

/// No random pauses, a 5 s poll interval and no per-account floor
fn tight_timing(config: &Config) -> (FetchPolicy, CoordinatorSettings) {
    let policy = FetchPolicy {
        min_user_interval: Duration::ZERO,
        request_jitter: (Duration::ZERO, Duration::ZERO),
        ..FetchPolicy::from_config(config)
    };
    let settings = CoordinatorSettings {
        poll_interval: Duration::from_secs(5),
        account_jitter: (Duration::ZERO, Duration::ZERO),
        ..CoordinatorSettings::from_config(config)
    };
    (policy, settings)
}

/// Manual clock that requests shutdown on its n-th sleep
struct CancelOnSleep {
    inner: Arc<ManualClock>,
    remaining: AtomicUsize,
    shutdown: CancellationToken,
}

impl Clock for CancelOnSleep {
    fn now(&self) -> Instant {
        self.inner.now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shutdown.cancel();
        }
        self.inner.sleep(duration)
    }
}

fn stored_id(path: &Path, account: &str) -> Option<PostId> {
    StateStore::load(path).get_last_seen_id(account)
}

#[tokio::test]
async fn test_existing_posts_are_suppressed_then_new_ones_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("seen_posts.json");

    let source = Arc::new(TimelineSource::default());
    source.set("alice", vec![post("alice", "100"), post("alice", "101")]);
    source.set("bob", vec![post("bob", "500")]);

    let mut w = world(
        config("alice,bob", &state_file, true),
        source,
        CancellationToken::new(),
    );

    w.coordinator.run_cycle().await;
    assert!(w.transport.sent().is_empty());
    assert_eq!(stored_id(&state_file, "alice"), Some("101".parse().unwrap()));
    assert_eq!(stored_id(&state_file, "bob"), Some("500".parse().unwrap()));

    w.source.push("alice", post("alice", "102"));
    w.source.push("alice", post("alice", "103"));
    w.clock.advance(Duration::from_secs(61));
    w.coordinator.run_cycle().await;

    let texts = w.transport.texts();
    assert_eq!(texts.len(), 2);
    assert!(texts[0].contains("post number 102"));
    assert!(texts[1].contains("post number 103"));
    assert_eq!(stored_id(&state_file, "alice"), Some("103".parse().unwrap()));

    let stats = w.coordinator.stats();
    assert_eq!(stats.cycles, 2);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.failed_deliveries, 0);
    assert_eq!(w.source.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_first_contact_without_suppression_delivers_only_the_newest() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("seen_posts.json");

    let mut pinned = post("alice", "50");
    pinned.is_pinned = true;
    let source = Arc::new(TimelineSource::default());
    source.set(
        "alice",
        vec![pinned, post("alice", "199"), post("alice", "200")],
    );

    let mut w = world(
        config("alice", &state_file, false),
        source,
        CancellationToken::new(),
    );
    w.coordinator.run_cycle().await;

    let texts = w.transport.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("post number 200"));
    assert_eq!(stored_id(&state_file, "alice"), Some("200".parse().unwrap()));

    // Nothing new on the next cycle
    w.clock.advance(Duration::from_secs(61));
    w.coordinator.run_cycle().await;
    assert_eq!(w.transport.texts().len(), 1);
}

#[tokio::test]
async fn test_restart_resumes_from_stored_high_water_mark() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("seen_posts.json");
    StateStore::load(&state_file)
        .set_last_seen_id("alice", &"101".parse().unwrap())
        .unwrap();

    let source = Arc::new(TimelineSource::default());
    let mut with_photos = post("alice", "103");
    with_photos.media = vec![
        Media {
            kind: MediaKind::Photo,
            url: "https://img.example/1.jpg".to_string(),
        },
        Media {
            kind: MediaKind::Photo,
            url: "https://img.example/2.jpg".to_string(),
        },
    ];
    source.set(
        "alice",
        vec![
            post("alice", "100"),
            post("alice", "101"),
            post("alice", "102"),
            with_photos,
        ],
    );

    let mut w = world(
        config("alice", &state_file, true),
        source,
        CancellationToken::new(),
    );
    w.coordinator.run_cycle().await;

    let sent = w.transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0], Sent::Text(text) if text.contains("post number 102")));
    assert_eq!(sent[1], Sent::Group(2));
    assert_eq!(stored_id(&state_file, "alice"), Some("103".parse().unwrap()));

    // One second between the two deliveries
    assert!(w.clock.sleeps().contains(&Duration::from_secs(1)));
}

#[tokio::test]
async fn test_run_announces_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("seen_posts.json");

    let shutdown = CancellationToken::new();
    let source = Arc::new(TimelineSource {
        cancel_on_call: Some((1, shutdown.clone())),
        ..TimelineSource::default()
    });
    source.set("alice", vec![post("alice", "100")]);

    let mut w = world(config("alice,bob", &state_file, true), source, shutdown);
    w.coordinator.run().await;

    assert!(w.shutdown.is_cancelled());
    // The first fetch requested shutdown, so the second account is never polled
    assert_eq!(w.source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(w.coordinator.stats().cycles, 1);

    let texts = w.transport.texts();
    assert_eq!(texts.len(), 2);
    assert!(texts[0].contains("tweetwatch started"));
    assert!(texts[1].contains("tweetwatch stopped"));
}

#[tokio::test]
async fn test_reload_adds_and_removes_accounts() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("seen_posts.json");

    let source = Arc::new(TimelineSource::default());
    source.set("alice", vec![post("alice", "100")]);
    source.set("bob", vec![post("bob", "200")]);

    let mut w = world(
        config("alice", &state_file, true),
        source,
        CancellationToken::new(),
    );
    w.coordinator.run_cycle().await;
    assert_eq!(stored_id(&state_file, "alice"), Some("100".parse().unwrap()));

    w.coordinator
        .apply_config(config("bob", &state_file, true))
        .await;
    assert_eq!(w.coordinator.accounts(), ["bob".to_string()]);
    assert!(w.coordinator.account("alice").is_none());
    assert_eq!(stored_id(&state_file, "alice"), None);
    assert!(w
        .transport
        .texts()
        .iter()
        .any(|t| t.contains("Configuration reloaded")));

    w.clock.advance(Duration::from_secs(61));
    w.coordinator.run_cycle().await;
    assert_eq!(stored_id(&state_file, "bob"), Some("200".parse().unwrap()));
}

#[tokio::test]
async fn test_failed_delivery_still_advances_the_mark() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("seen_posts.json");
    StateStore::load(&state_file)
        .set_last_seen_id("alice", &"101".parse().unwrap())
        .unwrap();

    let source = Arc::new(TimelineSource::default());
    source.set("alice", vec![post("alice", "101"), post("alice", "102")]);

    let mut w = world(
        config("alice", &state_file, true),
        source,
        CancellationToken::new(),
    );
    w.transport.failing.store(true, Ordering::SeqCst);
    w.coordinator.run_cycle().await;

    assert_eq!(w.transport.sent().len(), 1);
    assert_eq!(w.coordinator.stats().failed_deliveries, 1);
    assert_eq!(w.coordinator.stats().delivered, 0);
    assert_eq!(stored_id(&state_file, "alice"), Some("102".parse().unwrap()));

    // The failed post is not retried once the transport recovers
    w.transport.failing.store(false, Ordering::SeqCst);
    w.clock.advance(Duration::from_secs(61));
    w.coordinator.run_cycle().await;
    assert_eq!(w.transport.sent().len(), 1);
    assert_eq!(w.coordinator.stats().failed_deliveries, 1);
}

#[tokio::test]
async fn test_interval_wait_is_sliced_into_seconds() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("seen_posts.json");
    let config = config("alice", &state_file, true);
    let (policy, settings) = tight_timing(&config);

    let shutdown = CancellationToken::new();
    let source = Arc::new(TimelineSource {
        cancel_on_call: Some((2, shutdown.clone())),
        ..TimelineSource::default()
    });
    let clock = Arc::new(ManualClock::new());
    let mut coordinator = coordinator(
        config,
        source.clone(),
        Arc::new(RecordingTransport::default()),
        clock.clone(),
        shutdown.clone(),
        policy,
        settings,
    );

    coordinator.run().await;

    assert_eq!(coordinator.stats().cycles, 2);
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    // One 5 s interval between the two cycles, waited out in 1 s slices
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(1); 5]);
    assert_eq!(clock.elapsed(), Duration::from_secs(5));
}

#[tokio::test]
async fn test_shutdown_mid_wait_ends_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("seen_posts.json");
    let config = config("alice", &state_file, true);
    let (policy, settings) = tight_timing(&config);

    let shutdown = CancellationToken::new();
    let source = Arc::new(TimelineSource::default());
    let manual = Arc::new(ManualClock::new());
    let clock = Arc::new(CancelOnSleep {
        inner: manual.clone(),
        remaining: AtomicUsize::new(3),
        shutdown: shutdown.clone(),
    });
    let mut coordinator = coordinator(
        config,
        source.clone(),
        Arc::new(RecordingTransport::default()),
        clock,
        shutdown.clone(),
        policy,
        settings,
    );

    coordinator.run().await;

    assert!(shutdown.is_cancelled());
    assert_eq!(coordinator.stats().cycles, 1);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    // Three of the five one-second slices, then the stop is honored
    assert_eq!(manual.sleeps(), vec![Duration::from_secs(1); 3]);
    assert!(manual.elapsed() < Duration::from_secs(5));
}
