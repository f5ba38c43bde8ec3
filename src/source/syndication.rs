use super::{FetchError, FetchResult, PrimarySource};
use crate::post::{Media, MediaKind, Post, PostId};
use crate::error_utils::create_http_client_with_timeout;
use anyhow::Result;
use futures_util::future::BoxFuture;
use rand::seq::IndexedRandom;
use regex::Regex;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{LazyLock, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

pub const SYNDICATION_BASE: &str = "https://syndication.twitter.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_DATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<script id="__NEXT_DATA__" type="application/json">(.*?)</script>"#)
        .expect("embedded data pattern is valid")
});

static STATUS_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/status/(\d+)").expect("status link pattern is valid"));

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Timeline scraper for the public syndication endpoint
pub struct SyndicationSource {
    client: Client,
    base_url: String,
    user_agent: RwLock<&'static str>,
}

impl SyndicationSource {
    pub fn new() -> Result<Self> {
        Self::with_base_url(SYNDICATION_BASE)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = create_http_client_with_timeout(REQUEST_TIMEOUT)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: RwLock::new(pick_user_agent()),
        })
    }

    fn timeline_url(&self, account: &str) -> String {
        format!(
            "{base}/srv/timeline-profile/screen-name/{account}",
            base = self.base_url
        )
    }

    fn current_user_agent(&self) -> &'static str {
        *self.user_agent.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_timeline(&self, account: &str) -> FetchResult {
        let url = self.timeline_url(account);
        debug!(%url, "Requesting syndication timeline for @{account}");

        let response = self
            .client
            .get(&url)
            .header(header::USER_AGENT, self.current_user_agent())
            .header(
                header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.5")
            .send()
            .await
            .map_err(|e| FetchError::from_request(&e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!(
                "syndication endpoint answered {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_request(&e))?;

        parse_timeline_html(&body, account)
    }
}

impl PrimarySource for SyndicationSource {
    fn fetch<'a>(&'a self, account: &'a str) -> BoxFuture<'a, FetchResult> {
        Box::pin(self.fetch_timeline(account))
    }

    fn rotate_identity(&self) {
        let next = pick_user_agent();
        *self.user_agent.write().unwrap_or_else(PoisonError::into_inner) = next;
        debug!("Rotated syndication user agent");
    }
}

fn pick_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Extract posts from a syndication timeline page.
///
/// The page embeds its data as `__NEXT_DATA__` JSON. Pages without it are
/// scraped for status links instead, which yields posts without text.
pub fn parse_timeline_html(html: &str, account: &str) -> FetchResult {
    let Some(captures) = NEXT_DATA.captures(html) else {
        debug!("@{account}: no embedded timeline data, scraping status links");
        return Ok(scrape_status_links(html, account));
    };

    let data: Value = serde_json::from_str(&captures[1])
        .map_err(|e| FetchError::Parse(format!("embedded timeline JSON: {e}")))?;

    let entries = data
        .pointer("/props/pageProps/timeline/entries")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Parse("timeline entries missing".to_string()))?;

    let posts = entries
        .iter()
        .filter_map(|entry| {
            let content = entry.get("content")?;
            let tweet = content.get("tweet")?;
            let content_pinned = content
                .get("is_pinned")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            extract_post(tweet, account, content_pinned)
        })
        .collect::<Vec<_>>();

    debug!("@{account}: parsed {count} posts", count = posts.len());
    Ok(posts)
}

fn extract_post(tweet: &Value, account: &str, content_pinned: bool) -> Option<Post> {
    let raw_id = tweet
        .get("id_str")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| tweet.get("id").map(json_scalar_to_string))?;

    let id: PostId = match raw_id.parse() {
        Ok(id) => id,
        Err(e) => {
            warn!("@{account}: skipping post with unusable id {raw_id:?}: {e}");
            return None;
        }
    };

    let text = tweet
        .get("full_text")
        .or_else(|| tweet.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let author = tweet
        .pointer("/user/screen_name")
        .and_then(Value::as_str)
        .unwrap_or(account)
        .to_string();

    let is_pinned = content_pinned
        || tweet
            .get("is_pinned")
            .and_then(Value::as_bool)
            .unwrap_or(false);

    Some(Post {
        canonical_url: canonical_url(account, &id),
        id,
        text,
        created_at: tweet
            .get("created_at")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        author,
        media: extract_media(tweet),
        is_pinned,
    })
}

fn json_scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn extract_media(tweet: &Value) -> Vec<Media> {
    let media_list = tweet
        .pointer("/extended_entities/media")
        .or_else(|| tweet.pointer("/entities/media"))
        .and_then(Value::as_array);

    let Some(media_list) = media_list else {
        return Vec::new();
    };

    media_list
        .iter()
        .filter_map(|media| match media.get("type").and_then(Value::as_str)? {
            "photo" => media
                .get("media_url_https")
                .or_else(|| media.get("media_url"))
                .and_then(Value::as_str)
                .map(|url| Media {
                    kind: MediaKind::Photo,
                    url: url.to_string(),
                }),
            "video" | "animated_gif" => best_video_variant(media).map(|url| Media {
                kind: MediaKind::Video,
                url,
            }),
            _ => None,
        })
        .collect()
}

/// Highest-bitrate mp4 variant, else whatever variant comes first
fn best_video_variant(media: &Value) -> Option<String> {
    let variants = media.pointer("/video_info/variants")?.as_array()?;

    variants
        .iter()
        .filter(|v| v.get("content_type").and_then(Value::as_str) == Some("video/mp4"))
        .filter_map(|v| {
            let url = v.get("url").and_then(Value::as_str)?;
            let bitrate = v.get("bitrate").and_then(Value::as_u64).unwrap_or(0);
            Some((bitrate, url))
        })
        .max_by_key(|(bitrate, _)| *bitrate)
        .map(|(_, url)| url.to_string())
        .or_else(|| {
            variants
                .first()
                .and_then(|v| v.get("url"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

fn scrape_status_links(html: &str, account: &str) -> Vec<Post> {
    let ids: BTreeSet<PostId> = STATUS_LINK
        .captures_iter(html)
        .filter_map(|c| c[1].parse().ok())
        .collect();

    ids.into_iter()
        .map(|id| Post {
            canonical_url: canonical_url(account, &id),
            id,
            text: String::new(),
            created_at: String::new(),
            author: account.to_string(),
            media: Vec::new(),
            is_pinned: false,
        })
        .collect()
}

pub fn canonical_url(account: &str, id: &PostId) -> String {
    format!("https://twitter.com/{account}/status/{id}")
}
