use super::{FallbackSource, FetchError, FetchResult};
use crate::post::{Post, PostId};
use crate::source::syndication::canonical_url;
use crate::error_utils::create_http_client_with_timeout;
use anyhow::Result;
use futures_util::future::BoxFuture;
use regex::Regex;
use reqwest::Client;
use std::sync::{LazyLock, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

static STATUS_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/status/(\d+)").expect("status id pattern is valid"));
static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern is valid"));

#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    timeout: Duration,
}

/// Fallback source backed by an RSSHub-style feed.
///
/// Feeds carry no media, so every post it yields is text only.
pub struct RssHubSource {
    client: Client,
    endpoint: RwLock<Endpoint>,
}

impl RssHubSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = create_http_client_with_timeout(timeout)?;

        Ok(Self {
            client,
            endpoint: RwLock::new(Endpoint {
                base_url: base_url.trim().trim_end_matches('/').to_string(),
                timeout,
            }),
        })
    }

    /// Point the source at a different instance or timeout
    pub fn update(&self, base_url: &str, timeout: Duration) {
        let mut endpoint = self.endpoint.write().unwrap_or_else(PoisonError::into_inner);
        endpoint.base_url = base_url.trim().trim_end_matches('/').to_string();
        endpoint.timeout = timeout;
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn fetch_feed(&self, account: &str) -> FetchResult {
        let endpoint = self.endpoint();
        if endpoint.base_url.is_empty() {
            return Err(FetchError::Unavailable(
                "no fallback base URL configured".to_string(),
            ));
        }

        let url = format!("{base}/twitter/user/{account}", base = endpoint.base_url);
        debug!(%url, "Requesting fallback feed for @{account}");

        let response = self
            .client
            .get(&url)
            .timeout(endpoint.timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_request(&e))?;

        if !response.status().is_success() {
            return Err(FetchError::Transient(format!(
                "fallback feed answered {status}",
                status = response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_request(&e))?;

        parse_feed(&body, account)
    }
}

impl FallbackSource for RssHubSource {
    fn fetch<'a>(&'a self, account: &'a str) -> BoxFuture<'a, FetchResult> {
        Box::pin(self.fetch_feed(account))
    }
}

/// Turn an RSS/Atom document into text-only posts
pub fn parse_feed(body: &[u8], account: &str) -> FetchResult {
    let feed = feed_rs::parser::parse(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    let mut posts = Vec::new();
    for entry in feed.entries {
        let link = entry.links.first().map(|l| l.href.as_str()).unwrap_or("");
        let id_source = [entry.id.as_str(), link]
            .into_iter()
            .find_map(|candidate| STATUS_ID.captures(candidate).map(|c| c[1].to_string()));

        let Some(raw_id) = id_source else {
            warn!("@{account}: fallback entry without a status id: {id}", id = entry.id);
            continue;
        };
        let Ok(id) = raw_id.parse::<PostId>() else {
            continue;
        };

        let html = entry
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
            .or_else(|| entry.title.as_ref().map(|t| t.content.clone()))
            .unwrap_or_default();

        let text = strip_html(&html);
        let created_at = entry
            .published
            .or(entry.updated)
            .map(|dt| dt.to_rfc2822())
            .unwrap_or_default();

        posts.push(Post {
            canonical_url: canonical_url(account, &id),
            id,
            text,
            created_at,
            author: account.to_string(),
            media: Vec::new(),
            is_pinned: false,
        });
    }

    debug!("@{account}: fallback feed yielded {count} posts", count = posts.len());
    Ok(posts)
}

fn strip_html(html: &str) -> String {
    let with_breaks = html.replace("<br>", "\n").replace("<br/>", "\n").replace("<br />", "\n");
    let stripped = TAGS.replace_all(&with_breaks, "");
    html_escape::decode_html_entities(stripped.trim()).into_owned()
}
