//! Notification rendering and the delivery strategy that drives a [`Transport`].

pub mod telegram;

use crate::datetime_utils::display_source_timestamp;
use crate::post::{Media, MediaKind, Post};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use telegram::TelegramTransport;

/// Characters MarkdownV2 treats as markup outside of code and links
const MARKDOWN_RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The transport answered and refused the request (bad markup, bad media, ...)
    #[error("Rejected by transport ({status}): {description}")]
    Rejected { status: u16, description: String },

    #[error("Transport failure: {0}")]
    Transport(String),
}

pub type DeliveryResult = Result<(), DeliveryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    MarkdownV2,
    Plain,
}

/// One photo of a media group; only the first item usually carries a caption
#[derive(Debug, Clone, PartialEq)]
pub struct GroupItem {
    pub url: String,
    pub caption: Option<String>,
}

/// Messaging backend used by the [`Dispatcher`]
pub trait Transport: Send + Sync {
    fn send_text<'a>(&'a self, text: &'a str, format: TextFormat) -> BoxFuture<'a, DeliveryResult>;

    fn send_media<'a>(
        &'a self,
        kind: MediaKind,
        url: &'a str,
        caption: Option<&'a str>,
        format: TextFormat,
    ) -> BoxFuture<'a, DeliveryResult>;

    fn send_media_group<'a>(
        &'a self,
        items: &'a [GroupItem],
        format: TextFormat,
    ) -> BoxFuture<'a, DeliveryResult>;

    /// Longest caption, in characters, a media message may carry
    fn caption_limit(&self) -> usize;

    /// Largest number of items accepted by one group send
    fn max_group_size(&self) -> usize {
        10
    }
}

/// A message in both its rich and plain renderings
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub rich: String,
    pub plain: String,
}

impl RenderedMessage {
    /// Length used for caption decisions
    pub fn len(&self) -> usize {
        self.rich.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.rich.is_empty()
    }
}

/// Escape every MarkdownV2 reserved character
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Inside a link target only `)` and `\` need escaping
fn escape_link_target(url: &str) -> String {
    url.replace('\\', "\\\\").replace(')', "\\)")
}

pub fn render_post(post: &Post, utc_offset_hours: i32) -> RenderedMessage {
    let body = post.text.trim();
    let time = (!post.created_at.trim().is_empty())
        .then(|| display_source_timestamp(&post.created_at, utc_offset_hours));

    let mut rich = format!(
        "🐦 *@{author}* posted\n\n",
        author = escape_markdown(&post.author)
    );
    let mut plain = format!("🐦 @{author} posted\n\n", author = post.author);

    if !body.is_empty() {
        rich.push_str(&escape_markdown(body));
        rich.push_str("\n\n");
        plain.push_str(body);
        plain.push_str("\n\n");
    }

    rich.push_str(&format!(
        "🔗 [View original]({url})",
        url = escape_link_target(&post.canonical_url)
    ));
    plain.push_str(&format!("🔗 {url}", url = post.canonical_url));

    if let Some(time) = time {
        rich.push_str(&format!("\n⏰ {time}", time = escape_markdown(&time)));
        plain.push_str(&format!("\n⏰ {time}"));
    }

    RenderedMessage { rich, plain }
}

pub fn startup_notice(accounts: &[String]) -> RenderedMessage {
    let watching = accounts
        .iter()
        .map(|a| format!("@{a}"))
        .collect::<Vec<_>>()
        .join(", ");
    RenderedMessage {
        rich: format!(
            "🚀 *tweetwatch started*\n\nWatching: {watching}",
            watching = escape_markdown(&watching)
        ),
        plain: format!("🚀 tweetwatch started\n\nWatching: {watching}"),
    }
}

pub fn shutdown_notice() -> RenderedMessage {
    RenderedMessage {
        rich: "🛑 *tweetwatch stopped*".to_string(),
        plain: "🛑 tweetwatch stopped".to_string(),
    }
}

pub fn reload_notice(accounts: &[String]) -> RenderedMessage {
    let watching = accounts
        .iter()
        .map(|a| format!("@{a}"))
        .collect::<Vec<_>>()
        .join(", ");
    RenderedMessage {
        rich: format!(
            "🔄 *Configuration reloaded*\n\nWatching: {watching}",
            watching = escape_markdown(&watching)
        ),
        plain: format!("🔄 Configuration reloaded\n\nWatching: {watching}"),
    }
}

pub fn test_notice() -> RenderedMessage {
    RenderedMessage {
        rich: "🧪 *tweetwatch test message*".to_string(),
        plain: "🧪 tweetwatch test message".to_string(),
    }
}

/// How a post will be put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    TextOnly,
    SingleMedia,
    MediaGroup,
    /// Text first, then each media item without a caption
    Split,
}

/// Pick a delivery strategy from the message length and media composition
pub fn choose_strategy(
    message_len: usize,
    media: &[Media],
    caption_limit: usize,
    max_group_size: usize,
) -> Strategy {
    if media.is_empty() {
        return Strategy::TextOnly;
    }
    if message_len > caption_limit {
        return Strategy::Split;
    }
    if media.len() == 1 {
        return Strategy::SingleMedia;
    }
    if media.len() <= max_group_size && media.iter().all(|m| m.kind == MediaKind::Photo) {
        return Strategy::MediaGroup;
    }
    Strategy::Split
}

/// Delivers posts through a transport, degrading gracefully on failures
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    utc_offset_hours: i32,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, utc_offset_hours: i32) -> Self {
        Self {
            transport,
            utc_offset_hours,
        }
    }

    pub fn set_utc_offset_hours(&mut self, hours: i32) {
        self.utc_offset_hours = hours;
    }

    /// Deliver one post. Returns true when every send it attempted succeeded.
    pub async fn deliver(&self, post: &Post) -> bool {
        let message = render_post(post, self.utc_offset_hours);
        let strategy = choose_strategy(
            message.len(),
            &post.media,
            self.transport.caption_limit(),
            self.transport.max_group_size(),
        );
        debug!(
            "@{author}: delivering {id} as {strategy:?} ({count} media)",
            author = post.author,
            id = post.id,
            count = post.media.len()
        );

        let delivered = match strategy {
            Strategy::TextOnly => self.send_text(&message).await,
            Strategy::SingleMedia => match post.media.first() {
                Some(media) => self.send_media(media, Some(&message)).await,
                None => self.send_text(&message).await,
            },
            Strategy::MediaGroup => {
                if self.send_group(&post.media, &message).await {
                    true
                } else {
                    warn!(
                        "@{author}: group send failed for {id}, splitting",
                        author = post.author,
                        id = post.id
                    );
                    self.send_split(&post.media, &message).await
                }
            }
            Strategy::Split => self.send_split(&post.media, &message).await,
        };

        if delivered {
            info!("@{author}: delivered post {id}", author = post.author, id = post.id);
        } else {
            error!(
                "@{author}: delivery of post {id} failed",
                author = post.author,
                id = post.id
            );
        }
        delivered
    }

    /// Send a service message (start-up, shutdown, reload)
    pub async fn announce(&self, message: &RenderedMessage) -> bool {
        self.send_text(message).await
    }

    async fn send_text(&self, message: &RenderedMessage) -> bool {
        match self
            .transport
            .send_text(&message.rich, TextFormat::MarkdownV2)
            .await
        {
            Ok(()) => true,
            Err(DeliveryError::Rejected { description, .. }) => {
                warn!("Rich text rejected ({description}), retrying as plain text");
                match self
                    .transport
                    .send_text(&message.plain, TextFormat::Plain)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Plain text send failed: {e}");
                        false
                    }
                }
            }
            Err(e) => {
                error!("Text send failed: {e}");
                false
            }
        }
    }

    async fn send_media(&self, media: &Media, caption: Option<&RenderedMessage>) -> bool {
        let Some(caption) = caption else {
            return match self
                .transport
                .send_media(media.kind, &media.url, None, TextFormat::Plain)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    error!("Sending {kind} {url} failed: {e}", kind = media.kind, url = media.url);
                    false
                }
            };
        };

        match self
            .transport
            .send_media(media.kind, &media.url, Some(&caption.rich), TextFormat::MarkdownV2)
            .await
        {
            Ok(()) => true,
            Err(DeliveryError::Rejected { description, .. }) => {
                warn!("Rich caption rejected ({description}), retrying as plain text");
                match self
                    .transport
                    .send_media(media.kind, &media.url, Some(&caption.plain), TextFormat::Plain)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Plain caption send of {url} failed: {e}", url = media.url);
                        false
                    }
                }
            }
            Err(e) => {
                error!("Sending {kind} {url} failed: {e}", kind = media.kind, url = media.url);
                false
            }
        }
    }

    async fn send_group(&self, media: &[Media], message: &RenderedMessage) -> bool {
        let items: Vec<GroupItem> = media
            .iter()
            .enumerate()
            .map(|(idx, m)| GroupItem {
                url: m.url.clone(),
                caption: (idx == 0).then(|| message.rich.clone()),
            })
            .collect();

        match self
            .transport
            .send_media_group(&items, TextFormat::MarkdownV2)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Media group send failed: {e}");
                false
            }
        }
    }

    async fn send_split(&self, media: &[Media], message: &RenderedMessage) -> bool {
        let mut ok = self.send_text(message).await;
        for item in media {
            ok = self.send_media(item, None).await && ok;
        }
        ok
    }
}
