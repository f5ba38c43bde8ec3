use super::{DeliveryError, DeliveryResult, GroupItem, TextFormat, Transport};
use crate::error_utils::create_http_client_with_timeout;
use crate::post::MediaKind;
use anyhow::Result;
use futures_util::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

pub const CAPTION_LIMIT: usize = 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
struct Credentials {
    bot_token: String,
    chat_id: String,
    api_base: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    disable_web_page_preview: bool,
}

#[derive(Serialize)]
struct SendPhoto<'a> {
    chat_id: &'a str,
    photo: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
}

#[derive(Serialize)]
struct SendVideo<'a> {
    chat_id: &'a str,
    video: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    supports_streaming: bool,
}

#[derive(Serialize)]
struct InputMediaPhoto<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
}

#[derive(Serialize)]
struct SendMediaGroup<'a> {
    chat_id: &'a str,
    media: Vec<InputMediaPhoto<'a>>,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

fn parse_mode(format: TextFormat, has_text: bool) -> Option<&'static str> {
    match format {
        TextFormat::MarkdownV2 if has_text => Some("MarkdownV2"),
        _ => None,
    }
}

/// Telegram Bot API transport
pub struct TelegramTransport {
    client: Client,
    credentials: RwLock<Credentials>,
}

impl TelegramTransport {
    pub fn new(bot_token: &str, chat_id: &str, api_base: &str) -> Result<Self> {
        Ok(Self {
            client: create_http_client_with_timeout(REQUEST_TIMEOUT)?,
            credentials: RwLock::new(Credentials {
                bot_token: bot_token.to_string(),
                chat_id: chat_id.to_string(),
                api_base: api_base.trim_end_matches('/').to_string(),
            }),
        })
    }

    /// Swap credentials in place; later calls use the new values
    pub fn update_credentials(&self, bot_token: &str, chat_id: &str, api_base: &str) {
        let next = Credentials {
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        };
        let mut current = self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != next {
            if current.bot_token != next.bot_token {
                info!("Telegram bot token updated");
            }
            if current.chat_id != next.chat_id {
                info!("Telegram chat id updated");
            }
            *current = next;
        }
    }

    fn credentials(&self) -> Credentials {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn call<T: Serialize>(&self, method: &str, credentials: &Credentials, body: &T) -> DeliveryResult {
        let url = format!(
            "{base}/bot{token}/{method}",
            base = credentials.api_base,
            token = credentials.bot_token
        );
        debug!("Calling Telegram {method}");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            // Strip the URL so the token never ends up in logs
            .map_err(|e| DeliveryError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(DeliveryError::Transport(format!(
                "{method} answered {status}"
            )));
        }

        let reply: Option<ApiReply> = response.json().await.ok();
        let description = reply
            .as_ref()
            .and_then(|r| r.description.clone())
            .unwrap_or_else(|| status.to_string());

        if status.is_client_error() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                description,
            });
        }

        match reply {
            Some(reply) if reply.ok => Ok(()),
            _ => Err(DeliveryError::Rejected {
                status: status.as_u16(),
                description,
            }),
        }
    }

    async fn send_text_impl(&self, text: &str, format: TextFormat) -> DeliveryResult {
        let credentials = self.credentials();
        let body = SendMessage {
            chat_id: &credentials.chat_id,
            text,
            parse_mode: parse_mode(format, true),
            disable_web_page_preview: false,
        };
        self.call("sendMessage", &credentials, &body).await
    }

    async fn send_media_impl(
        &self,
        kind: MediaKind,
        url: &str,
        caption: Option<&str>,
        format: TextFormat,
    ) -> DeliveryResult {
        let credentials = self.credentials();
        let mode = parse_mode(format, caption.is_some());
        match kind {
            MediaKind::Photo => {
                let body = SendPhoto {
                    chat_id: &credentials.chat_id,
                    photo: url,
                    caption,
                    parse_mode: mode,
                };
                self.call("sendPhoto", &credentials, &body).await
            }
            MediaKind::Video => {
                let body = SendVideo {
                    chat_id: &credentials.chat_id,
                    video: url,
                    caption,
                    parse_mode: mode,
                    supports_streaming: true,
                };
                self.call("sendVideo", &credentials, &body).await
            }
        }
    }

    async fn send_media_group_impl(&self, items: &[GroupItem], format: TextFormat) -> DeliveryResult {
        let credentials = self.credentials();
        let media = items
            .iter()
            .map(|item| InputMediaPhoto {
                kind: "photo",
                media: &item.url,
                caption: item.caption.as_deref(),
                parse_mode: parse_mode(format, item.caption.is_some()),
            })
            .collect();
        let body = SendMediaGroup {
            chat_id: &credentials.chat_id,
            media,
        };
        self.call("sendMediaGroup", &credentials, &body).await
    }
}

impl Transport for TelegramTransport {
    fn send_text<'a>(&'a self, text: &'a str, format: TextFormat) -> BoxFuture<'a, DeliveryResult> {
        Box::pin(self.send_text_impl(text, format))
    }

    fn send_media<'a>(
        &'a self,
        kind: MediaKind,
        url: &'a str,
        caption: Option<&'a str>,
        format: TextFormat,
    ) -> BoxFuture<'a, DeliveryResult> {
        Box::pin(self.send_media_impl(kind, url, caption, format))
    }

    fn send_media_group<'a>(
        &'a self,
        items: &'a [GroupItem],
        format: TextFormat,
    ) -> BoxFuture<'a, DeliveryResult> {
        Box::pin(self.send_media_group_impl(items, format))
    }

    fn caption_limit(&self) -> usize {
        CAPTION_LIMIT
    }
}
