//! Content sources that turn an account name into normalized posts.

pub mod rsshub;
pub mod syndication;

use crate::post::Post;
use futures_util::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

pub use rsshub::RssHubSource;
pub use syndication::SyndicationSource;

/// Failure classes a source can report
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Rate limited by source (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient fetch error: {0}")]
    Transient(String),

    #[error("Malformed source payload: {0}")]
    Parse(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    /// Classify a transport-level `reqwest` failure
    pub fn from_request(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Parse(err.to_string())
        } else {
            FetchError::Transient(err.to_string())
        }
    }
}

pub type FetchResult = Result<Vec<Post>, FetchError>;

/// The preferred, rate-limited source
pub trait PrimarySource: Send + Sync {
    fn fetch<'a>(&'a self, account: &'a str) -> BoxFuture<'a, FetchResult>;

    /// Switch to a different client identity after a rate-limit signal
    fn rotate_identity(&self);
}

/// Secondary source consulted when the primary is exhausted or cooling down.
///
/// Results may carry no media.
pub trait FallbackSource: Send + Sync {
    fn fetch<'a>(&'a self, account: &'a str) -> BoxFuture<'a, FetchResult>;
}
