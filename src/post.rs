use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PostIdError {
    #[error("Post id is empty")]
    Empty,

    #[error("Post id contains non-digit characters: {0}")]
    NotNumeric(String),
}

/// Numeric post identifier of unbounded width.
///
/// Snowflake ids keep growing, so they are stored as canonical decimal
/// digits (no leading zeros) and ordered by value: a longer id is always
/// the larger one, equal lengths compare digit by digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PostId(String);

impl PostId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PostId {
    type Err = PostIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PostIdError::Empty);
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PostIdError::NotNumeric(trimmed.to_string()));
        }

        let canonical = trimmed.trim_start_matches('0');
        if canonical.is_empty() {
            Ok(Self("0".to_string()))
        } else {
            Ok(Self(canonical.to_string()))
        }
    }
}

impl TryFrom<String> for PostId {
    type Error = PostIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PostId> for String {
    fn from(id: PostId) -> Self {
        id.0
    }
}

impl Ord for PostId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for PostId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Photo => f.write_str("photo"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    pub url: String,
}

/// A normalized post as produced by a content source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,

    pub text: String,

    /// Timestamp exactly as the source supplied it
    #[serde(default)]
    pub created_at: String,

    pub author: String,

    pub canonical_url: String,

    /// Ordered attachments; empty when the source carries no media data
    #[serde(default)]
    pub media: Vec<Media>,

    #[serde(default)]
    pub is_pinned: bool,
}

impl Post {
    pub fn has_only_photos(&self) -> bool {
        self.media.iter().all(|m| m.kind == MediaKind::Photo)
    }
}
