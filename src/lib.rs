//! Watch social-media timelines and relay new posts to a Telegram chat.
//!
//! The pieces fit together as follows: a [`coordinator::Coordinator`] walks
//! the configured accounts, asks the [`fetch::FetchOrchestrator`] for their
//! latest posts (paced by the shared [`throttle::GlobalThrottle`]), filters
//! them through [`dedup`], and hands new ones to a [`notify::Dispatcher`].
//! High-water marks survive restarts through [`state::StateStore`].

pub mod account;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod datetime_utils;
pub mod dedup;
pub mod error_utils;
pub mod fetch;
pub mod notify;
pub mod post;
pub mod source;
pub mod state;
pub mod throttle;
