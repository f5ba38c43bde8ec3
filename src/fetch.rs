//! Per-account fetch orchestration.
//!
//! A fetch walks an explicit retry state machine against the primary
//! source (`Attempting -> Waiting -> Retrying -> Attempting`, or
//! `Escalating` to the fallback source). All waiting goes through the
//! injected [`Clock`], so the policy is testable without real time passing.

use crate::account::AccountPollState;
use crate::clock::{random_between, sleep_or_cancel, Clock};
use crate::config::Config;
use crate::post::Post;
use crate::source::{FallbackSource, FetchError, PrimarySource};
use crate::throttle::GlobalThrottle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Knobs for one orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPolicy {
    /// Hard floor between two fetches of the same account
    pub min_user_interval: Duration,
    pub max_attempts: u32,
    /// Random delay drawn before every primary attempt
    pub request_jitter: (Duration, Duration),
    pub transient_retry_delay: Duration,
    pub rate_limit_base_delay: Duration,
    /// Upper bound of the random extra added to each rate-limit wait
    pub rate_limit_jitter: Duration,
    pub rate_limit_backoff_max: Duration,
    pub fallback_enabled: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            min_user_interval: Duration::from_secs(60),
            max_attempts: 3,
            request_jitter: (Duration::from_secs(1), Duration::from_secs(3)),
            transient_retry_delay: Duration::from_secs(2),
            rate_limit_base_delay: Duration::from_secs(15),
            rate_limit_jitter: Duration::from_secs(5),
            rate_limit_backoff_max: Duration::from_secs(300),
            fallback_enabled: false,
        }
    }
}

impl FetchPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self::default().with_config(config)
    }

    /// Take the configurable knobs from `config`, keeping the rest
    pub fn with_config(self, config: &Config) -> Self {
        Self {
            min_user_interval: config.min_user_interval,
            rate_limit_backoff_max: config.rate_limit_backoff_max,
            fallback_enabled: config.fallback_enabled,
            ..self
        }
    }

    /// Wait imposed after the `hits`-th consecutive rate-limit signal:
    /// `min(base * 2^(hits-1) + jitter, max)`.
    pub fn rate_limit_wait(&self, hits: u32, jitter: Duration) -> Duration {
        let exponent = hits.saturating_sub(1).min(31);
        let scaled = self
            .rate_limit_base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX);
        scaled
            .saturating_add(jitter)
            .min(self.rate_limit_backoff_max)
    }
}

/// Why the primary source was abandoned for this fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Cooldown,
    RateLimited,
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    Attempting { attempt: u32 },
    Waiting { attempt: u32, delay: Duration },
    Retrying { attempt: u32 },
    Escalating(Escalation),
}

impl RetryState {
    /// Transition taken after attempt number `attempt` failed transiently
    pub fn after_transient(attempt: u32, policy: &FetchPolicy) -> Self {
        if attempt >= policy.max_attempts {
            RetryState::Escalating(Escalation::RetriesExhausted)
        } else {
            RetryState::Waiting {
                attempt,
                delay: policy.transient_retry_delay,
            }
        }
    }
}

pub struct FetchOrchestrator {
    primary: Arc<dyn PrimarySource>,
    fallback: Option<Arc<dyn FallbackSource>>,
    throttle: Arc<GlobalThrottle>,
    clock: Arc<dyn Clock>,
    policy: FetchPolicy,
    shutdown: CancellationToken,
}

impl FetchOrchestrator {
    pub fn new(
        primary: Arc<dyn PrimarySource>,
        fallback: Option<Arc<dyn FallbackSource>>,
        throttle: Arc<GlobalThrottle>,
        clock: Arc<dyn Clock>,
        policy: FetchPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            primary,
            fallback,
            throttle,
            clock,
            policy,
            shutdown,
        }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: FetchPolicy) {
        self.policy = policy;
    }

    pub fn throttle(&self) -> &Arc<GlobalThrottle> {
        &self.throttle
    }

    /// Fetch the latest posts for one account.
    ///
    /// Never fails: every unrecoverable path yields an empty list. Only the
    /// timing fields of `state` are touched.
    pub async fn fetch(&self, state: &mut AccountPollState) -> Vec<Post> {
        let account = state.account_id.clone();
        let now = self.clock.now();

        if self.throttle.in_global_cooldown() || state.is_backing_off(now) {
            info!(
                "@{account}: cooling down (global {global:?}), skipping primary source",
                global = self.throttle.cooldown_remaining()
            );
            return self.fetch_fallback(state, Escalation::Cooldown).await;
        }

        if let Some(last) = state.last_fetch_at {
            let since = now.saturating_duration_since(last);
            if since < self.policy.min_user_interval {
                trace!("@{account}: fetched {since:?} ago, below the per-account floor");
                return Vec::new();
            }
        }

        let mut machine = RetryState::Attempting { attempt: 1 };
        loop {
            machine = match machine {
                RetryState::Attempting { attempt } => {
                    let jitter = random_between(self.policy.request_jitter.0, self.policy.request_jitter.1);
                    if !sleep_or_cancel(&self.clock, jitter, &self.shutdown).await {
                        return Vec::new();
                    }
                    self.throttle.acquire_slot().await;
                    if self.shutdown.is_cancelled() {
                        return Vec::new();
                    }

                    match self.primary.fetch(&account).await {
                        Ok(posts) => {
                            state.consecutive_rate_limit_hits = 0;
                            state.backoff_until = None;
                            state.last_fetch_at = Some(self.clock.now());
                            debug!(
                                "@{account}: primary source returned {count} posts",
                                count = posts.len()
                            );
                            return posts;
                        }
                        Err(FetchError::Parse(message)) => {
                            warn!("@{account}: discarding malformed response: {message}");
                            return Vec::new();
                        }
                        Err(FetchError::RateLimited { retry_after }) => {
                            self.record_rate_limit(state, retry_after);
                            RetryState::Escalating(Escalation::RateLimited)
                        }
                        Err(e) => {
                            warn!(
                                "@{account}: fetch failed (attempt {attempt}/{max}): {e}",
                                max = self.policy.max_attempts
                            );
                            RetryState::after_transient(attempt, &self.policy)
                        }
                    }
                }
                RetryState::Waiting { attempt, delay } => {
                    if !sleep_or_cancel(&self.clock, delay, &self.shutdown).await {
                        return Vec::new();
                    }
                    RetryState::Retrying {
                        attempt: attempt + 1,
                    }
                }
                RetryState::Retrying { attempt } => {
                    debug!("@{account}: retrying primary source (attempt {attempt})");
                    RetryState::Attempting { attempt }
                }
                RetryState::Escalating(reason) => {
                    return self.fetch_fallback(state, reason).await;
                }
            };
        }
    }

    /// Apply the backoff transition for a rate-limit signal; returns the wait.
    fn record_rate_limit(
        &self,
        state: &mut AccountPollState,
        retry_after: Option<Duration>,
    ) -> Duration {
        state.consecutive_rate_limit_hits = state.consecutive_rate_limit_hits.saturating_add(1);
        let hits = state.consecutive_rate_limit_hits;

        let jitter = random_between(Duration::ZERO, self.policy.rate_limit_jitter);
        let mut wait = self.policy.rate_limit_wait(hits, jitter);
        if let Some(hinted) = retry_after {
            wait = wait.max(hinted.min(self.policy.rate_limit_backoff_max));
        }

        state.extend_backoff(self.clock.now() + wait);
        self.throttle.signal_rate_limited(wait);
        self.primary.rotate_identity();

        warn!(
            "@{account}: rate limited ({hits} in a row), backing off for {secs:.1}s",
            account = state.account_id,
            secs = wait.as_secs_f64()
        );
        wait
    }

    async fn fetch_fallback(&self, state: &mut AccountPollState, reason: Escalation) -> Vec<Post> {
        let account = state.account_id.clone();

        let Some(fallback) = self.fallback.as_ref().filter(|_| self.policy.fallback_enabled)
        else {
            debug!("@{account}: no fallback source enabled ({reason:?})");
            return Vec::new();
        };
        if self.shutdown.is_cancelled() {
            return Vec::new();
        }

        info!("@{account}: using fallback source ({reason:?})");
        match fallback.fetch(&account).await {
            Ok(posts) => {
                state.last_fetch_at = Some(self.clock.now());
                debug!(
                    "@{account}: fallback source returned {count} posts",
                    count = posts.len()
                );
                posts
            }
            Err(e) => {
                warn!("@{account}: fallback source failed: {e}");
                Vec::new()
            }
        }
    }
}
