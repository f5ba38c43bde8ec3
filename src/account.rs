use crate::post::PostId;
use std::collections::BTreeSet;
use std::time::Instant;

/// Upper bound on remembered ids per account
pub const MAX_SEEN_IDS: usize = 512;

/// Per-account polling state, owned by the poll coordinator.
///
/// Dedup fields (`last_seen_id`, `seen_ids`) are only touched by the dedup
/// engine; timing fields only by the fetch orchestrator.
#[derive(Debug, Clone)]
pub struct AccountPollState {
    pub account_id: String,

    /// High-water mark; never decreases once set
    pub last_seen_id: Option<PostId>,

    /// Ids already observed, ordered by numeric value
    pub seen_ids: BTreeSet<PostId>,

    pub last_fetch_at: Option<Instant>,
    pub backoff_until: Option<Instant>,
    pub consecutive_rate_limit_hits: u32,
}

impl AccountPollState {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            last_seen_id: None,
            seen_ids: BTreeSet::new(),
            last_fetch_at: None,
            backoff_until: None,
            consecutive_rate_limit_hits: 0,
        }
    }

    /// State resumed from a persisted high-water mark
    pub fn restored(account_id: impl Into<String>, last_seen_id: Option<PostId>) -> Self {
        let mut state = Self::new(account_id);
        if let Some(id) = last_seen_id {
            state.seen_ids.insert(id.clone());
            state.last_seen_id = Some(id);
        }
        state
    }

    /// True until anything about this account has been observed
    pub fn is_fresh(&self) -> bool {
        self.last_seen_id.is_none() && self.seen_ids.is_empty()
    }

    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }

    /// Move the high-water mark forward; lower candidates are ignored.
    ///
    /// Returns whether the mark changed.
    pub fn advance_last_seen(&mut self, candidate: &PostId) -> bool {
        match &self.last_seen_id {
            Some(current) if current >= candidate => false,
            _ => {
                self.last_seen_id = Some(candidate.clone());
                true
            }
        }
    }

    /// Extend the account backoff window, never shortening it
    pub fn extend_backoff(&mut self, until: Instant) {
        if self.backoff_until.is_none_or(|current| current < until) {
            self.backoff_until = Some(until);
        }
    }

    /// Drop the lowest ids beyond [`MAX_SEEN_IDS`], keeping the high-water mark.
    pub fn prune_seen(&mut self) {
        while self.seen_ids.len() > MAX_SEEN_IDS {
            let Some(lowest) = self.seen_ids.first().cloned() else {
                break;
            };
            if self.last_seen_id.as_ref() == Some(&lowest) {
                break;
            }
            self.seen_ids.remove(&lowest);
        }
    }
}
