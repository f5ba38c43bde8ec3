use crate::clock::Clock;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Shared request gate for every account.
///
/// Enforces a minimum spacing between outbound primary-source requests and
/// carries the global cooldown raised by rate-limit responses. The lock only
/// guards timestamp bookkeeping; waiting happens after it is released.
pub struct GlobalThrottle {
    clock: Arc<dyn Clock>,
    state: Mutex<ThrottleState>,
}

#[derive(Debug)]
struct ThrottleState {
    min_request_interval: Duration,
    last_request_at: Option<Instant>,
    global_cooldown_until: Option<Instant>,
}

impl GlobalThrottle {
    pub fn new(clock: Arc<dyn Clock>, min_request_interval: Duration) -> Self {
        Self {
            clock,
            state: Mutex::new(ThrottleState {
                min_request_interval,
                last_request_at: None,
                global_cooldown_until: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the next request slot.
    ///
    /// The slot is reserved under the lock (so concurrent callers queue up
    /// behind each other) and the caller then sleeps until it is due.
    pub async fn acquire_slot(&self) {
        let wait = {
            let mut state = self.lock();
            let now = self.clock.now();
            let granted_at = match state.last_request_at {
                Some(last) => (last + state.min_request_interval).max(now),
                None => now,
            };
            state.last_request_at = Some(granted_at);
            granted_at.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            debug!("Request slot granted in {wait:?}");
            self.clock.sleep(wait).await;
        }
    }

    /// Raise the global cooldown to `now + duration`, never lowering it.
    pub fn signal_rate_limited(&self, duration: Duration) {
        let mut state = self.lock();
        let candidate = self.clock.now() + duration;
        match state.global_cooldown_until {
            Some(current) if current >= candidate => {
                debug!("Global cooldown already extends past the new signal");
            }
            _ => {
                state.global_cooldown_until = Some(candidate);
                info!("Global cooldown raised for {duration:?}");
            }
        }
    }

    pub fn in_global_cooldown(&self) -> bool {
        let state = self.lock();
        state
            .global_cooldown_until
            .is_some_and(|until| until > self.clock.now())
    }

    /// Time left on the global cooldown, zero when none is active
    pub fn cooldown_remaining(&self) -> Duration {
        let state = self.lock();
        state
            .global_cooldown_until
            .map(|until| until.saturating_duration_since(self.clock.now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn set_min_request_interval(&self, interval: Duration) {
        self.lock().min_request_interval = interval;
    }

    pub fn min_request_interval(&self) -> Duration {
        self.lock().min_request_interval
    }
}
