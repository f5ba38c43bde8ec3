use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Source of time for everything that waits.
///
/// Production code uses [`SystemClock`]; tests drive [`ManualClock`] so that
/// retry and backoff policy can be checked without real elapsed time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock that only moves when slept on or advanced explicitly.
///
/// Every sleep is recorded, then completes after a single yield.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    inner: Mutex<ManualClockState>,
}

#[derive(Debug, Default)]
struct ManualClockState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            inner: Mutex::new(ManualClockState::default()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.elapsed += duration;
    }

    /// Total time that has passed on this clock
    pub fn elapsed(&self) -> Duration {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sleeps
            .clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
        Box::pin(tokio::task::yield_now())
    }
}

/// Sleep unless shutdown is requested first.
///
/// Returns `false` when the sleep was cut short by cancellation.
pub async fn sleep_or_cancel(
    clock: &Arc<dyn Clock>,
    duration: Duration,
    shutdown: &CancellationToken,
) -> bool {
    if shutdown.is_cancelled() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }

    tokio::select! {
        _ = clock.sleep(duration) => !shutdown.is_cancelled(),
        _ = shutdown.cancelled() => false,
    }
}

/// Uniformly random duration in `[min, max]`.
pub fn random_between(min: Duration, max: Duration) -> Duration {
    use rand::Rng;

    if max <= min {
        return min;
    }
    let low = min.as_millis() as u64;
    let high = max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(low..=high))
}
