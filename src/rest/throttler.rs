//! Pacing strategies for outbound API calls.
//!
//! The API enforces a hard per-key rate limit. A [`Throttler`] hands out
//! permits in call order: both strategies funnel every caller through a fair
//! async mutex, so concurrent callers are served first-come first-served.

use async_trait::async_trait;
use log::debug;
use tokio::{
    sync::Mutex,
    time::{self, Duration, Instant},
};

/// Governs the rate at which requests may proceed.
///
/// Once called, [`Throttler::wait`] always resolves eventually. Timeouts only
/// apply to the HTTP call, never to the wait itself.
#[async_trait]
pub trait Throttler: Send + Sync {
    /// Suspends until the next permit is granted.
    async fn wait(&self);
}

/// Fixed-interval pacing: at most one permit every `sleep_time`.
///
/// Spreads `N requests per second` evenly instead of bursting.
///
/// # Examples
///
/// ```no_run
/// use clanwatch::rest::{QueueThrottler, Throttler};
/// use std::time::Duration;
///
/// # async fn example() {
/// let throttler = QueueThrottler::new(Duration::from_millis(100));
/// throttler.wait().await; // immediate
/// throttler.wait().await; // 100ms later
/// # }
/// ```
pub struct QueueThrottler {
    sleep_time: Duration,
    /// Instant of the last granted permit
    last_run: Mutex<Option<Instant>>,
}

impl QueueThrottler {
    pub fn new(sleep_time: Duration) -> Self {
        QueueThrottler {
            sleep_time,
            last_run: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Throttler for QueueThrottler {
    async fn wait(&self) {
        let mut last_run = self.last_run.lock().await;

        if let Some(last) = *last_run {
            let next_run = last + self.sleep_time;
            if next_run > Instant::now() {
                time::sleep_until(next_run).await;
            }
        }

        *last_run = Some(Instant::now());
    }
}

/// Fixed-window batching: `rate_limit` permits right away, then the next
/// caller sleeps for `window` before the counter starts over.
///
/// Used for `burst N per second` semantics.
pub struct BatchThrottler {
    rate_limit: u32,
    window: Duration,
    /// Permits granted in the current window
    count: Mutex<u32>,
}

impl BatchThrottler {
    /// Create a new [BatchThrottler].
    ///
    /// # Arguments
    ///
    /// * `rate_limit` - Permits granted per window, a zero limit is treated as one.
    /// * `window` - How long callers past the limit have to sleep.
    pub fn new(rate_limit: u32, window: Duration) -> Self {
        BatchThrottler {
            rate_limit: rate_limit.max(1),
            window,
            count: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Throttler for BatchThrottler {
    async fn wait(&self) {
        let mut count = self.count.lock().await;

        if *count >= self.rate_limit {
            debug!(
                "rate limit of {} reached, sleeping {:?}",
                self.rate_limit, self.window
            );
            time::sleep(self.window).await;
            *count = 0;
        }

        *count += 1;
    }
}
