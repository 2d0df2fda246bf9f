use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Token bucket shared by every worker of one engine.
///
/// Every network attempt, retries included, passes through [`RequestRateLimiter::acquire`].
pub struct RequestRateLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    max_per_second: NonZeroU32,
    burst: NonZeroU32,
}

impl RequestRateLimiter {
    /// Zero values are clamped to one token per second and a burst equal to the rate.
    pub fn new(max_requests_per_second: u32, burst_capacity: u32) -> Self {
        let max_per_second = NonZeroU32::new(max_requests_per_second).unwrap_or(nonzero!(1u32));
        let burst = NonZeroU32::new(burst_capacity).unwrap_or(max_per_second);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(max_per_second).allow_burst(burst)),
            max_per_second,
            burst,
        }
    }

    pub fn max_per_second(&self) -> u32 {
        self.max_per_second.get()
    }

    pub fn burst(&self) -> u32 {
        self.burst.get()
    }

    /// Waits for one token. Returns `Cancelled` as soon as `cancel` fires; a cancelled wait
    /// consumes no token.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            _ = self.limiter.until_ready() => Ok(()),
        }
    }
}
