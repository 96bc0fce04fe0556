//! Process-wide bandwidth limit shared by every connection.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::warn;

pub struct Throttle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: NonZeroU32,
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle").field("burst", &self.burst).finish()
    }
}

impl Throttle {
    /// `None` when `bytes_per_sec` is zero (no limit).
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        let rate = u32::try_from(bytes_per_sec).unwrap_or(u32::MAX);
        let burst = NonZeroU32::new(rate)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_second(burst)),
            burst,
        })
    }

    pub fn bytes_per_sec(&self) -> u32 {
        self.burst.get()
    }

    /// Waits until `n` bytes may pass. Requests larger than one second's
    /// worth are taken in burst-sized pieces.
    pub async fn acquire(&self, n: usize) {
        let mut left = u32::try_from(n).unwrap_or(u32::MAX);
        while let Some(piece) = NonZeroU32::new(left.min(self.burst.get())) {
            if let Err(e) = self.limiter.until_n_ready(piece).await {
                warn!("rate limiter rejected {piece} bytes: {e}");
                return;
            }
            left -= piece.get();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn zero_means_unlimited() {
        assert!(Throttle::new(0).is_none());
        assert_eq!(Throttle::new(u64::MAX).unwrap().bytes_per_sec(), u32::MAX);
    }

    #[tokio::test]
    async fn oversized_requests_are_split() {
        let throttle = Throttle::new(64 * 1024).unwrap();
        let started = Instant::now();
        // Initial burst covers the first 64K; the rest must wait about a second.
        throttle.acquire(96 * 1024).await;
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn small_requests_pass_immediately() {
        let throttle = Throttle::new(1024 * 1024).unwrap();
        let started = Instant::now();
        throttle.acquire(4096).await;
        throttle.acquire(0).await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
