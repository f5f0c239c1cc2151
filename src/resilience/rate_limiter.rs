//! # Token-Bucket Rate Limiter
//!
//! Caps outbound generation calls at a steady rate with burst capacity.
//! `acquire` suspends until a token is available; it never rejects. The
//! refill timestamp and token count are explicit fields so the state is
//! fully inspectable in tests.

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::trace;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Shared throttle for calls to the generation service. One instance is
/// passed by handle into every invocation; there is no ambient singleton.
#[derive(Debug)]
pub struct TokenBucket {
    tokens_per_second: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(tokens_per_second: f64, capacity: f64) -> Self {
        Self {
            tokens_per_second,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token, suspending until one accumulates if the bucket is
    /// empty. Long-run throughput never exceeds `tokens_per_second`; bursts
    /// up to `capacity` pass immediately.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Minimal wait to accumulate one token
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.tokens_per_second)
            };
            trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting for token");
            sleep(wait).await;
        }
    }

    /// Tokens currently available, after refill. Test hook.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.tokens_per_second).min(self.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_wait() {
        let bucket = TokenBucket::new(2.0, 2.0);

        // Two immediate acquires within burst capacity
        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third call must wait ~500ms for one token at 2 tokens/sec
        bucket.acquire().await;
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_millis(490) && waited <= Duration::from_millis(600),
            "expected ~500ms wait, got {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(10.0, 3.0);
        bucket.acquire().await;
        bucket.acquire().await;
        bucket.acquire().await;

        // Far more elapsed time than needed to refill: still capped
        tokio::time::advance(Duration::from_secs(60)).await;
        let available = bucket.available().await;
        assert!((available - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_rate() {
        let bucket = TokenBucket::new(1.0, 1.0);
        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        // First is free, then one per second
        assert!(start.elapsed() >= Duration::from_millis(1990));
    }
}
