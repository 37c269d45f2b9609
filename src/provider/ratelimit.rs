//! Token-bucket rate limiter for outbound provider calls.
//!
//! The bucket refills at a fixed rate up to a burst capacity; every call
//! consumes one token or sleeps until one is available. Waiting callers are
//! suspension points, never busy loops.

use std::time::Instant;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A non-positive rate disables limiting entirely.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping through refills as needed.
    pub async fn acquire(&self) {
        if self.rate_per_sec <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
                state.last_refill = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // time until one full token accrues
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_sec)
            };
            sleep(wait).await;
        }
    }
}
