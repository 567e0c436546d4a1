//! Proactive request budget for forge API clients
//!
//! The reported platform quota is handled reactively through the retry
//! policy; this limiter keeps a fleet of workers from burning the quota in
//! the first place.

use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Shared per-client request budget
#[derive(Clone)]
pub struct RequestBudget {
    limiter: Arc<DirectLimiter>,
}

impl RequestBudget {
    /// Create a budget allowing `requests_per_second` requests
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
        let quota = Quota::per_second(rps);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Wait until the next request is allowed
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}
