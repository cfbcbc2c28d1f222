//! Fetch throttling shared by every worker of a pool.
//!
//! Two independent ceilings: a semaphore bounds requests in flight and a
//! governor rate limiter bounds requests per second. Neither depends on the
//! number of workers.

use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::error::ConfigError;
use crate::types::config::FetchConfig;

type DefaultRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Permission to make one request. Dropping it frees the in-flight slot.
#[derive(Debug)]
pub struct ThrottlePermit {
    _slot: OwnedSemaphorePermit,
}

/// Shared request throttle.
#[derive(Clone)]
pub struct Throttle {
    slots: Arc<Semaphore>,
    limiter: Arc<DefaultRateLimiter>,
    max_in_flight: usize,
}

impl Throttle {
    /// Requests are spaced evenly; there is no burst allowance.
    pub fn new(max_in_flight: usize, requests_per_second: u32) -> Result<Self, ConfigError> {
        if max_in_flight == 0 {
            return Err(ConfigError::new("max_in_flight", "must be at least 1"));
        }
        let rps = NonZeroU32::new(requests_per_second)
            .ok_or_else(|| ConfigError::new("requests_per_second", "must be at least 1"))?;
        let quota = Quota::per_second(rps).allow_burst(nonzero!(1u32));

        Ok(Self {
            slots: Arc::new(Semaphore::new(max_in_flight)),
            limiter: Arc::new(RateLimiter::direct(quota)),
            max_in_flight,
        })
    }

    pub fn from_config(config: &FetchConfig) -> Result<Self, ConfigError> {
        Self::new(config.max_in_flight, config.requests_per_second)
    }

    /// Wait for an in-flight slot, then for the rate limiter.
    ///
    /// Fails only after [`Throttle::close`].
    pub async fn acquire(&self) -> Result<ThrottlePermit, AcquireError> {
        let slot = self.slots.clone().acquire_owned().await?;
        self.limiter.until_ready().await;
        Ok(ThrottlePermit { _slot: slot })
    }

    /// Wake every waiter with an error; no further permits are handed out.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.slots.available_permits()
    }
}
