// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumption Rate Gate
//!
//! A token bucket shared by all workers of one consumer. Tokens refill at a
//! steady rate up to the burst size; each acquisition takes one token or waits
//! until one becomes available.

use crate::{
    configs::{ConsumerConfig, MIN_RATE_LIMIT},
    errors::AmqpError,
};
use std::time::Duration;
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

/// Longest single sleep; a waiter re-checks the bucket at least this often.
const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

#[derive(Debug)]
struct Limit {
    per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

/// Bounds how fast deliveries are handed to a handler.
///
/// An unlimited gate never waits.
#[derive(Debug)]
pub struct RateGate {
    limit: Option<Limit>,
}

impl RateGate {
    /// A gate that never waits.
    pub fn unlimited() -> RateGate {
        RateGate { limit: None }
    }

    /// A gate allowing `per_second` permits per second with at most `burst`
    /// permits available at once. The bucket starts full.
    ///
    /// # Parameters
    /// * `per_second` - Refill rate; values below [`MIN_RATE_LIMIT`], NaN
    ///   included, are raised to it
    /// * `burst` - Bucket size, at least one permit
    pub fn new(per_second: f64, burst: u32) -> RateGate {
        let burst = f64::from(burst.max(1));
        let per_second = if per_second >= MIN_RATE_LIMIT {
            per_second
        } else {
            MIN_RATE_LIMIT
        };

        RateGate {
            limit: Some(Limit {
                per_second,
                burst,
                bucket: Mutex::new(Bucket {
                    tokens: burst,
                    refilled_at: Instant::now(),
                }),
            }),
        }
    }

    /// The gate a consumer's `rate_limit` and `rate_burst` describe.
    pub fn from_config(cfg: &ConsumerConfig) -> RateGate {
        match cfg.rate_limit {
            Some(per_second) => RateGate::new(per_second, cfg.rate_burst.unwrap_or(1)),
            None => RateGate::unlimited(),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limit.is_some()
    }

    /// Waits for one permit.
    ///
    /// Returns [`AmqpError::Cancelled`] as soon as `cancel` fires; a cancelled
    /// wait takes no permit.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let Some(limit) = &self.limit else {
            return Ok(());
        };

        loop {
            if cancel.is_cancelled() {
                return Err(AmqpError::Cancelled);
            }

            let wait = {
                let mut bucket = limit.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * limit.per_second).min(limit.burst);
                bucket.refilled_at = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }

                Duration::try_from_secs_f64((1.0 - bucket.tokens) / limit.per_second)
                    .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                _ = sleep(wait) => {}
            }
        }
    }
}
