//! Cluster-wide job throttling.
//!
//! The replicator consults a single [`JobThrottler`] before issuing jobs to
//! any node. It is a token bucket that is allowed to go into debt: acquiring
//! always succeeds, and while the balance is negative the bucket reports
//! [`JobThrottler::is_overdraft`] and the scheduler issues nothing.
//!
//! ```rust
//! use chunk_replicator::config::ThrottlerConfig;
//! use chunk_replicator::ratelimit::JobThrottler;
//! use std::time::Duration;
//!
//! let mut throttler = JobThrottler::from_config(&ThrottlerConfig {
//!     limit: Some(2),
//!     period: Duration::from_secs(60),
//! });
//! throttler.acquire(3);
//! assert!(throttler.is_overdraft());
//! ```

use crate::config::ThrottlerConfig;
use tokio::time::Instant;

/// Token bucket with overdraft semantics.
#[derive(Debug)]
pub struct JobThrottler {
    /// Maximum balance. `None` means unlimited.
    capacity: Option<f64>,
    /// Current balance. Negative while in overdraft.
    balance: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last refill time.
    last_refill: Instant,
}

impl JobThrottler {
    /// Create a throttler allowing `limit` jobs per `period`.
    pub fn new(limit: u64, period: std::time::Duration) -> Self {
        let capacity = limit as f64;
        Self {
            capacity: Some(capacity),
            balance: capacity,
            refill_rate: capacity / period.as_secs_f64().max(f64::EPSILON),
            last_refill: Instant::now(),
        }
    }

    /// Throttler that never limits.
    pub fn unlimited() -> Self {
        Self {
            capacity: None,
            balance: 0.0,
            refill_rate: 0.0,
            last_refill: Instant::now(),
        }
    }

    /// Create from throttler config.
    pub fn from_config(config: &ThrottlerConfig) -> Self {
        match config.limit {
            Some(limit) => Self::new(limit, config.period),
            None => Self::unlimited(),
        }
    }

    /// Whether issuance must pause until the balance recovers.
    pub fn is_overdraft(&mut self) -> bool {
        self.refill();
        self.capacity.is_some() && self.balance < 0.0
    }

    /// Consume `count` units. Never blocks and never fails.
    pub fn acquire(&mut self, count: u64) {
        if self.capacity.is_none() {
            return;
        }
        self.refill();
        self.balance -= count as f64;
    }

    /// Current balance, rounded down. Negative while in overdraft.
    pub fn available(&mut self) -> i64 {
        self.refill();
        match self.capacity {
            Some(_) => self.balance.floor() as i64,
            None => i64::MAX,
        }
    }

    fn refill(&mut self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.balance = (self.balance + elapsed * self.refill_rate).min(capacity);
    }
}
