//! Token-bucket admission control for externally triggered procedures.
//!
//! Tokens refill at `limit` per second up to `burst`. When disabled the
//! limiter admits everything and any pending waiter is released.
//! Configuration is hot-updatable from the admin API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use tessera_common::config::FlowLimiterConfig;
use tessera_common::{MetaError, MetaResult};

struct Bucket {
    config: FlowLimiterConfig,
    /// Scaled by 1000 for sub-token precision on fast refill ticks.
    tokens_milli: u64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        if elapsed_us == 0 {
            return;
        }
        let added_milli = self.config.limit.saturating_mul(elapsed_us) / 1000;
        let cap_milli = self.config.burst.saturating_mul(1000);
        self.tokens_milli = (self.tokens_milli + added_milli).min(cap_milli);
        self.last_refill = now;
    }
}

/// Hot-updatable token bucket gating external procedure submission.
pub struct FlowLimiter {
    bucket: Mutex<Bucket>,
    changed: Notify,
}

impl FlowLimiter {
    pub fn new(config: FlowLimiterConfig) -> Arc<Self> {
        let tokens_milli = config.burst.saturating_mul(1000);
        Arc::new(Self {
            bucket: Mutex::new(Bucket {
                config,
                tokens_milli,
                last_refill: Instant::now(),
            }),
            changed: Notify::new(),
        })
    }

    pub fn config(&self) -> FlowLimiterConfig {
        self.bucket.lock().config.clone()
    }

    /// Replace the configuration. Disabling releases pending waiters; a new
    /// enable starts from a full bucket.
    pub fn update(&self, config: FlowLimiterConfig) {
        {
            let mut bucket = self.bucket.lock();
            bucket.tokens_milli = config.burst.saturating_mul(1000);
            bucket.last_refill = Instant::now();
            bucket.config = config;
        }
        self.changed.notify_waiters();
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.lock().config.enable
    }

    /// Take one token without waiting. Always admits when disabled.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        if !bucket.config.enable {
            return true;
        }
        bucket.refill(Instant::now());
        if bucket.tokens_milli >= 1000 {
            bucket.tokens_milli -= 1000;
            true
        } else {
            false
        }
    }

    /// Take one token, waiting up to `timeout`. Waiters are released
    /// immediately when the limiter is disabled.
    pub async fn acquire(&self, timeout: Duration) -> MetaResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MetaError::FlowLimited(format!(
                    "no token within {}ms",
                    timeout.as_millis()
                )));
            }
            // Wake on config change or after the time one token takes.
            let limit = self.bucket.lock().config.limit.max(1);
            let refill_wait = Duration::from_millis((1000 / limit).clamp(1, 100));
            let wait = refill_wait.min(deadline - now);
            let changed = self.changed.notified();
            tokio::pin!(changed);
            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Tokens currently available (approximate, for the admin API).
    pub fn available(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens_milli / 1000
    }
}
