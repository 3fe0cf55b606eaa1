//! [`ThrottlePolicy`] – per-category time-window coalescing rule.
//!
//! A policy admits at most one processed message per `interval`.  The window
//! opens when the policy is created (i.e. when the category is subscribed),
//! so a burst arriving right after subscription is coalesced to its last
//! message.
//!
//! Timestamps come from [`tokio::time::Instant`] so tests can drive the
//! window with a paused clock.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use fleetsync_runtime::throttle::ThrottlePolicy;
//!
//! let mut policy = ThrottlePolicy::new(Duration::from_millis(500)).unwrap();
//! let start = tokio::time::Instant::now();
//!
//! assert!(!policy.is_due(start));
//! assert!(policy.is_due(start + Duration::from_millis(501)));
//!
//! policy.mark_processed(start + Duration::from_millis(501));
//! assert!(!policy.is_due(start + Duration::from_millis(600)));
//! ```

use std::time::Duration;

use fleetsync_types::FleetError;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct ThrottlePolicy {
    interval: Duration,
    last_processed: Instant,
}

impl ThrottlePolicy {
    /// Fails with [`FleetError::InvalidConfig`] for a zero interval.
    pub fn new(interval: Duration) -> Result<Self, FleetError> {
        validate(interval)?;
        Ok(Self {
            interval,
            last_processed: Instant::now(),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// `true` once strictly more than `interval` has passed since the last
    /// processed message.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_processed) > self.interval
    }

    pub fn mark_processed(&mut self, now: Instant) {
        self.last_processed = now;
    }

    /// Change the interval at runtime.  The current window is kept.
    pub fn set_interval(&mut self, interval: Duration) -> Result<(), FleetError> {
        validate(interval)?;
        self.interval = interval;
        Ok(())
    }

    /// Time left until the policy is due, zero if it already is.
    pub fn remaining(&self, now: Instant) -> Duration {
        (self.last_processed + self.interval).saturating_duration_since(now)
    }
}

fn validate(interval: Duration) -> Result<(), FleetError> {
    if interval.is_zero() {
        return Err(FleetError::InvalidConfig(
            "throttle interval must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
