use std::time::Duration as StdDuration;

use chrono::Duration;

pub mod backoff;
pub mod manager;
pub mod scheduler;

pub use manager::{CallbackUrls, SubscriptionManager};
pub use scheduler::{RenewalScheduler, SchedulerHandle, TickReport};

/// Longest lifetime Graph grants to Outlook message subscriptions.
pub const MAX_SUBSCRIPTION_TTL_MINUTES: i64 = 10_070;

pub const STALE_PENDING_AFTER_MINUTES: i64 = 10;

pub fn max_subscription_ttl() -> Duration {
    Duration::minutes(MAX_SUBSCRIPTION_TTL_MINUTES)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalPolicy {
    /// Renew once remaining lifetime drops to this.
    pub margin: Duration,
    pub tick: StdDuration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long a `Renewing` claim holds before the scheduler reclaims it.
    pub lease: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            margin: Duration::minutes(60),
            tick: StdDuration::from_secs(60),
            max_attempts: 5,
            backoff_base: Duration::seconds(30),
            backoff_max: Duration::minutes(10),
            lease: Duration::minutes(5),
        }
    }
}
