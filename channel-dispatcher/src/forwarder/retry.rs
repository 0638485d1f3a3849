use std::time;

use crate::subscriber::{BackoffPolicy, DeliverySpec};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Backoff {
    /// Multiply the initial interval with the coefficient for every past attempt.
    Exponential { coefficient: u32 },
    /// Grow the interval by the initial interval for every past attempt.
    Linear,
}

/// The retry policy used to space out delivery attempts to a subscriber.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Backoff,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Retries after the first attempt.
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff: Backoff::Exponential {
                coefficient: backoff_coefficient,
            },
            initial_interval,
            maximum_interval,
            max_retries: 0,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Overlay a subscriber's delivery options on top of this policy.
    pub fn for_delivery(&self, delivery: Option<&DeliverySpec>) -> Self {
        let Some(delivery) = delivery else {
            return *self;
        };

        let mut policy = *self;
        if let Some(retry) = delivery.retry {
            policy.max_retries = retry;
        }
        if let Some(delay) = delivery.backoff_delay() {
            policy.initial_interval = delay;
        }
        match delivery.backoff_policy {
            Some(BackoffPolicy::Linear) => policy.backoff = Backoff::Linear,
            Some(BackoffPolicy::Exponential) => {
                policy.backoff = Backoff::Exponential { coefficient: 2 }
            }
            None => {}
        }
        policy
    }

    /// Total number of delivery attempts, including the first one.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate the time until the next retry, `attempt` being the number of past retries.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval = match self.backoff {
            Backoff::Exponential { coefficient } => self
                .initial_interval
                .saturating_mul(coefficient.saturating_pow(attempt)),
            Backoff::Linear => self.initial_interval.saturating_mul(attempt.saturating_add(1)),
        };

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => std::cmp::min(
                std::cmp::max(std::cmp::min(candidate_interval, max_interval), duration),
                max_interval,
            ),
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential { coefficient: 2 },
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            max_retries: 0,
        }
    }
}
