use crate::policy::BackoffPolicy;
use rand::Rng;
use tokio::time::Duration;

/// Per-block connect backoff state.
///
/// Each block carries its own instance so a tenant whose backend is down
/// only slows down its own retries.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    policy: BackoffPolicy,
    // Delay to apply before the next attempt. None while healthy.
    next: Option<Duration>,
}

impl ExponentialBackoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self { policy, next: None }
    }

    /// Records a failure, returning the delay to wait before retrying.
    pub(crate) fn advance(&mut self) -> Duration {
        let base = self.next.unwrap_or(self.policy.initial);
        let grown = base
            .saturating_mul(self.policy.multiplier.max(1))
            .min(self.policy.max);
        self.next = Some(grown);
        add_spread(base, self.policy.spread)
    }

    /// Delay that should precede the next connect attempt. Zero while
    /// healthy.
    pub(crate) fn current_delay(&self) -> Duration {
        self.next.unwrap_or(Duration::ZERO)
    }

    /// A successful connection clears the backoff entirely.
    pub(crate) fn reset(&mut self) {
        self.next = None;
    }
}

fn add_spread(duration: Duration, spread: Duration) -> Duration {
    if spread.is_zero() {
        return duration;
    }
    let jitter = rand::rng().random_range(0..spread.as_nanos());
    duration.saturating_add(Duration::from_nanos(jitter as u64))
}
