//! Configuration options which can alter the behavior of the pool.

use tokio::time::Duration;

/// Policy which is applicable to a connection pool.
///
/// The capacity fields are hard limits; everything else tunes the
/// rebalancer's control loop and is safe to adjust at construction time.
/// The gain and decay knobs are deliberately exposed rather than baked
/// in. Validate changes against the simulation suite before shipping
/// them.
#[derive(Clone, Debug)]
pub struct Policy {
    /// The maximum number of connections which can be open at once,
    /// across all tenants. Never exceeded, not even transiently.
    pub max_connections: usize,

    /// The quota floor for a live block. A tenant which keeps showing up,
    /// however rarely, is never rebalanced below this entitlement.
    pub min_quota: usize,

    /// Default deadline applied by [crate::pool::Pool::acquire].
    pub claim_timeout: Duration,

    /// How long a connection may sit idle before the rebalancer may
    /// close it.
    pub idle_grace_period: Duration,

    /// Cadence of the quota rebalancing pass. The rebalancer also runs
    /// eagerly whenever a claim is forced to wait.
    pub rebalance_interval: Duration,

    /// How long a block with no connections, no waiters, and no recent
    /// checkouts is kept around before being garbage-collected.
    pub dormancy_period: Duration,

    /// A block whose oldest waiter has been queued longer than this is
    /// considered pressured even if the queue is short.
    pub pressure_threshold: Duration,

    /// Width of the sliding window used to smooth the per-block demand
    /// signal.
    pub demand_window: Duration,

    /// Per-tenant backoff applied between failed connection attempts.
    pub connect_backoff: BackoffPolicy,
}

impl Policy {
    /// Panics if the policy is unusable. Called by the pool constructor.
    pub(crate) fn validate(&self) {
        assert!(self.max_connections > 0, "pool capacity must be non-zero");
        assert!(
            self.min_quota <= self.max_connections,
            "min_quota cannot exceed pool capacity"
        );
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_connections: 16,
            min_quota: 1,
            claim_timeout: Duration::from_secs(30),
            idle_grace_period: Duration::from_secs(30),
            rebalance_interval: Duration::from_millis(100),
            dormancy_period: Duration::from_secs(60),
            pressure_threshold: Duration::from_millis(100),
            demand_window: Duration::from_secs(10),
            connect_backoff: BackoffPolicy::default(),
        }
    }
}

/// Shapes the retry delay after failed connection attempts.
///
/// The delay starts at `initial`, multiplies by `multiplier` per
/// consecutive failure, and is clamped to `max`. A random duration in
/// `0..spread` is added to each delay so simultaneous failures don't
/// retry in lockstep.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    pub spread: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2,
            spread: Duration::from_millis(20),
        }
    }
}
