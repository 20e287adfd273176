//! Per-tenant bookkeeping: connections, waiters, quota, and demand.

use crate::backend::{Connection, Name};
use crate::backoff::ExponentialBackoff;
use crate::claim;
use crate::policy::Policy;
use crate::pool;
use crate::window_counter::WindowedCounter;
use crate::ClaimId;

use debug_ignore::DebugIgnore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{event, Level};

/// Point-in-time counts for one tenant's block.
///
/// `connecting + idle + active` is the block's share of the pool's
/// capacity; `quota` is what the rebalancer currently thinks that share
/// should be. The `total_*` fields count events over the block's whole
/// life.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BlockStats {
    pub quota: usize,
    pub connecting: usize,
    pub idle: usize,
    pub active: usize,
    pub waiters: usize,

    pub total_connects: usize,
    pub total_connect_failures: usize,
    pub total_closed: usize,
    pub total_timeouts: usize,
}

impl BlockStats {
    /// Connections currently owned by this block, in any state.
    pub fn connected(&self) -> usize {
        self.connecting + self.idle + self.active
    }
}

// An idle connection, timestamped so the rebalancer can find stale ones.
#[derive(Debug)]
struct IdleConn<Conn> {
    conn: DebugIgnore<Conn>,
    since: Instant,
}

// A suspended acquire. The sender is the waiter's single-use completion
// slot: it receives either a connection or an error, exactly once. A
// dropped receiver means the caller cancelled.
pub(crate) struct Waiter<Conn: Connection> {
    pub(crate) id: ClaimId,
    pub(crate) deadline: Instant,
    pub(crate) queued_at: Instant,
    pub(crate) tx: oneshot::Sender<Result<claim::Handle<Conn>, pool::Error>>,
}

/// One tenant's slice of the pool.
///
/// A block is passive data: every mutation happens on the pool worker
/// task, which is what makes the quota and capacity arithmetic safe
/// without locks. The shared [BlockStats] handle is the one concession:
/// it is written through here and read by the introspection surface.
pub(crate) struct Block<Conn: Connection> {
    pub(crate) key: Name,

    quota: usize,
    connecting: usize,
    active: usize,
    idle: VecDeque<IdleConn<Conn>>,
    waiters: VecDeque<Waiter<Conn>>,

    /// Windowed count of acquire misses; the rebalancer's demand signal.
    demand: WindowedCounter,

    /// Connect retry pacing, local to this tenant.
    pub(crate) backoff: ExponentialBackoff,

    last_active_at: Instant,

    stats: Arc<Mutex<BlockStats>>,
}

impl<Conn: Connection> Block<Conn> {
    pub(crate) fn new(key: Name, policy: &Policy) -> Self {
        let quota = policy.min_quota;
        Self {
            key,
            quota,
            connecting: 0,
            active: 0,
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            demand: WindowedCounter::new(policy.demand_window),
            backoff: ExponentialBackoff::new(policy.connect_backoff.clone()),
            last_active_at: Instant::now(),
            stats: Arc::new(Mutex::new(BlockStats {
                quota,
                ..Default::default()
            })),
        }
    }

    pub(crate) fn stats_handle(&self) -> Arc<Mutex<BlockStats>> {
        self.stats.clone()
    }

    // -- counts ----------------------------------------------------------

    pub(crate) fn connected(&self) -> usize {
        self.connecting + self.idle.len() + self.active
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active
    }

    pub(crate) fn connecting_count(&self) -> usize {
        self.connecting
    }

    pub(crate) fn quota(&self) -> usize {
        self.quota
    }

    pub(crate) fn set_quota(&mut self, quota: usize) {
        self.quota = quota;
        self.publish();
    }

    // -- idle connections ------------------------------------------------

    /// Checks out the most-recently-used idle connection.
    ///
    /// MRU keeps hot connections hot; the stale end of the deque is left
    /// for the rebalancer to retire.
    pub(crate) fn take_idle_mru(&mut self, now: Instant) -> Option<Conn> {
        let conn = self.idle.pop_back()?;
        self.active += 1;
        self.last_active_at = now;
        self.publish();
        Some(conn.conn.0)
    }

    /// Returns a connection from a finished claim to the idle set.
    pub(crate) fn release_to_idle(&mut self, conn: Conn, now: Instant) {
        debug_assert!(self.active > 0, "release without a matching checkout");
        self.active -= 1;
        self.idle.push_back(IdleConn {
            conn: DebugIgnore(conn),
            since: now,
        });
        self.publish();
    }

    /// Drops a connection returned from a claim instead of recycling it.
    pub(crate) fn discard_active(&mut self) {
        debug_assert!(self.active > 0, "discard without a matching checkout");
        self.active -= 1;
        self.note_closed();
        self.publish();
    }

    /// Closes the least-recently-used idle connection. Returns false if
    /// there was nothing idle to close.
    pub(crate) fn close_idle_lru(&mut self) -> bool {
        let Some(conn) = self.idle.pop_front() else {
            return false;
        };
        drop(conn);
        self.note_closed();
        self.publish();
        true
    }

    /// Number of idle connections that have sat unused for at least
    /// `grace`.
    pub(crate) fn idle_older_than(&self, grace: Duration, now: Instant) -> usize {
        self.idle
            .iter()
            .filter(|c| now.duration_since(c.since) >= grace)
            .count()
    }

    // -- connection establishment ----------------------------------------

    pub(crate) fn begin_connect(&mut self) {
        self.connecting += 1;
        self.publish();
    }

    /// A connect finished and the connection goes straight to a claim.
    pub(crate) fn connect_succeeded_to_active(&mut self, now: Instant) {
        debug_assert!(self.connecting > 0);
        self.connecting -= 1;
        self.active += 1;
        self.last_active_at = now;
        self.backoff.reset();
        self.stats.lock().unwrap().total_connects += 1;
        self.publish();
    }

    /// A connect finished with no waiter to serve; park the connection.
    pub(crate) fn connect_succeeded_to_idle(&mut self, conn: Conn, now: Instant) {
        debug_assert!(self.connecting > 0);
        self.connecting -= 1;
        self.idle.push_back(IdleConn {
            conn: DebugIgnore(conn),
            since: now,
        });
        self.backoff.reset();
        self.stats.lock().unwrap().total_connects += 1;
        self.publish();
    }

    pub(crate) fn connect_failed(&mut self) {
        debug_assert!(self.connecting > 0);
        self.connecting -= 1;
        self.stats.lock().unwrap().total_connect_failures += 1;
        self.publish();
    }

    // -- waiters ---------------------------------------------------------

    pub(crate) fn push_waiter(&mut self, waiter: Waiter<Conn>) {
        self.waiters.push_back(waiter);
        self.publish();
    }

    /// Pops the oldest waiter whose caller is still listening. Cancelled
    /// waiters encountered along the way are dropped silently; their
    /// callers are gone and cancellation must stay side-effect-free.
    pub(crate) fn pop_live_waiter(&mut self) -> Option<Waiter<Conn>> {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.is_closed() {
                event!(Level::TRACE, tenant = %self.key, "Dropping cancelled waiter");
                continue;
            }
            self.publish();
            return Some(waiter);
        }
        self.publish();
        None
    }

    /// Removes a specific waiter, if it is still queued.
    pub(crate) fn remove_waiter(&mut self, id: ClaimId) -> Option<Waiter<Conn>> {
        let position = self.waiters.iter().position(|w| w.id == id)?;
        let waiter = self.waiters.remove(position);
        self.publish();
        waiter
    }

    /// Drops waiters whose callers have gone away.
    pub(crate) fn purge_cancelled(&mut self) {
        let before = self.waiters.len();
        self.waiters.retain(|w| !w.tx.is_closed());
        if self.waiters.len() != before {
            self.publish();
        }
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub(crate) fn oldest_waiter_deadline(&self) -> Option<Instant> {
        self.waiters.front().map(|w| w.deadline)
    }

    pub(crate) fn oldest_wait(&self, now: Instant) -> Duration {
        self.waiters
            .front()
            .map(|w| now.duration_since(w.queued_at))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether another connect attempt should be launched for this
    /// block's waiters. While the block is backing off after failures,
    /// probing is limited to one attempt in flight, so a dead backend
    /// can't occupy capacity with a pile of doomed connects.
    pub(crate) fn may_spawn_connect(&self) -> bool {
        if self.waiters.len() <= self.connecting {
            return false;
        }
        self.connecting == 0 || self.backoff.current_delay().is_zero()
    }

    // -- signals ---------------------------------------------------------

    /// Records an acquire that could not be served from the idle set.
    pub(crate) fn note_miss(&mut self) {
        self.demand.add(1);
    }

    pub(crate) fn note_timeout(&mut self) {
        self.stats.lock().unwrap().total_timeouts += 1;
    }

    fn note_closed(&mut self) {
        self.stats.lock().unwrap().total_closed += 1;
    }

    pub(crate) fn demand(&mut self) -> u64 {
        self.demand.sum()
    }

    /// Demand pressure per the rebalancing policy: queued waiters, plus
    /// one if the oldest has waited past the threshold.
    pub(crate) fn pressure(&self, now: Instant, threshold: Duration) -> usize {
        let aging = usize::from(self.has_waiters() && self.oldest_wait(now) > threshold);
        self.waiters.len() + aging
    }

    pub(crate) fn is_dormant(&self, now: Instant, dormancy: Duration) -> bool {
        self.connected() == 0
            && self.waiters.is_empty()
            && now.duration_since(self.last_active_at) >= dormancy
    }

    /// Time since the last checkout from this block.
    pub(crate) fn quiet_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_active_at)
    }

    /// Tears the block down for pool shutdown: closes idle connections
    /// and hands back any queued waiters so they can be failed.
    pub(crate) fn drain_for_shutdown(&mut self) -> Vec<Waiter<Conn>> {
        let closed = self.idle.len();
        self.idle.clear();
        self.stats.lock().unwrap().total_closed += closed;
        let waiters = std::mem::take(&mut self.waiters);
        self.publish();
        waiters.into()
    }

    // Write-through to the shared stats handle.
    fn publish(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.quota = self.quota;
        stats.connecting = self.connecting;
        stats.idle = self.idle.len();
        stats.active = self.active;
        stats.waiters = self.waiters.len();
    }

    #[cfg(debug_assertions)]
    #[track_caller]
    pub(crate) fn check_consistency(&self) {
        let stats = self.stats.lock().unwrap().clone();
        assert_eq!(
            stats.connected(),
            self.connected(),
            "block {} stats drifted from its counters",
            self.key
        );
        assert_eq!(stats.waiters, self.waiters.len());
        assert_eq!(stats.quota, self.quota);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn block() -> Block<usize> {
        Block::new(Name::new("db"), &Policy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn counts_follow_connection_lifecycle() {
        let mut block = block();
        let now = Instant::now();

        block.begin_connect();
        assert_eq!(block.connected(), 1);
        assert_eq!(block.connecting_count(), 1);

        block.connect_succeeded_to_idle(7, now);
        assert_eq!(block.connecting_count(), 0);
        assert_eq!(block.idle_count(), 1);

        let conn = block.take_idle_mru(now).unwrap();
        assert_eq!(conn, 7);
        assert_eq!(block.active_count(), 1);
        assert_eq!(block.idle_count(), 0);

        block.release_to_idle(conn, now);
        assert_eq!(block.active_count(), 0);
        assert_eq!(block.idle_count(), 1);
        block.check_consistency();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_checkout_is_mru_and_close_is_lru() {
        let mut block = block();
        let now = Instant::now();

        for conn in [1, 2, 3] {
            block.begin_connect();
            block.connect_succeeded_to_idle(conn, now);
        }

        // MRU: the most recently parked connection comes out first.
        assert_eq!(block.take_idle_mru(now), Some(3));

        // LRU: closing retires the oldest one.
        assert!(block.close_idle_lru());
        assert_eq!(block.idle_count(), 1);
        assert_eq!(block.take_idle_mru(now), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_idle_connections_are_counted() {
        let mut block = block();
        let grace = Duration::from_secs(5);

        block.begin_connect();
        block.connect_succeeded_to_idle(1, Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;
        block.begin_connect();
        block.connect_succeeded_to_idle(2, Instant::now());

        let now = Instant::now();
        assert_eq!(block.idle_older_than(grace, now), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        let now = Instant::now();
        assert_eq!(block.idle_older_than(grace, now), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        let now = Instant::now();
        assert_eq!(block.idle_older_than(grace, now), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_fifo_and_skip_cancelled() {
        let mut block = block();
        let now = Instant::now();
        let deadline = now + Duration::from_secs(1);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let (tx3, rx3) = oneshot::channel();
        for (id, tx) in [(1, tx1), (2, tx2), (3, tx3)] {
            block.push_waiter(Waiter {
                id: ClaimId(id),
                deadline,
                queued_at: now,
                tx,
            });
        }
        assert_eq!(block.waiter_count(), 3);

        // Cancel the first waiter; the second should pop.
        drop(rx1);
        let waiter = block.pop_live_waiter().unwrap();
        assert_eq!(waiter.id, ClaimId(2));

        // Purging drops the cancelled third.
        drop(rx3);
        block.purge_cancelled();
        assert_eq!(block.waiter_count(), 0);
        drop(rx2);
    }

    #[tokio::test(start_paused = true)]
    async fn dormancy_requires_idle_and_quiet() {
        let mut block = block();
        let dormancy = Duration::from_secs(60);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(block.is_dormant(Instant::now(), dormancy));

        // A connection (in any state) keeps the block alive.
        block.begin_connect();
        assert!(!block.is_dormant(Instant::now(), dormancy));
        block.connect_succeeded_to_idle(1, Instant::now());
        assert!(!block.is_dormant(Instant::now(), dormancy));

        // A recent checkout resets the clock even after the conn closes.
        let conn = block.take_idle_mru(Instant::now()).unwrap();
        block.release_to_idle(conn, Instant::now());
        assert!(block.close_idle_lru());
        assert!(!block.is_dormant(Instant::now(), dormancy));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(block.is_dormant(Instant::now(), dormancy));
    }

    #[tokio::test(start_paused = true)]
    async fn pressure_counts_aging_waiters() {
        let mut block = block();
        let threshold = Duration::from_millis(100);
        let now = Instant::now();

        assert_eq!(block.pressure(now, threshold), 0);

        let (tx, _rx) = oneshot::channel();
        block.push_waiter(Waiter {
            id: ClaimId(1),
            deadline: now + Duration::from_secs(10),
            queued_at: now,
            tx,
        });
        assert_eq!(block.pressure(now, threshold), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(block.pressure(Instant::now(), threshold), 2);
    }
}
