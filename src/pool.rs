//! A pool which arbitrates a fixed budget of connections among tenants.
//!
//! One worker task owns every block and makes every decision (grants,
//! releases, connect completions, deadline expiry, rebalancing), so
//! no two claims can ever be handed the same connection, and the
//! capacity ceiling holds without any cross-task coordination. The
//! worker never performs connection I/O itself; connect attempts run as
//! spawned tasks and report back over a channel.

use crate::backend;
use crate::backend::{Connection, Name};
use crate::block::{Block, BlockStats, Waiter};
use crate::claim;
use crate::claim::Returned;
use crate::deadlines::{DeadlineQueue, Expiry};
use crate::policy::Policy;
use crate::rebalancer;
use crate::rebalancer::RebalanceOp;
use crate::ClaimId;

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, Instant};
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Deadline elapsed before a connection was available")]
    Timeout,

    #[error("Could not connect before the claim's retry budget ran out")]
    Connect(#[source] backend::Error),

    #[error("Pool terminated")]
    Terminated,
}

type ClaimSender<Conn> = oneshot::Sender<Result<claim::Handle<Conn>, Error>>;

enum Request<Conn: Connection> {
    Acquire {
        id: ClaimId,
        tenant: Name,
        deadline: Instant,
        tx: ClaimSender<Conn>,
    },
    Terminate,
}

// Completion message from a spawned connect task.
struct ConnectOutcome<Conn> {
    tenant: Name,
    result: Result<Conn, backend::Error>,
}

/// A shared reference to one tenant's live stats
#[derive(Clone)]
pub struct TenantStats(Arc<Mutex<BlockStats>>);

impl TenantStats {
    /// Samples this tenant's stats at a single point-in-time
    pub fn get(&self) -> BlockStats {
        self.0.lock().unwrap().clone()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for TenantStats {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let inner = self.0.lock().unwrap();
        inner.serialize(serializer)
    }
}

/// Pool-side stats, including statistics for each tenant.
#[derive(Clone)]
pub struct Stats {
    /// Per-tenant statistics
    pub rx: watch::Receiver<HashMap<Name, TenantStats>>,

    /// The total number of claims requested from the pool so far.
    pub claims: Arc<AtomicUsize>,

    capacity: usize,
}

impl Stats {
    /// The pool's hard connection ceiling.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples one tenant's stats, if the tenant has a live block.
    pub fn tenant(&self, tenant: &str) -> Option<BlockStats> {
        self.rx.borrow().get(tenant).map(TenantStats::get)
    }

    /// Connections currently open across all tenants.
    pub fn total_connected(&self) -> usize {
        self.rx
            .borrow()
            .values()
            .map(|stats| stats.get().connected())
            .sum()
    }

    /// Fraction of capacity currently in use, in `0.0..=1.0`.
    pub fn utilization(&self) -> f64 {
        self.total_connected() as f64 / self.capacity as f64
    }
}

struct PoolInner<Conn: Connection> {
    name: Arc<str>,
    connector: backend::SharedConnector<Conn>,
    policy: Policy,

    blocks: HashMap<Name, Block<Conn>>,

    // Sum of every block's connecting + idle + active counts.
    //
    // Kept in lockstep with "Self::blocks"; checked in debug builds.
    total_connected: usize,

    deadlines: DeadlineQueue,

    rx: mpsc::Receiver<Request<Conn>>,

    connect_tx: mpsc::Sender<ConnectOutcome<Conn>>,
    connect_rx: mpsc::Receiver<ConnectOutcome<Conn>>,
    connect_tasks: JoinSet<()>,

    // Claim handles return connections through this channel. Capacity
    // equals the pool capacity and every grant reserves a permit, so a
    // release can never block.
    release_tx: mpsc::Sender<Returned<Conn>>,
    release_rx: mpsc::Receiver<Returned<Conn>>,

    stats_tx: watch::Sender<HashMap<Name, TenantStats>>,
    claims: Arc<AtomicUsize>,
}

impl<Conn: Connection> PoolInner<Conn> {
    fn new(
        name: Arc<str>,
        connector: backend::SharedConnector<Conn>,
        policy: Policy,
        rx: mpsc::Receiver<Request<Conn>>,
        stats_tx: watch::Sender<HashMap<Name, TenantStats>>,
        claims: Arc<AtomicUsize>,
    ) -> Self {
        let (connect_tx, connect_rx) = mpsc::channel(policy.max_connections);
        let (release_tx, release_rx) = mpsc::channel(policy.max_connections);
        Self {
            name,
            connector,
            policy,
            blocks: HashMap::new(),
            total_connected: 0,
            deadlines: DeadlineQueue::new(),
            rx,
            connect_tx,
            connect_rx,
            connect_tasks: JoinSet::new(),
            release_tx,
            release_rx,
            stats_tx,
            claims,
        }
    }

    async fn run(mut self) {
        let mut rebalance_interval = interval(self.policy.rebalance_interval);
        rebalance_interval.reset();

        loop {
            // Either wait for the next claim deadline, or wait forever.
            let next_expiry = self.deadlines.next_deadline();
            let expiry_wait = async move {
                match next_expiry {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                // Handle requests from clients
                request = self.rx.recv() => {
                    match request {
                        Some(Request::Acquire { id, tenant, deadline, tx }) => {
                            self.acquire(id, tenant, deadline, tx);
                        }
                        // Either the caller explicitly asked us to stop,
                        // or every Pool handle is gone. Same cleanup
                        // either way.
                        Some(Request::Terminate) | None => {
                            self.terminate();
                            return;
                        }
                    }
                }
                // Take back connections from dropped claim handles
                Some(returned) = self.release_rx.recv() => self.recycle(returned),
                // Absorb the results of connect attempts
                Some(outcome) = self.connect_rx.recv() => self.connect_complete(outcome),
                // Time out the oldest overdue claims
                _ = expiry_wait => self.expire_waiters(),
                // Periodically adapt quotas to demand
                _ = rebalance_interval.tick() => self.rebalance(),
                // Reap finished connect tasks (their results arrive via
                // the connect channel; only panics matter here)
                Some(result) = self.connect_tasks.join_next(), if !self.connect_tasks.is_empty() => {
                    if let Err(err) = result {
                        if err.is_panic() {
                            std::panic::resume_unwind(err.into_panic());
                        }
                    }
                }
            }

            #[cfg(debug_assertions)]
            self.check_consistency();
        }
    }

    // The acquire decision ladder, evaluated against the worker's single
    // consistent view of the pool:
    //
    // 1. Idle connection in the tenant's block: grant immediately.
    // 2. Spare capacity (under quota, or borrowing the pool's unused
    //    headroom as an overflow connection): open a new connection and
    //    queue the caller for it.
    // 3. Pool full: queue the caller and try to free a donor's idle
    //    connection eagerly.
    //
    // Whatever happens, a queued caller's deadline is tracked centrally
    // and resolves to `Timeout` if nothing arrives in time.
    #[instrument(level = "debug", skip(self, tx, deadline), fields(pool = %self.name))]
    fn acquire(&mut self, id: ClaimId, tenant: Name, deadline: Instant, tx: ClaimSender<Conn>) {
        let now = Instant::now();
        self.claims.fetch_add(1, Ordering::Relaxed);
        self.ensure_block(&tenant);

        let block = self.blocks.get_mut(&tenant).unwrap();
        if let Some(conn) = block.take_idle_mru(now) {
            event!(Level::TRACE, tenant = %tenant, "Acquire: idle hit");
            self.grant(tenant, conn, tx);
            return;
        }
        block.note_miss();
        block.push_waiter(Waiter {
            id,
            deadline,
            queued_at: now,
            tx,
        });
        self.deadlines.push(Expiry {
            at: deadline,
            claim: id,
            tenant: tenant.clone(),
        });

        if self.total_connected < self.policy.max_connections {
            let (needs_connection, overflow, delay) = {
                let block = self.blocks.get(&tenant).unwrap();
                (
                    block.may_spawn_connect(),
                    block.connected() >= block.quota(),
                    block.backoff.current_delay(),
                )
            };
            if needs_connection {
                event!(Level::TRACE, tenant = %tenant, overflow, "Acquire: opening connection");
                self.spawn_connect(tenant, delay);
            }
            return;
        }

        // Pool full. An idle connection parked on an unpressured tenant
        // can be closed and re-opened for this one without waiting for
        // the next rebalance pass.
        event!(Level::TRACE, tenant = %tenant, "Acquire: pool full, looking for a donor");
        if let Some(donor) = rebalancer::find_donor(&self.policy, &self.blocks, &tenant, now) {
            self.transfer(&donor, &tenant);
        }
    }

    // Builds a claim handle around a connection already counted as
    // active, and delivers it to the caller.
    fn grant(&mut self, tenant: Name, conn: Conn, tx: ClaimSender<Conn>) {
        let Ok(permit) = self.release_tx.clone().try_reserve_owned() else {
            // The release channel has one slot per allowed connection, so
            // running out means the accounting is corrupt. Fail loudly
            // rather than limp along miscounting.
            panic!(
                "claim granted with more than {} connections outstanding",
                self.policy.max_connections
            );
        };
        let handle = claim::Handle::new(
            Returned {
                conn,
                tenant,
                poisoned: false,
            },
            permit,
        );
        if tx.send(Ok(handle)).is_err() {
            // The caller cancelled concurrently with the grant. The
            // rejected handle is dropped here, which routes the healthy
            // connection straight back through the release channel.
            event!(Level::TRACE, "Claim cancelled concurrently with grant");
        }
    }

    fn recycle(&mut self, returned: Returned<Conn>) {
        let now = Instant::now();
        let Returned {
            conn,
            tenant,
            poisoned,
        } = returned;
        if !self.blocks.contains_key(&tenant) {
            // Blocks with an outstanding claim are never retired, so a
            // release for a missing block is an accounting bug.
            debug_assert!(false, "release for unknown tenant {tenant}");
            return;
        }

        if poisoned {
            event!(Level::DEBUG, tenant = %tenant, "Discarding poisoned connection");
            self.blocks.get_mut(&tenant).unwrap().discard_active();
            self.total_connected -= 1;
            drop(conn);
            self.fill_from_spare(now);
            return;
        }

        // The oldest waiter on this block takes over the checkout.
        let waiter = self.blocks.get_mut(&tenant).unwrap().pop_live_waiter();
        if let Some(waiter) = waiter {
            self.grant(tenant, conn, waiter.tx);
            return;
        }

        self.blocks
            .get_mut(&tenant)
            .unwrap()
            .release_to_idle(conn, now);

        // Pool full and another tenant is starving: the connection that
        // just went idle is the cheapest one to re-home.
        if self.total_connected >= self.policy.max_connections {
            if let Some(to) = rebalancer::find_starved(&self.blocks, &tenant, now) {
                self.transfer(&tenant, &to);
            }
        }
    }

    fn connect_complete(&mut self, outcome: ConnectOutcome<Conn>) {
        let now = Instant::now();
        let ConnectOutcome { tenant, result } = outcome;
        if !self.blocks.contains_key(&tenant) {
            debug_assert!(false, "connect completion for unknown tenant {tenant}");
            return;
        }

        match result {
            Ok(conn) => {
                let waiter = self.blocks.get_mut(&tenant).unwrap().pop_live_waiter();
                match waiter {
                    Some(waiter) => {
                        self.blocks
                            .get_mut(&tenant)
                            .unwrap()
                            .connect_succeeded_to_active(now);
                        self.grant(tenant, conn, waiter.tx);
                    }
                    None => {
                        self.blocks
                            .get_mut(&tenant)
                            .unwrap()
                            .connect_succeeded_to_idle(conn, now);
                    }
                }
            }
            Err(err) => {
                event!(Level::WARN, tenant = %tenant, err = ?err, "Failed to connect");
                self.total_connected -= 1;

                enum FailAction {
                    Retry(Duration),
                    FailOldest(Duration),
                    Nothing,
                }
                let action = {
                    let block = self.blocks.get_mut(&tenant).unwrap();
                    block.connect_failed();
                    let delay = block.backoff.advance();
                    match block.oldest_waiter_deadline() {
                        Some(deadline) if now + delay < deadline => FailAction::Retry(delay),
                        Some(_) => FailAction::FailOldest(delay),
                        None => FailAction::Nothing,
                    }
                };
                match action {
                    FailAction::Retry(delay) => self.spawn_connect(tenant, delay),
                    FailAction::FailOldest(delay) => {
                        // This waiter's deadline can't absorb another
                        // backoff round; it pays for the failure.
                        let block = self.blocks.get_mut(&tenant).unwrap();
                        if let Some(waiter) = block.pop_live_waiter() {
                            let _ = waiter.tx.send(Err(Error::Connect(err)));
                        }
                        // Younger waiters may still have the time.
                        let retry = block
                            .oldest_waiter_deadline()
                            .is_some_and(|deadline| now + delay < deadline);
                        if retry {
                            self.spawn_connect(tenant, delay);
                        }
                    }
                    FailAction::Nothing => {}
                }
            }
        }
    }

    fn expire_waiters(&mut self) {
        let now = Instant::now();
        while let Some(expiry) = self.deadlines.pop_due(now) {
            let Some(block) = self.blocks.get_mut(&expiry.tenant) else {
                continue;
            };
            // Entries for claims already granted or cancelled are stale;
            // skip them.
            let Some(waiter) = block.remove_waiter(expiry.claim) else {
                continue;
            };
            if waiter.tx.is_closed() {
                continue;
            }
            event!(Level::TRACE, tenant = %expiry.tenant, "Claim timed out");
            block.note_timeout();
            let _ = waiter.tx.send(Err(Error::Timeout));
        }
    }

    #[instrument(level = "debug", skip(self), name = "PoolInner::rebalance", fields(pool = %self.name))]
    fn rebalance(&mut self) {
        let now = Instant::now();
        for block in self.blocks.values_mut() {
            block.purge_cancelled();
        }

        let ops = rebalancer::plan(&self.policy, &mut self.blocks, self.total_connected, now);
        for op in ops {
            match op {
                RebalanceOp::Grow(tenant) => {
                    if let Some(block) = self.blocks.get_mut(&tenant) {
                        let quota = block.quota() + 1;
                        block.set_quota(quota);
                    }
                }
                RebalanceOp::Shrink(tenant) => {
                    if let Some(block) = self.blocks.get_mut(&tenant) {
                        let quota = block
                            .quota()
                            .saturating_sub(1)
                            .max(self.policy.min_quota);
                        block.set_quota(quota);
                    }
                }
                RebalanceOp::CloseIdle { tenant, count } => {
                    if let Some(block) = self.blocks.get_mut(&tenant) {
                        let mut closed = 0;
                        for _ in 0..count {
                            if !block.close_idle_lru() {
                                break;
                            }
                            closed += 1;
                        }
                        self.total_connected -= closed;
                    }
                }
                RebalanceOp::Transfer { from, to } => self.transfer(&from, &to),
                RebalanceOp::Retire(tenant) => self.retire(&tenant),
            }
        }

        self.fill_from_spare(now);
    }

    // Closes one of the donor's idle connections and opens one for the
    // recipient. The close happens first, so capacity never overshoots.
    fn transfer(&mut self, from: &Name, to: &Name) {
        // The recipient must be able to use another attempt right now; a
        // backed-off block probing with one connect does not get more.
        if !self
            .blocks
            .get(to)
            .is_some_and(|block| block.may_spawn_connect())
        {
            return;
        }
        let Some(donor) = self.blocks.get_mut(from) else {
            return;
        };
        if !donor.close_idle_lru() {
            return;
        }
        let quota = donor
            .quota()
            .saturating_sub(1)
            .max(self.policy.min_quota);
        donor.set_quota(quota);
        self.total_connected -= 1;
        event!(Level::DEBUG, from = %from, to = %to, "Moving capacity between tenants");
        let delay = self
            .blocks
            .get(to)
            .map(|block| block.backoff.current_delay())
            .unwrap_or_default();
        self.spawn_connect(to.clone(), delay);
    }

    // Turns spare capacity into connections for whichever blocks have
    // uncovered waiters, oldest wait first.
    fn fill_from_spare(&mut self, now: Instant) {
        while self.total_connected < self.policy.max_connections {
            let next = self
                .blocks
                .iter()
                .filter(|(_, block)| block.may_spawn_connect())
                .max_by_key(|(_, block)| block.oldest_wait(now))
                .map(|(name, _)| name.clone());
            let Some(tenant) = next else {
                return;
            };
            let delay = self
                .blocks
                .get(&tenant)
                .unwrap()
                .backoff
                .current_delay();
            self.spawn_connect(tenant, delay);
        }
    }

    fn spawn_connect(&mut self, tenant: Name, delay: Duration) {
        let block = self.blocks.get_mut(&tenant).unwrap();
        block.begin_connect();
        self.total_connected += 1;
        debug_assert!(
            self.total_connected <= self.policy.max_connections,
            "connect would exceed capacity"
        );

        let connector = self.connector.clone();
        let tx = self.connect_tx.clone();
        self.connect_tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = connector.connect(&tenant).await;
            let _ = tx.send(ConnectOutcome { tenant, result }).await;
        });
    }

    fn ensure_block(&mut self, tenant: &Name) {
        if self.blocks.contains_key(tenant) {
            return;
        }
        event!(Level::DEBUG, tenant = %tenant, "New tenant block");
        let block = Block::new(tenant.clone(), &self.policy);
        self.stats_tx.send_modify(|stats| {
            stats.insert(tenant.clone(), TenantStats(block.stats_handle()));
        });
        self.blocks.insert(tenant.clone(), block);
    }

    fn retire(&mut self, tenant: &Name) {
        let Some(block) = self.blocks.get(tenant) else {
            return;
        };
        if block.connected() != 0 || block.has_waiters() {
            return;
        }
        event!(Level::DEBUG, tenant = %tenant, "Retiring dormant tenant block");
        self.blocks.remove(tenant);
        self.stats_tx
            .send_if_modified(|stats| stats.remove(tenant).is_some());
    }

    #[instrument(skip(self), name = "PoolInner::terminate", fields(pool = %self.name))]
    fn terminate(&mut self) {
        self.connect_tasks.abort_all();
        for (_, mut block) in self.blocks.drain() {
            for waiter in block.drain_for_shutdown() {
                let _ = waiter.tx.send(Err(Error::Terminated));
            }
        }
        self.total_connected = 0;
        self.stats_tx.send_replace(HashMap::new());
    }

    #[cfg(debug_assertions)]
    #[track_caller]
    fn check_consistency(&self) {
        let mut total = 0;
        let mut waiting = 0;
        for block in self.blocks.values() {
            block.check_consistency();
            total += block.connected();
            waiting += block.waiter_count();
        }
        assert_eq!(
            total, self.total_connected,
            "pool connection accounting drifted"
        );
        assert!(
            total <= self.policy.max_connections,
            "capacity invariant violated: {total} > {}",
            self.policy.max_connections
        );
        // The deadline heap holds stale entries until they surface, so it
        // can only ever over-count the live waiters.
        assert!(
            self.deadlines.len() >= waiting,
            "queued waiters without tracked deadlines"
        );
    }
}

/// Manages a budget of connections shared by many tenants
pub struct Pool<Conn: Connection> {
    name: Arc<str>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    policy: Policy,
    tx: mpsc::Sender<Request<Conn>>,
    stats: Stats,
}

impl<Conn: Connection> Pool<Conn> {
    /// Creates a new connection pool.
    ///
    /// - name: The name of this pool, for instrumentation.
    /// - connector: Describes how connections for a tenant should be
    ///   made.
    /// - policy: Capacity limits and rebalancing tunables.
    ///
    /// ```no_run
    /// use shoal::backend::Name;
    /// use shoal::connectors::tcp::TcpConnector;
    /// use shoal::policy::Policy;
    /// use shoal::pool::Pool;
    /// use std::sync::Arc;
    ///
    /// # async {
    /// // Create the connector -- we're using a simple TCP connection.
    /// let connector = Arc::new(TcpConnector::new([
    ///     (Name::new("tenant-a"), "[::1]:5432".parse().unwrap()),
    /// ]));
    ///
    /// // Create the connection pool itself.
    /// let pool = Pool::new("my-pool".to_string(), connector, Policy::default());
    ///
    /// // Grab a connection from the pool. The claim waits if the tenant
    /// // has no connection to spare right now.
    /// let connection = pool.acquire("tenant-a").await.unwrap();
    /// # };
    /// ```
    pub fn new(
        name: String,
        connector: backend::SharedConnector<Conn>,
        policy: Policy,
    ) -> Self {
        policy.validate();
        let (tx, rx) = mpsc::channel(1);
        let (stats_tx, stats_rx) = watch::channel(HashMap::default());
        let claims = Arc::new(AtomicUsize::new(0));
        let name: Arc<str> = name.into();

        let worker = PoolInner::new(
            name.clone(),
            connector,
            policy.clone(),
            rx,
            stats_tx,
            claims.clone(),
        );
        let handle = tokio::task::spawn(worker.run());

        Self {
            name,
            handle: Mutex::new(Some(handle)),
            stats: Stats {
                rx: stats_rx,
                claims,
                capacity: policy.max_connections,
            },
            policy,
            tx,
        }
    }

    /// The name this pool was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires a connection for a tenant, waiting up to the policy's
    /// claim timeout.
    ///
    /// Dropping the returned future cancels the claim; a connection that
    /// was being prepared for it goes back to the pool unharmed.
    pub async fn acquire(&self, tenant: &str) -> Result<claim::Handle<Conn>, Error> {
        self.acquire_until(tenant, Instant::now() + self.policy.claim_timeout)
            .await
    }

    /// Acquires a connection for a tenant, waiting until `deadline`.
    pub async fn acquire_until(
        &self,
        tenant: &str,
        deadline: Instant,
    ) -> Result<claim::Handle<Conn>, Error> {
        let id = ClaimId::new();
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Acquire {
                id,
                tenant: Name::from(tenant),
                deadline,
                tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Returns a reference to pool-wide stats
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Terminates the connection pool.
    ///
    /// Queued claims fail with [Error::Terminated]; connections still
    /// checked out are closed when their handles drop.
    pub async fn terminate(&self) -> Result<(), Error> {
        self.tx
            .send(Request::Terminate)
            .await
            .map_err(|_| Error::Terminated)?;
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return Ok(());
        };
        handle.await.map_err(|_| Error::Terminated)
    }
}

impl<Conn: Connection> Drop for Pool<Conn> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
