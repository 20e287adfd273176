//! The quota control loop.
//!
//! The rebalancer plans; the pool worker applies. Planning functions take
//! a read-mostly view of the block map and return a list of operations,
//! which keeps the policy here unit-testable without spinning up a pool.
//!
//! The control policy is additive-increase/additive-decrease: a pressured
//! block gains one quota per pass, an idle block loses one, and the
//! capacity freed by decay flows to whoever is hungry. Small steps on a
//! short cadence converge quickly without oscillating when two tenants
//! both want the same spare connection.

use crate::backend::{Connection, Name};
use crate::block::Block;
use crate::policy::Policy;

use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{event, Level};

/// One step of a rebalancing plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RebalanceOp {
    /// Raise a pressured block's quota by one.
    Grow(Name),
    /// Lower an idle block's quota by one.
    Shrink(Name),
    /// Close stale idle connections, oldest first.
    CloseIdle { tenant: Name, count: usize },
    /// Close one idle connection of `from` and open one for `to`.
    Transfer { from: Name, to: Name },
    /// Garbage-collect a dormant block.
    Retire(Name),
}

/// Plans one full rebalancing pass.
///
/// `total_connected` is the pool-wide connection count, used to decide
/// whether starved blocks need transfers (pool full) or can simply grow
/// into spare capacity.
pub(crate) fn plan<Conn: Connection>(
    policy: &Policy,
    blocks: &mut HashMap<Name, Block<Conn>>,
    total_connected: usize,
    now: Instant,
) -> Vec<RebalanceOp> {
    let mut ops = Vec::new();
    let live_blocks = blocks.len();

    // Starved blocks wanting a transfer, most pressured first.
    let mut hungry: Vec<(usize, Name)> = Vec::new();
    // Blocks that could give a connection up, best donor first.
    let mut donors: Vec<(usize, Name)> = Vec::new();

    for (name, block) in blocks.iter_mut() {
        if block.is_dormant(now, policy.dormancy_period) {
            ops.push(RebalanceOp::Retire(name.clone()));
            continue;
        }

        let pressure = block.pressure(now, policy.pressure_threshold);
        // Overflow connections a block is demonstrably using get ratified
        // into quota, so sustained demand served through overflow still
        // converges to an honest entitlement.
        let ratify = block.connected() > block.quota() && block.demand() > 0;
        if pressure > 0 || ratify {
            // Additive increase, bounded so every other live block keeps
            // room for its minimum quota.
            let reserve = policy.min_quota * live_blocks.saturating_sub(1);
            let ceiling = policy
                .max_connections
                .saturating_sub(reserve)
                .max(policy.min_quota);
            if block.quota() < ceiling {
                ops.push(RebalanceOp::Grow(name.clone()));
            }
            if block.may_spawn_connect() {
                hungry.push((pressure, name.clone()));
            }
            continue;
        }

        // A block with no demand for a whole dormancy window drains
        // completely so it can be retired; the min-quota floor only
        // protects tenants that still show up.
        let quiet = block.active_count() == 0
            && block.connecting_count() == 0
            && block.demand() == 0
            && block.quiet_for(now) >= policy.dormancy_period;
        if quiet {
            if block.idle_count() > 0 {
                ops.push(RebalanceOp::CloseIdle {
                    tenant: name.clone(),
                    count: block.idle_count(),
                });
            }
            continue;
        }

        // No pressure: decay. Stale idle connections are closed (down to
        // the quota floor), and a block coasting on old quota gives one
        // step back.
        let stale = block.idle_older_than(policy.idle_grace_period, now);
        if stale > 0 {
            let closable = stale.min(block.connected().saturating_sub(policy.min_quota));
            if closable > 0 {
                ops.push(RebalanceOp::CloseIdle {
                    tenant: name.clone(),
                    count: closable,
                });
            }
            if block.quota() > policy.min_quota {
                ops.push(RebalanceOp::Shrink(name.clone()));
            }
        }

        if let Some(score) = donor_score(policy, block) {
            donors.push((score, name.clone()));
        }
    }

    // Transfers only matter once the pool is saturated; under capacity,
    // hungry blocks are served by plain creates instead.
    if total_connected >= policy.max_connections {
        hungry.sort();
        donors.sort();
        while let Some((pressure, to)) = hungry.pop() {
            let Some((score, from)) = donors.pop() else {
                break;
            };
            event!(
                Level::DEBUG,
                from = %from,
                to = %to,
                pressure,
                donor_score = score,
                "Rebalancing: transferring a connection"
            );
            ops.push(RebalanceOp::Transfer { from, to });
        }
    }

    ops
}

/// Picks the block best able to give up an idle connection right now.
///
/// Used on the eager path, when an acquire against a full pool is forced
/// to wait.
pub(crate) fn find_donor<Conn: Connection>(
    policy: &Policy,
    blocks: &HashMap<Name, Block<Conn>>,
    exclude: &Name,
    now: Instant,
) -> Option<Name> {
    blocks
        .iter()
        .filter(|(name, _)| *name != exclude)
        .filter(|(_, block)| block.pressure(now, policy.pressure_threshold) == 0)
        .filter_map(|(name, block)| donor_score(policy, block).map(|score| (score, name.clone())))
        .max_by_key(|(score, _)| *score)
        .map(|(_, name)| name)
}

/// Picks the block whose waiters most need a released connection.
///
/// Used on the release path when the pool is full: the freshly idled
/// connection can be closed and re-opened for a starving tenant.
pub(crate) fn find_starved<Conn: Connection>(
    blocks: &HashMap<Name, Block<Conn>>,
    exclude: &Name,
    now: Instant,
) -> Option<Name> {
    blocks
        .iter()
        .filter(|(name, _)| *name != exclude)
        .filter(|(_, block)| block.may_spawn_connect())
        .max_by_key(|(_, block)| (block.waiter_count(), block.oldest_wait(now)))
        .map(|(name, _)| name.clone())
}

// Overflow connections (beyond quota) are the first candidates to give
// back; after that, an unpressured block above its minimum quota may
// donate. Blocks with no recent demand rank higher.
fn donor_score<Conn: Connection>(policy: &Policy, block: &Block<Conn>) -> Option<usize> {
    if block.idle_count() == 0 {
        return None;
    }
    let overflow = block.connected().saturating_sub(block.quota());
    if overflow == 0 && block.quota() <= policy.min_quota {
        return None;
    }
    Some(overflow * 4 + block.idle_count() * 2 + usize::from(block.waiter_count() == 0))
}
