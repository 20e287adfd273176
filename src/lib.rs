//! shoal is a connection pooling crate for multi-tenant servers.
//!
//! shoal arbitrates a fixed budget of backend connections among many
//! independent tenants, adjusting each tenant's share as demand shifts.
//!
//! It uses the following terminology:
//! * Tenants are logical databases (or other isolated consumers) which
//!   each need their own backend connections.
//! * Blocks are the pool's per-tenant records: a tenant's current quota,
//!   its open connections, and its queue of waiting claims.
//! * Quota is a block's soft entitlement to connections. Quotas adapt
//!   over time; the hard capacity limit never moves.
//!
//! # Usage
//!
//! * The main interface for this crate is [pool::Pool].
//! * To construct a pool, you must supply a [backend::Connector], which
//!   specifies "how to open a connection for a tenant", and a
//!   [policy::Policy], which bounds capacity and tunes the rebalancer.
//! * [pool::Pool::acquire] suspends until a connection is available for
//!   the tenant or the claim's deadline passes. The returned
//!   [claim::Handle] puts the connection back when dropped.
//!
//! All decisions (granting claims, recycling released connections,
//! absorbing connect results, expiring deadlines, rebalancing quotas)
//! are made by a single worker task against one consistent view of the
//! pool. Connection I/O never happens on that task; it is farmed out and
//! reported back asynchronously.
//!
//! Every duration and deadline flows through `tokio::time`, so the whole
//! pool runs under tokio's paused test clock. The long-horizon fairness
//! simulation in `tests/simulation.rs` leans on this to compress hours of
//! churn into a few seconds of wall time.

// Public API
pub mod backend;
pub mod claim;
pub mod policy;
pub mod pool;

// Necessary for implementation
mod backoff;
mod block;
mod deadlines;
mod rebalancer;
#[cfg(test)]
mod test_utils;
mod window_counter;

// Default implementations of generic interfaces
pub mod connectors;

use std::sync::atomic::{AtomicU64, Ordering};

/// Uniquely identifies a claim
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ClaimId(pub u64);

impl ClaimId {
    fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}
