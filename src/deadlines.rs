//! A time-ordered queue of claim deadlines.

use crate::backend::Name;
use crate::ClaimId;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// One waiter's deadline.
///
/// Entries are not removed when a waiter is granted or cancelled; the
/// pool worker skips stale entries when they surface, which keeps every
/// queue operation O(log n).
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct Expiry {
    pub(crate) at: Instant,
    pub(crate) claim: ClaimId,
    pub(crate) tenant: Name,
}

impl Ord for Expiry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.claim.0).cmp(&(other.at, other.claim.0))
    }
}

impl PartialOrd for Expiry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of waiter deadlines, soonest first.
#[derive(Debug, Default)]
pub(crate) struct DeadlineQueue {
    heap: BinaryHeap<Reverse<Expiry>>,
}

impl DeadlineQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, expiry: Expiry) {
        self.heap.push(Reverse(expiry));
    }

    /// The soonest deadline currently tracked, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.at)
    }

    /// Pops the next entry whose deadline has passed.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Expiry> {
        if self.heap.peek().is_some_and(|Reverse(e)| e.at <= now) {
            self.heap.pop().map(|Reverse(e)| e)
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
