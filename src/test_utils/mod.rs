//! Utilities to help with testing shoal

use crate::backend::{self, Connector, Name};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::time::Duration;

/// A connection handed out by [TestConnector], tagged with a unique id
/// so tests can tell reuse from reconnection.
pub(crate) struct TestConnection {
    pub(crate) id: usize,
    #[allow(dead_code)]
    pub(crate) tenant: Name,
}

/// A test-only connector with switchable failure injection and a
/// configurable connect latency. Connection ids start at 1.
pub(crate) struct TestConnector {
    next_id: AtomicUsize,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl TestConnector {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            failing: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        let connector = Self::new();
        connector
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        connector
    }

    /// While failing, every connect attempt errors out.
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Connections created so far.
    pub(crate) fn connects(&self) -> usize {
        self.next_id.load(Ordering::SeqCst) - 1
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Connection = TestConnection;

    async fn connect(&self, tenant: &Name) -> Result<Self::Connection, backend::Error> {
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(backend::Error::Other(anyhow::anyhow!(
                "injected connect failure"
            )));
        }
        Ok(TestConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            tenant: tenant.clone(),
        })
    }
}

/// A test-only connector which can slow down connection access
/// to mimic high-latency connection issues.
pub(crate) struct SlowConnector {
    delay_ms: AtomicU64,
    panic_on_access: AtomicBool,
}

impl SlowConnector {
    /// Creates a new connector, which only takes 1ms per operation
    pub(crate) fn new() -> Self {
        Self {
            delay_ms: AtomicU64::new(1),
            panic_on_access: AtomicBool::new(false),
        }
    }

    /// Stalls all new operations through the connector, forcing them to
    /// take an unrealistically long time.
    pub(crate) fn stall(&self) {
        self.delay_ms.store(9999999, Ordering::SeqCst);
    }

    /// Mark that any future access through the connector should panic.
    ///
    /// "stall" keeps connect attempts from finishing; this verifies that
    /// no new attempts are even started.
    pub(crate) fn panic_on_access(&self) {
        self.panic_on_access.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for SlowConnector {
    type Connection = ();

    async fn connect(&self, _tenant: &Name) -> Result<Self::Connection, backend::Error> {
        if self.panic_on_access.load(Ordering::SeqCst) {
            panic!("Should not be making new requests through this connector!");
        }
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(())
    }
}
