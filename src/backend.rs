//! The interface for identifying tenants and connecting on their behalf.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Identifies a tenant: one logical database sharing the pool.
///
/// Blocks, quotas, and wait queues are all keyed by this name.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Name(pub Arc<str>);

impl Name {
    pub fn new(name: impl ToString) -> Self {
        Self(name.to_string().into())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for Name {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Interface for raw connections.
pub trait Connection: Send + 'static {}

impl<T> Connection for T where T: Send + 'static {}

/// Describes how a connection for a tenant should be constructed.
///
/// The pool treats this as an unreliable, possibly slow operation: it may
/// fail, and it may hang well past any deadline. Failures are retried
/// under per-tenant exponential backoff, so one broken tenant cannot
/// stall the others.
///
/// Connections are closed by dropping them.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Opens a connection to the backend on behalf of a tenant.
    async fn connect(&self, tenant: &Name) -> Result<Self::Connection, Error>;
}

pub type SharedConnector<Conn> = Arc<dyn Connector<Connection = Conn>>;
