//! Connections which are borrowed from the connection pool.

use crate::backend::{Connection, Name};
use std::cell::Cell;
use tokio::sync::mpsc::OwnedPermit;

/// A connection travelling back to the pool worker.
///
/// Carries enough context for the worker to put it back in the right
/// block, or to discard it if the holder poisoned it.
pub(crate) struct Returned<Conn: Connection> {
    pub(crate) conn: Conn,
    pub(crate) tenant: Name,
    pub(crate) poisoned: bool,
}

/// A [Connection] which is returned to the pool when dropped.
///
/// Note that this method implements [std::ops::Deref] for the
/// generic `Conn` type, and generally, clients should transparently
/// use a handle as a connection.
///
/// The return trip uses channel capacity reserved when the claim was
/// granted, so dropping a handle can neither block nor fail.
pub struct Handle<Conn: Connection> {
    inner: Option<Returned<Conn>>,
    permit: Option<OwnedPermit<Returned<Conn>>>,
    poisoned: Cell<bool>,
}

impl<Conn: Connection> Handle<Conn> {
    pub(crate) fn new(conn: Returned<Conn>, permit: OwnedPermit<Returned<Conn>>) -> Self {
        Self {
            inner: Some(conn),
            permit: Some(permit),
            poisoned: Cell::new(false),
        }
    }

    /// The tenant this connection belongs to.
    pub fn tenant(&self) -> &Name {
        self.inner.as_ref().map(|inner| &inner.tenant).unwrap()
    }

    /// Marks the connection as broken.
    ///
    /// A poisoned connection is closed when the handle is dropped rather
    /// than being recycled for the next claim. Use this when the remote
    /// end has hung up or the protocol state is no longer trustworthy.
    pub fn poison(&self) {
        self.poisoned.set(true);
    }
}

impl<Conn: Connection> std::ops::Deref for Handle<Conn> {
    type Target = Conn;
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().map(|inner| &inner.conn).unwrap()
    }
}

impl<Conn: Connection> std::ops::DerefMut for Handle<Conn> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut().map(|inner| &mut inner.conn).unwrap()
    }
}

impl<Conn: Connection> Drop for Handle<Conn> {
    fn drop(&mut self) {
        let mut conn = self.inner.take().unwrap();
        conn.poisoned = self.poisoned.get();
        let permit = self.permit.take().unwrap();

        permit.send(conn);
    }
}
