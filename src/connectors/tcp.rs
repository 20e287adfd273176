//! Implementation of [Connector] for TCP.

use crate::backend::{self, Connector, Error, Name};

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Connects tenants to backends over plain TCP, using a fixed mapping
/// from tenant name to backend address.
pub struct TcpConnector {
    addrs: HashMap<Name, SocketAddr>,
}

impl TcpConnector {
    pub fn new(addrs: impl IntoIterator<Item = (Name, SocketAddr)>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Connection = TcpStream;

    async fn connect(&self, tenant: &Name) -> Result<Self::Connection, Error> {
        let Some(addr) = self.addrs.get(tenant) else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no backend address for tenant {tenant}"),
            )));
        };
        TcpStream::connect(addr).await.map_err(backend::Error::from)
    }
}
