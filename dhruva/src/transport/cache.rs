//! Reuse of stream connections.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use super::{Transport, TransportType};
use crate::error::Result;
use crate::metrics::{Metric, MetricName, MetricsSink};

/// Identifies a connection by both its ends and its transport.
///
/// An unspecified local address or a zero local port matches any local
/// address or port, so a lookup can ignore the local end.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionKey {
    pub transport: TransportType,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl ConnectionKey {
    pub fn new(transport: TransportType, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            transport,
            local,
            remote,
        }
    }

    /// A key matching any connection to `remote` over `transport`.
    pub fn for_remote(transport: TransportType, remote: SocketAddr) -> Self {
        let local = match remote {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        Self::new(transport, local, remote)
    }
}

impl PartialEq for ConnectionKey {
    fn eq(&self, other: &Self) -> bool {
        let ip_matches = self.local.ip().is_unspecified()
            || other.local.ip().is_unspecified()
            || self.local.ip() == other.local.ip();
        let port_matches =
            self.local.port() == 0 || other.local.port() == 0 || self.local.port() == other.local.port();

        self.transport == other.transport && self.remote == other.remote && ip_matches && port_matches
    }
}

impl Eq for ConnectionKey {}

impl Hash for ConnectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.hash(state);
        self.remote.hash(state);
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.transport,
            self.local.ip(),
            self.local.port(),
            self.remote.ip(),
            self.remote.port()
        )
    }
}

/// Stream connections, reclaimed once idle for too long.
pub struct ConnectionCache {
    connections: DashMap<ConnectionKey, Transport>,
    idle_timeout: Duration,
}

impl ConnectionCache {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            idle_timeout,
        }
    }

    /// Returns the open connection for `key`.
    ///
    /// A connection found closed is dropped from the cache.
    pub fn get(&self, key: &ConnectionKey) -> Option<Transport> {
        let transport = self.connections.get(key).map(|entry| entry.value().clone())?;
        if transport.is_closed() {
            self.connections.remove(key);
            return None;
        }
        Some(transport)
    }

    pub fn insert(&self, transport: Transport) {
        log::trace!("Caching connection {}", transport.key());
        self.connections.insert(transport.key(), transport);
    }

    /// Returns the cached connection for `key`, or opens one with `connect`.
    ///
    /// When two callers race, the first inserted connection wins and the other
    /// one is closed.
    pub async fn get_or_connect<F>(&self, key: &ConnectionKey, connect: F) -> Result<Transport>
    where
        F: std::future::Future<Output = Result<Transport>>,
    {
        if let Some(transport) = self.get(key) {
            return Ok(transport);
        }

        let transport = connect.await?;
        let winner = match self.connections.entry(transport.key()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => Some(entry.get().clone()),
            Entry::Occupied(mut entry) => {
                entry.insert(transport.clone());
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(transport.clone());
                None
            }
        };

        if let Some(winner) = winner {
            transport.close().await;
            return Ok(winner);
        }
        Ok(transport)
    }

    /// Removes and closes the connection for `key`.
    pub async fn remove(&self, key: &ConnectionKey) -> Option<Transport> {
        let (_, transport) = self.connections.remove(key)?;
        transport.close().await;
        Some(transport)
    }

    /// Forgets the connection for `key` without closing it.
    pub fn forget(&self, key: &ConnectionKey) {
        self.connections.remove(key);
    }

    /// Closes every connection idle for longer than the idle timeout.
    ///
    /// Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<ConnectionKey> = self
            .connections
            .iter()
            .filter(|entry| entry.is_closed() || entry.idle_for() >= self.idle_timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self.remove(&key).await.is_some() {
                log::debug!("Connection {} idle for too long, closed", key);
                removed += 1;
            }
        }
        removed
    }

    /// Closes every connection.
    pub async fn clear(&self) {
        let keys: Vec<ConnectionKey> = self.connections.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.remove(&key).await;
        }
    }

    /// Number of cached connections of `transport`.
    pub fn count(&self, transport: TransportType) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.key().transport == transport)
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Sweeps every `interval` and reports the connection counts.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, metrics: Arc<dyn MetricsSink>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep().await;
                for transport in [TransportType::Tcp, TransportType::Tls] {
                    metrics.emit(
                        Metric::new(MetricName::Connection)
                            .tag("transport", transport)
                            .field("active", self.count(transport))
                            .field("swept", removed),
                    );
                }
            }
        })
    }
}
