//! Connection tracking for the relay servers.
//!
//! Each accepted connection is stored with its peer address and the
//! session that services it. The registry hands out stable slab keys that
//! double as readiness tokens.

use crate::runtime::session::Session;
use slab::Slab;
use std::net::SocketAddr;

/// A single accepted client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// Remote endpoint.
    pub peer: SocketAddr,
    /// Echo session owning the stream and its transfer buffer.
    pub session: Session<S>,
}

impl<S> Connection<S> {
    pub fn new(peer: SocketAddr, session: Session<S>) -> Self {
        Self { peer, session }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<T> {
    connections: Slab<T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the value back if the registry is at capacity.
    pub fn insert(&mut self, conn: T) -> Result<usize, T> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    #[cfg(test)]
    pub fn get(&self, id: usize) -> Option<&T> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.connections.try_remove(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// True when no further connection can be inserted.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Remove and yield every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = (usize, T)> + '_ {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        ids.into_iter()
            .filter_map(move |id| self.connections.try_remove(id).map(|conn| (id, conn)))
    }
}
