//! Server-scoped registry of established endpoints.
//!
//! Tracks live peers by `client_id`, resolves duplicate identifiers by
//! closing the older connection, and supports force-closing everything on
//! shutdown.

use std::sync::Arc;

use dashmap::DashMap;

use crate::endpoint::{CloseReason, Endpoint};

/// Registry of established endpoints keyed by `client_id`.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Endpoint>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Registers an established endpoint under its `client_id`.
    ///
    /// Two active endpoints never share a `client_id`: if the id is taken,
    /// the older endpoint is closed and replaced.
    pub fn register(&self, client_id: &str, endpoint: Arc<Endpoint>) {
        if let Some(older) = self.connections.insert(client_id.to_string(), endpoint) {
            log::warn!(
                "[Registry] Duplicate client_id {}, closing older connection",
                client_id
            );
            older.close(CloseReason::DuplicateClient, false);
        }
        log::info!(
            "[Registry] Registered {} (total: {})",
            client_id,
            self.connections.len()
        );
    }

    /// Removes `client_id` if it still maps to this endpoint.
    ///
    /// Compare-and-remove: a closing endpoint that was already replaced by
    /// a duplicate-id successor must not evict its successor.
    pub fn deregister(&self, client_id: &str, endpoint: &Arc<Endpoint>) {
        let removed = self
            .connections
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, endpoint));
        if removed.is_some() {
            log::info!(
                "[Registry] Deregistered {} (remaining: {})",
                client_id,
                self.connections.len()
            );
        }
    }

    /// Looks up an endpoint by client id.
    pub fn get(&self, client_id: &str) -> Option<Arc<Endpoint>> {
        self.connections.get(client_id).map(|e| Arc::clone(&e))
    }

    /// Number of registered endpoints.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Closes every registered endpoint. Returns how many were signalled.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let endpoints: Vec<Arc<Endpoint>> = self
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let count = endpoints.len();
        if count > 0 {
            log::info!("[Registry] Force-closing {} connection(s)", count);
        }
        for endpoint in endpoints {
            endpoint.close(reason, false);
        }
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
