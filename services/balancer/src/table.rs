//! Route table keyed by listen address.
//!
//! Writers take the write lock only to insert or remove; status queries
//! and lifecycle fan-out read a cloned list of routes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::route::Route;

#[derive(Default)]
struct Entries {
    by_listen: HashMap<SocketAddr, Arc<Route>>,
    /// Registration order, used by `start`.
    order: Vec<SocketAddr>,
}

/// Mapping from listen address to its route.
#[derive(Default)]
pub struct RouteTable {
    entries: RwLock<Entries>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, listen: &SocketAddr) -> Option<Arc<Route>> {
        self.entries.read().await.by_listen.get(listen).cloned()
    }

    /// Register `route` unless its listen address is taken.
    ///
    /// Returns the existing route when there is one, leaving the table
    /// unchanged.
    pub async fn insert(&self, route: Arc<Route>) -> Result<(), Arc<Route>> {
        let mut entries = self.entries.write().await;
        let listen = route.listen();

        if let Some(existing) = entries.by_listen.get(&listen) {
            return Err(Arc::clone(existing));
        }

        entries.by_listen.insert(listen, route);
        entries.order.push(listen);
        debug!(listen = %listen, route_count = entries.order.len(), "Route registered");
        Ok(())
    }

    pub async fn remove(&self, listen: &SocketAddr) -> Option<Arc<Route>> {
        let mut entries = self.entries.write().await;
        let route = entries.by_listen.remove(listen)?;
        entries.order.retain(|l| l != listen);
        debug!(listen = %listen, "Route unregistered");
        Some(route)
    }

    /// All routes in registration order.
    pub async fn routes(&self) -> Vec<Arc<Route>> {
        let entries = self.entries.read().await;
        entries
            .order
            .iter()
            .filter_map(|listen| entries.by_listen.get(listen).cloned())
            .collect()
    }

    /// Remove and return every route in registration order.
    pub async fn take_all(&self) -> Vec<Arc<Route>> {
        let mut entries = self.entries.write().await;
        let Entries {
            mut by_listen,
            order,
        } = std::mem::take(&mut *entries);
        order
            .into_iter()
            .filter_map(|listen| by_listen.remove(&listen))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.order.len()
    }
}
