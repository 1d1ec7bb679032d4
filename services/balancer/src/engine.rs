//! The load-balancing engine.
//!
//! Callers talk to the engine through the [`LoadBalancer`] capability
//! trait. [`TcpLoadBalancer`] is the implementation; it owns the route
//! table and runs every task it spawns under the logging dispatch it was
//! built with.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use tcplb_upstream::{EndpointSnapshot, HealthEvent, Probe, TcpProbe};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn, Dispatch};

use crate::error::LbError;
use crate::options::RouteOptions;
use crate::route::{Route, RouteState, RouteStatsSnapshot};
use crate::table::RouteTable;

/// Engine-facing contract.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Register a route, or update the pool of an existing one in place.
    async fn add_route(
        &self,
        listen: &str,
        upstreams: &[String],
        options: RouteOptions,
    ) -> Result<(), LbError>;

    /// Unregister a route and drain it.
    async fn remove_route(&self, listen: &str) -> Result<(), LbError>;

    /// Start every registered route.
    async fn start(&self) -> Result<(), LbError>;

    /// Drain every route and wait for all of them to close.
    async fn close(&self) -> Result<(), LbError>;
}

/// Factory for [`LoadBalancer`] instances.
pub trait LoadBalancerProvider {
    /// Build an engine logging to `log`. `None` discards all logs.
    fn new_balancer(&self, log: Option<Dispatch>) -> Result<Box<dyn LoadBalancer>, LbError>;
}

/// Provider returning [`TcpLoadBalancer`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpLoadBalancerProvider;

impl LoadBalancerProvider for TcpLoadBalancerProvider {
    fn new_balancer(&self, log: Option<Dispatch>) -> Result<Box<dyn LoadBalancer>, LbError> {
        Ok(Box::new(TcpLoadBalancer::new(log)?))
    }
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Idle,
    Running,
    Closed,
}

/// TCP load balancer over a table of routes.
pub struct TcpLoadBalancer {
    table: RouteTable,
    /// Guards lifecycle changes and route registration.
    state: Mutex<EngineState>,
    /// Held shared by `remove_route` while its route drains and exclusively
    /// by `close` for its whole run, so every closer waits for every drain.
    drain_gate: RwLock<()>,
    dispatch: Dispatch,
    probe: Arc<dyn Probe>,
}

impl TcpLoadBalancer {
    /// Build an engine. Must be called from within a tokio runtime.
    pub fn new(log: Option<Dispatch>) -> Result<Self, LbError> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| LbError::Construction(format!("no tokio runtime: {e}")))?;

        let dispatch = log.unwrap_or_else(Dispatch::none);

        Ok(Self {
            table: RouteTable::new(),
            state: Mutex::new(EngineState::Idle),
            drain_gate: RwLock::new(()),
            dispatch,
            probe: Arc::new(TcpProbe),
        })
    }

    /// Use a different health probe for routes added from now on.
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    pub async fn state(&self) -> EngineState {
        *self.state.lock().await
    }

    /// Look up a route by listen address.
    pub async fn route(&self, listen: &str) -> Option<Arc<Route>> {
        let listen = parse_listen(listen).ok()?;
        self.table.get(&listen).await
    }

    /// Bound address of a started route.
    pub async fn local_addr(&self, listen: &str) -> Option<SocketAddr> {
        self.route(listen).await?.local_addr()
    }

    pub async fn upstream_status(&self, listen: &str) -> Option<Vec<EndpointSnapshot>> {
        Some(self.route(listen).await?.upstream_status())
    }

    pub async fn route_stats(&self, listen: &str) -> Option<RouteStatsSnapshot> {
        Some(self.route(listen).await?.stats())
    }

    pub async fn subscribe_health(&self, listen: &str) -> Option<broadcast::Receiver<HealthEvent>> {
        Some(self.route(listen).await?.subscribe_health())
    }

    /// Listen addresses in registration order.
    pub async fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.table
            .routes()
            .await
            .iter()
            .map(|r| r.listen())
            .collect()
    }

    async fn add_route_inner(
        &self,
        listen: &str,
        upstreams: &[String],
        options: RouteOptions,
    ) -> Result<(), LbError> {
        let listen_addr = parse_listen(listen)?;
        if upstreams.is_empty() {
            return Err(LbError::invalid_route(listen, "upstream list is empty"));
        }

        let state = self.state.lock().await;
        if *state == EngineState::Closed {
            return Err(LbError::Closed);
        }

        if let Some(route) = self.table.get(&listen_addr).await {
            if route.options() != &options {
                debug!(listen = %listen_addr, "Options of an existing route are not changed by an update");
            }
            route.update_upstreams(upstreams)?;

            // Left behind by a failed start
            if *state == EngineState::Running && route.state() == RouteState::Created {
                info!(listen = %listen_addr, "Starting route left unstarted");
                if let Err(e) = route.start().await {
                    self.table.remove(&listen_addr).await;
                    return Err(e);
                }
            }
            return Ok(());
        }

        let route = Arc::new(Route::new(
            listen_addr,
            upstreams,
            options,
            Arc::clone(&self.probe),
            self.dispatch.clone(),
        )?);

        if let Err(existing) = self.table.insert(Arc::clone(&route)).await {
            // Registration happens under the state lock, so this is only
            // reachable if the table was shared elsewhere
            existing.update_upstreams(upstreams)?;
            return Ok(());
        }

        let route_count = self.table.len().await;
        info!(
            listen = %listen_addr,
            upstreams = ?upstreams,
            route_count = route_count,
            "Route added"
        );

        if *state == EngineState::Running {
            if let Err(e) = route.start().await {
                self.table.remove(&listen_addr).await;
                return Err(e);
            }
        }

        Ok(())
    }

    async fn remove_route_inner(&self, listen: &str) -> Result<(), LbError> {
        let listen_addr = parse_listen(listen)?;
        let _draining = self.drain_gate.read().await;

        // Unregister under the state lock so a running `start` never sees
        // a route closed underneath it
        let route = {
            let state = self.state.lock().await;
            if *state == EngineState::Closed {
                return Err(LbError::Closed);
            }
            self.table
                .remove(&listen_addr)
                .await
                .ok_or_else(|| LbError::invalid_route(listen, "no route registered"))?
        };

        info!(listen = %listen_addr, "Removing route");
        route.close().await
    }

    async fn start_inner(&self) -> Result<(), LbError> {
        let mut state = self.state.lock().await;
        match *state {
            EngineState::Idle => {}
            EngineState::Running => {
                return Err(LbError::InvalidState("load balancer already started".to_string()))
            }
            EngineState::Closed => return Err(LbError::Closed),
        }

        // Routes started before a bind failure keep running until close
        *state = EngineState::Running;

        let routes = self.table.routes().await;
        info!(route_count = routes.len(), "Starting load balancer");

        for route in routes {
            if let Err(e) = route.start().await {
                warn!(listen = %route.listen(), error = %e, "Route failed to start");
                return Err(e);
            }
        }

        Ok(())
    }

    async fn close_inner(&self) -> Result<(), LbError> {
        // Later closers queue here until the first one has drained
        let _closing = self.drain_gate.write().await;
        {
            let mut state = self.state.lock().await;
            if *state == EngineState::Closed {
                debug!("Load balancer already closed");
                return Ok(());
            }
            *state = EngineState::Closed;
        }

        let routes = self.table.take_all().await;
        info!(route_count = routes.len(), "Closing load balancer");

        let results = join_all(routes.iter().map(|route| route.close())).await;
        let errors: Vec<LbError> = results
            .into_iter()
            .filter_map(Result::err)
            .filter(|e| !e.is_benign_close())
            .collect();

        if errors.is_empty() {
            info!("Load balancer closed");
            Ok(())
        } else {
            warn!(failed_routes = errors.len(), "Load balancer closed with errors");
            Err(LbError::Close(errors))
        }
    }
}

#[async_trait]
impl LoadBalancer for TcpLoadBalancer {
    async fn add_route(
        &self,
        listen: &str,
        upstreams: &[String],
        options: RouteOptions,
    ) -> Result<(), LbError> {
        self.add_route_inner(listen, upstreams, options)
            .with_subscriber(self.dispatch.clone())
            .await
    }

    async fn remove_route(&self, listen: &str) -> Result<(), LbError> {
        self.remove_route_inner(listen)
            .with_subscriber(self.dispatch.clone())
            .await
    }

    async fn start(&self) -> Result<(), LbError> {
        self.start_inner()
            .with_subscriber(self.dispatch.clone())
            .await
    }

    async fn close(&self) -> Result<(), LbError> {
        self.close_inner()
            .with_subscriber(self.dispatch.clone())
            .await
    }
}

impl std::fmt::Debug for TcpLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLoadBalancer").finish_non_exhaustive()
    }
}

/// Parse a listen address into the route table key.
fn parse_listen(listen: &str) -> Result<SocketAddr, LbError> {
    listen
        .trim()
        .parse()
        .map_err(|_| LbError::invalid_route(listen, "malformed listen address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstreams(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_construction_requires_runtime() {
        let err = TcpLoadBalancer::new(None).unwrap_err();
        assert!(matches!(err, LbError::Construction(_)));
    }

    #[test]
    fn test_parse_listen() {
        assert_eq!(
            parse_listen("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen("[::1]:9000").is_ok());
        assert!(parse_listen("localhost").is_err());
        assert!(parse_listen("127.0.0.1:99999").is_err());
    }

    #[tokio::test]
    async fn test_provider_builds_balancer() {
        let lb = TcpLoadBalancerProvider.new_balancer(None).unwrap();
        lb.add_route("127.0.0.1:0", &upstreams(&["10.0.0.1:80"]), RouteOptions::default())
            .await
            .unwrap();
        lb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_route_validation() {
        let lb = TcpLoadBalancer::new(Some(Dispatch::none())).unwrap();
        let options = RouteOptions::default();

        let empty = lb.add_route("127.0.0.1:9000", &[], options).await;
        assert!(matches!(empty, Err(LbError::InvalidRoute { .. })));

        let malformed = lb
            .add_route("not-an-addr", &upstreams(&["10.0.0.1:80"]), options)
            .await;
        assert!(matches!(malformed, Err(LbError::InvalidRoute { .. })));

        let bad_upstream = lb
            .add_route("127.0.0.1:9000", &upstreams(&["10.0.0.1"]), options)
            .await;
        assert!(matches!(bad_upstream, Err(LbError::InvalidRoute { .. })));

        assert!(lb.listen_addrs().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_add_route_updates_pool() {
        let lb = TcpLoadBalancer::new(Some(Dispatch::none())).unwrap();
        let options = RouteOptions::default();

        lb.add_route("127.0.0.1:9000", &upstreams(&["10.0.0.1:80"]), options)
            .await
            .unwrap();
        let route = lb.route("127.0.0.1:9000").await.unwrap();

        lb.add_route(
            "127.0.0.1:9000",
            &upstreams(&["10.0.0.2:80", "10.0.0.3:80"]),
            options,
        )
        .await
        .unwrap();

        let same = lb.route("127.0.0.1:9000").await.unwrap();
        assert!(Arc::ptr_eq(&route, &same));

        let addrs: Vec<String> = lb
            .upstream_status("127.0.0.1:9000")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.address)
            .collect();
        assert_eq!(addrs, ["10.0.0.2:80", "10.0.0.3:80"]);
        assert_eq!(lb.listen_addrs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let lb = TcpLoadBalancer::new(Some(Dispatch::none())).unwrap();
        lb.start().await.unwrap();
        assert_eq!(lb.state().await, EngineState::Running);
        assert!(matches!(lb.start().await, Err(LbError::InvalidState(_))));

        lb.close().await.unwrap();
        lb.close().await.unwrap();
        assert_eq!(lb.state().await, EngineState::Closed);

        let removed = lb.remove_route("127.0.0.1:0").await;
        assert!(matches!(removed, Err(LbError::Closed)));

        assert!(matches!(lb.start().await, Err(LbError::Closed)));
        let late = lb
            .add_route("127.0.0.1:0", &upstreams(&["10.0.0.1:80"]), RouteOptions::default())
            .await;
        assert!(matches!(late, Err(LbError::Closed)));
    }

    #[tokio::test]
    async fn test_remove_unknown_route() {
        let lb = TcpLoadBalancer::new(Some(Dispatch::none())).unwrap();
        let err = lb.remove_route("127.0.0.1:9000").await.unwrap_err();
        assert!(matches!(err, LbError::InvalidRoute { .. }));
    }
}
