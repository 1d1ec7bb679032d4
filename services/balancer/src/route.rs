//! Routes: one listen address bound to one upstream pool.
//!
//! A route owns its accept loop, the forwarding task of every accepted
//! connection and the health checker of its pool.
//!
//! Lifecycle: `Created -> Started -> Draining -> Closed`. The listener is
//! bound by `start`, so bind failures surface there. `close` stops
//! accepting before it starts waiting, then waits for every relay to
//! finish on its own.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tcplb_upstream::{
    EndpointSnapshot, HealthChecker, HealthEvent, PoolUpdate, Probe, UpstreamPool,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch, Instrument};

use crate::error::LbError;
use crate::options::RouteOptions;
use crate::relay::{relay, RelayOutcome};

/// Lifecycle state of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteState {
    /// Registered, not accepting.
    Created,
    /// Accept loop running.
    Started,
    /// No longer accepting; waiting for relays to finish.
    Draining,
    /// Fully stopped.
    Closed,
}

/// Counters for a route.
#[derive(Debug, Default)]
pub struct RouteStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being forwarded.
    pub connections_active: AtomicU64,
    /// Connections closed on accept because the route was at capacity.
    pub connections_rejected: AtomicU64,
    /// Connections closed because no upstream was healthy.
    pub no_healthy_upstream: AtomicU64,
    /// Connections closed because the upstream connect failed.
    pub upstream_connect_failed: AtomicU64,
    /// Bytes relayed to upstreams.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed from upstreams.
    pub bytes_from_upstream: AtomicU64,
}

impl RouteStats {
    pub fn snapshot(&self) -> RouteStatsSnapshot {
        RouteStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            no_healthy_upstream: self.no_healthy_upstream.load(Ordering::Relaxed),
            upstream_connect_failed: self.upstream_connect_failed.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RouteStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouteStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub no_healthy_upstream: u64,
    pub upstream_connect_failed: u64,
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
}

/// State shared between the route handle, its accept loop and its
/// connection tasks.
struct RouteShared {
    listen: SocketAddr,
    pool: Arc<UpstreamPool>,
    options: RouteOptions,
    stats: RouteStats,
    /// One permit per in-flight connection.
    conn_semaphore: Arc<Semaphore>,
}

/// Runtime handles owned while the route is started.
#[derive(Default)]
struct Lifecycle {
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

/// A listen address bound to an upstream pool.
pub struct Route {
    shared: Arc<RouteShared>,
    probe: Arc<dyn Probe>,
    dispatch: Dispatch,
    state: watch::Sender<RouteState>,
    local_addr: OnceLock<SocketAddr>,
    /// Serializes start and close.
    lifecycle: Mutex<Lifecycle>,
}

impl Route {
    /// Create a route in the `Created` state.
    pub fn new(
        listen: SocketAddr,
        upstreams: &[String],
        options: RouteOptions,
        probe: Arc<dyn Probe>,
        dispatch: Dispatch,
    ) -> Result<Self, LbError> {
        let name = listen.to_string();
        options
            .validate()
            .map_err(|reason| LbError::invalid_route(&name, reason))?;

        let pool = UpstreamPool::new(name.clone(), upstreams.iter().cloned())
            .map_err(|e| LbError::invalid_route(&name, e.to_string()))?;

        let (state, _) = watch::channel(RouteState::Created);

        Ok(Self {
            shared: Arc::new(RouteShared {
                listen,
                pool: Arc::new(pool),
                conn_semaphore: Arc::new(Semaphore::new(options.max_connections)),
                options,
                stats: RouteStats::default(),
            }),
            probe,
            dispatch,
            state,
            local_addr: OnceLock::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// The configured listen address.
    pub fn listen(&self) -> SocketAddr {
        self.shared.listen
    }

    /// The bound address, once started. Differs from `listen` for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn state(&self) -> RouteState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<RouteState> {
        self.state.subscribe()
    }

    pub fn options(&self) -> &RouteOptions {
        &self.shared.options
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.shared.pool
    }

    pub fn stats(&self) -> RouteStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn upstream_status(&self) -> Vec<EndpointSnapshot> {
        self.shared.pool.snapshot()
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.shared.pool.subscribe()
    }

    /// Replace the pool membership without touching the listener.
    ///
    /// Relays to removed upstreams keep running until they end.
    pub fn update_upstreams(&self, upstreams: &[String]) -> Result<PoolUpdate, LbError> {
        self.shared
            .pool
            .update(upstreams.iter().cloned())
            .map_err(|e| LbError::invalid_route(&self.shared.listen.to_string(), e.to_string()))
    }

    /// Bind the listener and start accepting and health checking.
    pub async fn start(&self) -> Result<(), LbError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let listen = self.shared.listen;

        if self.state() != RouteState::Created {
            return Err(LbError::InvalidState(format!(
                "route '{}' cannot start from {:?}",
                listen,
                self.state()
            )));
        }

        let bind_error = |source: io::Error| LbError::Bind {
            listen: listen.to_string(),
            source,
        };
        let listener = TcpListener::bind(listen).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        let _ = self.local_addr.set(local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = tracing::info_span!("route", listen = %listen);

        let checker = HealthChecker::new(
            Arc::clone(&self.shared.pool),
            self.shared.options.health,
            Arc::clone(&self.probe),
        );
        let health_task = tracing::dispatcher::with_default(&self.dispatch, || {
            span.in_scope(|| checker.spawn(shutdown_rx.clone()))
        });

        let accept_task = tokio::spawn(
            accept_loop(Arc::clone(&self.shared), listener, shutdown_rx)
                .instrument(span)
                .with_subscriber(self.dispatch.clone()),
        );

        lifecycle.shutdown_tx = Some(shutdown_tx);
        lifecycle.accept_task = Some(accept_task);
        lifecycle.health_task = Some(health_task);
        self.state.send_replace(RouteState::Started);

        info!(
            listen = %listen,
            bind_addr = %local_addr,
            upstream_count = self.shared.pool.len(),
            "Route started"
        );

        Ok(())
    }

    /// Stop accepting, then wait for in-flight relays to finish.
    ///
    /// The route reports `Draining` once its listener is gone.
    ///
    /// Closing a closed route is a no-op. Concurrent calls serialize and
    /// all return once the route is closed.
    pub async fn close(&self) -> Result<(), LbError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let listen = self.shared.listen;

        match self.state() {
            RouteState::Closed => return Ok(()),
            RouteState::Created => {
                self.state.send_replace(RouteState::Closed);
                debug!(listen = %listen, "Closed route that was never started");
                return Ok(());
            }
            RouteState::Started | RouteState::Draining => {}
        }

        if let Some(shutdown_tx) = lifecycle.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        let mut failure = None;

        // The listener is dropped when the accept loop returns
        if let Some(task) = lifecycle.accept_task.take() {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    debug!(listen = %listen, "Accept loop already cancelled");
                }
                Err(e) => {
                    error!(listen = %listen, error = %e, "Accept loop panicked");
                    failure = Some(LbError::AcceptLoopPanicked {
                        listen: listen.to_string(),
                    });
                }
            }
        }

        self.state.send_replace(RouteState::Draining);

        if let Some(task) = lifecycle.health_task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(listen = %listen, error = %e, "Health checker panicked");
                }
            }
        }

        let active = self.shared.stats.connections_active.load(Ordering::Relaxed);
        info!(listen = %listen, active_connections = active, "Route draining");

        if let Err(e) = self.drain().await {
            failure.get_or_insert(e);
        }

        self.state.send_replace(RouteState::Closed);
        info!(listen = %listen, "Route closed");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait until every connection permit is returned.
    async fn drain(&self) -> Result<(), LbError> {
        let semaphore = &self.shared.conn_semaphore;
        let all = self.shared.options.max_connections as u32;

        let acquire = async {
            // Only fails if the semaphore is closed, which means drained
            if let Ok(permits) = semaphore.acquire_many(all).await {
                semaphore.close();
                drop(permits);
            }
        };

        match self.shared.options.drain_timeout {
            None => {
                acquire.await;
                Ok(())
            }
            Some(limit) => match timeout(limit, acquire).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    let remaining =
                        self.shared.stats.connections_active.load(Ordering::Relaxed) as usize;
                    warn!(
                        listen = %self.shared.listen,
                        remaining,
                        "Drain timeout elapsed, leaving relays running"
                    );
                    Err(LbError::DrainTimeout {
                        listen: self.shared.listen.to_string(),
                        remaining,
                    })
                }
            },
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("listen", &self.shared.listen)
            .field("local_addr", &self.local_addr())
            .field("state", &self.state())
            .field("pool", &self.shared.pool)
            .finish()
    }
}

/// Accept connections until shutdown, spawning one task per connection.
async fn accept_loop(
    shared: Arc<RouteShared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match Arc::clone(&shared.conn_semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            shared.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    shared.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    let conn_shared = Arc::clone(&shared);
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_connection(&conn_shared, stream).await {
                                warn!(error = %e, "Connection dispatch failed");
                            }

                            conn_shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr))
                        .with_current_subscriber(),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            },
        }
    }

    drop(listener);
    debug!(listen = %shared.listen, "Stopped accepting");
}

/// Dispatch one connection and relay it to completion.
///
/// Single attempt: a failed connect is not retried on another member.
async fn handle_connection(shared: &RouteShared, mut client: TcpStream) -> Result<(), LbError> {
    let endpoint = match shared.pool.select() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            shared.stats.no_healthy_upstream.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
    };
    let upstream_addr = endpoint.address();

    let connect_result = timeout(
        shared.options.connect_timeout,
        TcpStream::connect(upstream_addr),
    )
    .await
    .unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timeout",
        ))
    });

    let mut upstream = match connect_result {
        Ok(stream) => stream,
        Err(source) => {
            shared
                .stats
                .upstream_connect_failed
                .fetch_add(1, Ordering::Relaxed);
            return Err(LbError::Dispatch {
                upstream: upstream_addr.to_string(),
                source,
            });
        }
    };

    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);
    debug!(upstream = %upstream_addr, "Connected to upstream");

    let RelayOutcome {
        to_upstream,
        from_upstream,
    } = relay(&mut client, &mut upstream, shared.options.idle_timeout).await;

    shared
        .stats
        .bytes_to_upstream
        .fetch_add(to_upstream, Ordering::Relaxed);
    shared
        .stats
        .bytes_from_upstream
        .fetch_add(from_upstream, Ordering::Relaxed);

    debug!(
        upstream = %upstream_addr,
        bytes_to_upstream = to_upstream,
        bytes_from_upstream = from_upstream,
        "Connection closed"
    );

    Ok(())
}
