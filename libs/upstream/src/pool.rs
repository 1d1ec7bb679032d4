//! Upstream pool membership and round-robin dispatch.
//!
//! Membership lives in an atomically swapped snapshot and health is kept
//! in per-endpoint atomics, so `select` never waits on the health checker
//! or on a concurrent membership update.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointSnapshot, HealthTransition};
use crate::error::UpstreamError;

/// Capacity of the health event channel per pool.
const HEALTH_EVENT_CAPACITY: usize = 64;

/// Health transition published for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthEvent {
    /// Pool the endpoint belongs to.
    pub pool: String,
    /// Endpoint address.
    pub address: String,
    /// Health after the transition.
    pub healthy: bool,
    /// Failure streak at the time of the transition.
    pub consecutive_failures: u32,
}

/// Result of a membership update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolUpdate {
    /// Addresses that joined the pool.
    pub added: Vec<String>,
    /// Addresses that left the pool.
    pub removed: Vec<String>,
}

impl PoolUpdate {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The set of candidate backends for one route.
pub struct UpstreamPool {
    /// Pool name, usually the route's listen address.
    name: String,
    /// Ordered members; order is the round-robin basis.
    members: ArcSwap<Vec<Arc<Endpoint>>>,
    /// Round-robin cursor. Never reset by updates.
    cursor: AtomicUsize,
    /// Serializes membership writers.
    update_lock: Mutex<()>,
    /// Health transitions.
    events: broadcast::Sender<HealthEvent>,
}

impl UpstreamPool {
    /// Create a pool from an ordered list of `host:port` addresses.
    ///
    /// Duplicate addresses are collapsed, keeping the first occurrence.
    pub fn new<I, S>(name: impl Into<String>, addrs: I) -> Result<Self, UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let (members, _) = build_members(&name, addrs, &[])?;
        let (events, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);

        debug!(pool = %name, member_count = members.len(), "Created upstream pool");

        Ok(Self {
            name,
            members: ArcSwap::from_pointee(members),
            cursor: AtomicUsize::new(0),
            update_lock: Mutex::new(()),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pick the next healthy endpoint in round-robin order.
    ///
    /// Each unhealthy member that is skipped consumes one cursor step, so
    /// healthy members keep an even share while others are down.
    pub fn select(&self) -> Result<Arc<Endpoint>, UpstreamError> {
        let members = self.members.load();
        let count = members.len();

        for _ in 0..count {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
            let endpoint = &members[idx];
            if endpoint.is_healthy() {
                return Ok(Arc::clone(endpoint));
            }
        }

        Err(UpstreamError::NoHealthyUpstream {
            pool: self.name.clone(),
        })
    }

    /// Replace pool membership.
    ///
    /// Retained addresses keep their health state, new ones start healthy
    /// pending their first probe. An empty list is rejected and leaves the
    /// pool unchanged.
    pub fn update<I, S>(&self, addrs: I) -> Result<PoolUpdate, UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = self
            .update_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = self.members.load_full();
        let (members, update) = build_members(&self.name, addrs, &current)?;
        self.members.store(Arc::new(members));

        if update.is_noop() {
            debug!(pool = %self.name, "Upstream pool unchanged");
        } else {
            info!(
                pool = %self.name,
                added = ?update.added,
                removed = ?update.removed,
                "Updated upstream pool"
            );
        }

        Ok(update)
    }

    /// Current members in pool order.
    pub fn members(&self) -> Arc<Vec<Arc<Endpoint>>> {
        self.members.load_full()
    }

    /// Look up a current member by address.
    pub fn get(&self, address: &str) -> Option<Arc<Endpoint>> {
        self.members
            .load()
            .iter()
            .find(|e| e.address() == address)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    /// Always false once constructed; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.members.load().iter().filter(|e| e.is_healthy()).count()
    }

    /// Monitoring copy of every member.
    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        self.members.load().iter().map(|e| e.snapshot()).collect()
    }

    /// Subscribe to health transitions of this pool.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Apply a probe outcome to `endpoint` and publish any transition.
    pub fn record_probe(
        &self,
        endpoint: &Endpoint,
        success: bool,
        failure_threshold: u32,
    ) -> Option<HealthTransition> {
        let transition = if success {
            endpoint.record_success()
        } else {
            endpoint.record_failure(failure_threshold)
        };

        match transition {
            Some(HealthTransition::Condemned) => warn!(
                pool = %self.name,
                upstream = %endpoint.address(),
                consecutive_failures = endpoint.consecutive_failures(),
                "Upstream marked unhealthy"
            ),
            Some(HealthTransition::Recovered) => info!(
                pool = %self.name,
                upstream = %endpoint.address(),
                "Upstream recovered"
            ),
            None => return None,
        }

        // No subscribers is fine
        let _ = self.events.send(HealthEvent {
            pool: self.name.clone(),
            address: endpoint.address().to_string(),
            healthy: endpoint.is_healthy(),
            consecutive_failures: endpoint.consecutive_failures(),
        });

        transition
    }
}

impl std::fmt::Debug for UpstreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamPool")
            .field("name", &self.name)
            .field("members", &self.snapshot())
            .finish()
    }
}

/// Build a member list, reusing endpoints from `existing` by address.
fn build_members<I, S>(
    pool: &str,
    addrs: I,
    existing: &[Arc<Endpoint>],
) -> Result<(Vec<Arc<Endpoint>>, PoolUpdate), UpstreamError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let previous: HashMap<&str, &Arc<Endpoint>> =
        existing.iter().map(|e| (e.address(), e)).collect();

    let mut seen = HashSet::new();
    let mut members = Vec::new();
    let mut update = PoolUpdate::default();

    for addr in addrs {
        let addr = addr.into();
        if !seen.insert(addr.clone()) {
            continue;
        }

        match previous.get(addr.as_str()) {
            Some(endpoint) => members.push(Arc::clone(endpoint)),
            None => {
                members.push(Arc::new(Endpoint::new(addr.clone())?));
                update.added.push(addr);
            }
        }
    }

    if members.is_empty() {
        return Err(UpstreamError::EmptyPool {
            pool: pool.to_string(),
        });
    }

    update.removed = existing
        .iter()
        .filter(|e| !seen.contains(e.address()))
        .map(|e| e.address().to_string())
        .collect();

    Ok((members, update))
}
