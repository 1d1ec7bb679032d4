//! Upstream endpoints and their health state.
//!
//! An endpoint flips to unhealthy only after `failure_threshold`
//! consecutive probe failures and back to healthy after a single
//! successful probe.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::error::UpstreamError;

/// Health change caused by a probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// The endpoint crossed the failure threshold.
    Condemned,
    /// The endpoint passed a probe after being unhealthy.
    Recovered,
}

/// A backend address connections may be forwarded to.
#[derive(Debug)]
pub struct Endpoint {
    address: String,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_check: Mutex<Option<Instant>>,
}

impl Endpoint {
    /// Create a healthy endpoint after validating its address.
    pub fn new(address: impl Into<String>) -> Result<Self, UpstreamError> {
        let address = address.into();
        validate_address(&address)?;

        Ok(Self {
            address,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_check: Mutex::new(None),
        })
    }

    /// The `host:port` address of this endpoint.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// When the endpoint was last probed, if ever.
    pub fn last_check(&self) -> Option<Instant> {
        *self
            .last_check
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a successful probe.
    pub fn record_success(&self) -> Option<HealthTransition> {
        self.touch();
        self.consecutive_failures.store(0, Ordering::Release);

        if self.healthy.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(HealthTransition::Recovered)
        }
    }

    /// Apply a failed probe.
    ///
    /// A threshold of zero is treated as one.
    pub fn record_failure(&self, failure_threshold: u32) -> Option<HealthTransition> {
        self.touch();
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);

        if failures >= failure_threshold.max(1) && self.healthy.swap(false, Ordering::AcqRel) {
            Some(HealthTransition::Condemned)
        } else {
            None
        }
    }

    /// Point-in-time copy of this endpoint's state.
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            address: self.address.clone(),
            healthy: self.is_healthy(),
            consecutive_failures: self.consecutive_failures(),
            last_check: self.last_check(),
        }
    }

    fn touch(&self) {
        let mut last_check = self
            .last_check
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last_check = Some(Instant::now());
    }
}

/// Monitoring view of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSnapshot {
    pub address: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub last_check: Option<Instant>,
}

/// Check that `address` is a `host:port` pair with a non-zero port.
///
/// Hostnames are accepted and resolved at connect time. IPv6 literals
/// must be bracketed.
pub(crate) fn validate_address(address: &str) -> Result<(), UpstreamError> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(UpstreamError::InvalidAddress(address.to_string()));
        }
        return Ok(());
    }

    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(UpstreamError::InvalidAddress(address.to_string()));
    };

    let bare_ipv6 = host.contains(':') && !(host.starts_with('[') && host.ends_with(']'));
    let valid_port = port.parse::<u16>().map(|p| p != 0).unwrap_or(false);

    if host.is_empty() || bare_ipv6 || host.contains(char::is_whitespace) || !valid_port {
        return Err(UpstreamError::InvalidAddress(address.to_string()));
    }

    Ok(())
}
