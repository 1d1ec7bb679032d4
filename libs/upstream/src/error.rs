//! Error types for upstream pools and health probes.

use std::io;

use thiserror::Error;

/// Errors raised by pool construction, membership updates and dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// A pool must always have at least one member.
    #[error("upstream pool '{pool}' cannot be empty")]
    EmptyPool { pool: String },

    /// The upstream address is not a valid `host:port` pair.
    #[error("invalid upstream address: {0}")]
    InvalidAddress(String),

    /// Every member of the pool is currently unhealthy.
    #[error("no healthy upstream in pool '{pool}'")]
    NoHealthyUpstream { pool: String },
}

impl UpstreamError {
    /// Returns true if this error is a transient dispatch failure.
    pub fn is_no_healthy_upstream(&self) -> bool {
        matches!(self, UpstreamError::NoHealthyUpstream { .. })
    }
}

/// Errors reported by a single health probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe did not complete within the configured timeout.
    #[error("probe timed out")]
    Timeout,

    /// The connectivity check failed.
    #[error("connect failed: {0}")]
    Connect(#[from] io::Error),

    /// The probe task panicked.
    #[error("probe panicked")]
    Panicked,
}
