//! Upstream pools for the tcplb engine.
//!
//! This library provides:
//! - Upstream endpoints with threshold-based health state
//! - Pools with round-robin dispatch over healthy members
//! - A periodic health checker with pluggable probes
//!
//! ## Usage
//!
//! ```ignore
//! use tcplb_upstream::{HealthCheckConfig, HealthChecker, TcpProbe, UpstreamPool};
//!
//! let pool = Arc::new(UpstreamPool::new("127.0.0.1:9000", ["10.0.0.1:80", "10.0.0.2:80"])?);
//! let config = HealthCheckConfig::default();
//! let checker = HealthChecker::new(Arc::clone(&pool), config, Arc::new(TcpProbe));
//! let handle = checker.spawn(shutdown_rx);
//!
//! let endpoint = pool.select()?;
//! ```

mod endpoint;
mod error;
mod health;
pub mod millis;
mod pool;

pub use endpoint::{Endpoint, EndpointSnapshot, HealthTransition};
pub use error::{ProbeError, UpstreamError};
pub use health::{
    HealthCheckConfig, HealthChecker, Probe, TcpProbe, DEFAULT_FAILURE_THRESHOLD, DEFAULT_INTERVAL,
    DEFAULT_TIMEOUT,
};
pub use pool::{HealthEvent, PoolUpdate, UpstreamPool};
