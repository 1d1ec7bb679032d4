//! tcplb: a TCP load balancer.
//!
//! Accepts connections on configured listen addresses and relays each one
//! to a healthy member of that route's upstream pool.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Route (accept loop) -> Dispatch (round-robin) -> Upstream
//!                 |                        ^
//!             Route Table            Health Checker
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tcplb::{LoadBalancer, LoadBalancerProvider, RouteOptions, TcpLoadBalancerProvider};
//!
//! let lb = TcpLoadBalancerProvider.new_balancer(None)?;
//! lb.add_route("127.0.0.1:9000", &upstreams, RouteOptions::default()).await?;
//! lb.start().await?;
//! // ...
//! lb.close().await?;
//! ```

mod engine;
mod error;
mod options;
mod relay;
mod route;
mod table;

pub use engine::{
    EngineState, LoadBalancer, LoadBalancerProvider, TcpLoadBalancer, TcpLoadBalancerProvider,
};
pub use error::LbError;
pub use options::{RouteOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
pub use route::{Route, RouteState, RouteStats, RouteStatsSnapshot};
pub use table::RouteTable;

pub use tcplb_upstream::{
    EndpointSnapshot, HealthCheckConfig, HealthEvent, Probe, ProbeError, TcpProbe, UpstreamError,
};
