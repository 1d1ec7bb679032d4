//! tcplb
//!
//! TCP load balancer.
//!
//! This binary:
//! - Loads route definitions from the environment
//! - Registers every route with the engine and starts it
//! - Drains all routes on Ctrl-C

use anyhow::{Context, Result};
use tcplb::{LoadBalancer, LoadBalancerProvider, TcpLoadBalancerProvider};
use tracing::{error, info, Dispatch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TCPLB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tcplb");
    info!(
        route_count = config.routes.len(),
        routes_file = ?config.routes_file,
        "Configuration loaded"
    );

    let lb = TcpLoadBalancerProvider
        .new_balancer(Some(tracing::dispatcher::get_default(Dispatch::clone)))
        .context("Failed to construct load balancer")?;

    for route in &config.routes {
        lb.add_route(&route.listen, &route.upstreams, route.options)
            .await
            .with_context(|| format!("Failed to add route {}", route.listen))?;
    }

    if let Err(e) = lb.start().await {
        error!(error = %e, "Failed to start load balancer");
        if let Err(close_err) = lb.close().await {
            error!(error = %close_err, "Failed to close load balancer");
        }
        return Err(e.into());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, draining connections");

    lb.close().await.context("Failed to close load balancer")?;

    info!("tcplb shutdown complete");
    Ok(())
}
