//! tcplb configuration (env-driven).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tcplb::RouteOptions;

/// One listen address and its upstreams.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteSpec {
    pub listen: String,
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub options: RouteOptions,
}

/// tcplb configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Routes to balance, in registration order.
    pub routes: Vec<RouteSpec>,

    /// Optional JSON file the file-based routes were read from.
    pub routes_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut defaults = RouteOptions::default();

        if let Some(ms) = parse_u64(&lookup, "TCPLB_HEALTH_INTERVAL_MS")? {
            defaults.health.interval = Duration::from_millis(ms.max(10));
        }
        if let Some(ms) = parse_u64(&lookup, "TCPLB_HEALTH_TIMEOUT_MS")? {
            defaults.health.timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(threshold) = parse_u64(&lookup, "TCPLB_FAILURE_THRESHOLD")? {
            defaults.health.failure_threshold = u32::try_from(threshold)
                .context("TCPLB_FAILURE_THRESHOLD is too large.")?
                .max(1);
        }
        if let Some(ms) = parse_u64(&lookup, "TCPLB_CONNECT_TIMEOUT_MS")? {
            defaults.connect_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = parse_u64(&lookup, "TCPLB_DRAIN_TIMEOUT_MS")? {
            defaults.drain_timeout = Some(Duration::from_millis(ms));
        }

        let mut routes = match lookup("TCPLB_ROUTES") {
            Some(value) => parse_routes(&value, defaults)?,
            None => Vec::new(),
        };

        let routes_file = lookup("TCPLB_ROUTES_FILE").map(PathBuf::from);
        if let Some(path) = &routes_file {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read routes file {}", path.display()))?;
            let file_routes: Vec<RouteSpec> = serde_json::from_str(&contents)
                .with_context(|| format!("Invalid routes file {}", path.display()))?;
            routes.extend(file_routes);
        }

        if routes.is_empty() {
            bail!("No routes configured. Set TCPLB_ROUTES or TCPLB_ROUTES_FILE.");
        }

        let log_level = lookup("TCPLB_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            routes,
            routes_file,
            log_level,
        })
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|v| v.trim().parse::<u64>())
        .transpose()
        .with_context(|| format!("{key} must be an integer."))
}

/// Parse `listen=up1,up2;listen2=up3`.
fn parse_routes(value: &str, options: RouteOptions) -> Result<Vec<RouteSpec>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (listen, upstreams) = entry
                .split_once('=')
                .with_context(|| format!("Route '{entry}' must look like listen=upstream[,upstream]"))?;

            let upstreams: Vec<String> = upstreams
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();

            Ok(RouteSpec {
                listen: listen.trim().to_string(),
                upstreams,
                options,
            })
        })
        .collect()
}
