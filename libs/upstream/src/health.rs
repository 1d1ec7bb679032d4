//! Periodic health checking for upstream pools.
//!
//! One checker runs per pool on its own task. Every round probes all
//! members concurrently, each probe in its own task so a panic in one
//! probe is contained and recorded as a failure for that member only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, Instrument};

use crate::error::ProbeError;
use crate::pool::UpstreamPool;

/// Default interval between probing rounds.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(20);

/// Default per-probe timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of consecutive failures before an endpoint is condemned.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Health check settings for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Time between probing rounds.
    #[serde(rename = "interval_ms", with = "crate::millis")]
    pub interval: Duration,
    /// Bound on a single probe.
    #[serde(rename = "timeout_ms", with = "crate::millis")]
    pub timeout: Duration,
    /// Consecutive failures before an endpoint is marked unhealthy.
    pub failure_threshold: u32,
    /// Upper bound of the random delay added to each interval.
    #[serde(rename = "jitter_ms", with = "crate::millis")]
    pub jitter: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            jitter: Duration::ZERO,
        }
    }
}

/// A connectivity check against one upstream address.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, address: &str) -> Result<(), ProbeError>;
}

/// Probe that opens and immediately drops a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, address: &str) -> Result<(), ProbeError> {
        let stream = TcpStream::connect(address).await?;
        drop(stream);
        Ok(())
    }
}

/// Health checker for a single pool.
pub struct HealthChecker {
    pool: Arc<UpstreamPool>,
    config: HealthCheckConfig,
    probe: Arc<dyn Probe>,
}

impl HealthChecker {
    pub fn new(pool: Arc<UpstreamPool>, config: HealthCheckConfig, probe: Arc<dyn Probe>) -> Self {
        Self {
            pool,
            config,
            probe,
        }
    }

    /// Probe every current member once and apply the results.
    pub async fn run_once(&self) {
        let members = self.pool.members();

        let rounds = members.iter().map(|endpoint| {
            let endpoint = Arc::clone(endpoint);
            let probe = Arc::clone(&self.probe);
            let probe_timeout = self.config.timeout;
            let address = endpoint.address().to_string();

            let handle = tokio::spawn(
                async move {
                    match timeout(probe_timeout, probe.probe(&address)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProbeError::Timeout),
                    }
                }
                .in_current_span()
                .with_current_subscriber(),
            );

            async move { (endpoint, handle.await) }
        });

        for (endpoint, joined) in join_all(rounds).await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        pool = %self.pool.name(),
                        upstream = %endpoint.address(),
                        error = %e,
                        "Health probe task failed"
                    );
                    Err(ProbeError::Panicked)
                }
            };

            if let Err(e) = &result {
                debug!(
                    pool = %self.pool.name(),
                    upstream = %endpoint.address(),
                    error = %e,
                    "Health probe failed"
                );
            }

            self.pool
                .record_probe(&endpoint, result.is_ok(), self.config.failure_threshold);
        }
    }

    /// Probe on a fixed interval until `shutdown` flips to true or its
    /// sender is dropped. The first round runs immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            pool = %self.pool.name(),
            interval_ms = self.config.interval.as_millis() as u64,
            failure_threshold = self.config.failure_threshold,
            "Health checker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = self.run_once() => {}
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(pool = %self.pool.name(), "Health checker stopped");
    }

    /// Run the checker on its own task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(
            self.run(shutdown)
                .in_current_span()
                .with_current_subscriber(),
        )
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.interval;
        }

        let extra = rand::rng().random_range(0..=jitter_ms);
        self.config.interval + Duration::from_millis(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// Probe whose outcome per address is controlled by the test.
    #[derive(Default)]
    struct ScriptedProbe {
        down: Mutex<HashSet<String>>,
        panics: Mutex<HashSet<String>>,
        slow: Mutex<HashSet<String>>,
    }

    impl ScriptedProbe {
        fn set_down(&self, address: &str, down: bool) {
            let mut set = self.down.lock().unwrap();
            if down {
                set.insert(address.to_string());
            } else {
                set.remove(address);
            }
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, address: &str) -> Result<(), ProbeError> {
            if self.panics.lock().unwrap().contains(address) {
                panic!("probe exploded for {address}");
            }
            let slow = self.slow.lock().unwrap().contains(address);
            if slow {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.down.lock().unwrap().contains(address) {
                return Err(ProbeError::Connect(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                )));
            }
            Ok(())
        }
    }

    fn config(failure_threshold: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
            failure_threshold,
            jitter: Duration::ZERO,
        }
    }

    fn checker(threshold: u32) -> (Arc<UpstreamPool>, Arc<ScriptedProbe>, HealthChecker) {
        let pool = Arc::new(UpstreamPool::new("test", ["10.0.0.1:80", "10.0.0.2:80"]).unwrap());
        let probe = Arc::new(ScriptedProbe::default());
        let checker = HealthChecker::new(Arc::clone(&pool), config(threshold), probe.clone());
        (pool, probe, checker)
    }

    #[test]
    fn test_config_defaults() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval, DEFAULT_INTERVAL);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(config.jitter, Duration::ZERO);
    }

    #[test]
    fn test_config_deserializes_millis() {
        let config: HealthCheckConfig =
            serde_json::from_str(r#"{"interval_ms": 500, "failure_threshold": 2}"#).unwrap();
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let pool = Arc::new(UpstreamPool::new("test", ["10.0.0.1:80"]).unwrap());
        let mut config = config(1);
        config.jitter = Duration::from_millis(10);
        let checker = HealthChecker::new(pool, config, Arc::new(TcpProbe));

        for _ in 0..50 {
            let delay = checker.next_delay();
            assert!(delay >= config.interval);
            assert!(delay <= config.interval + config.jitter);
        }
    }

    #[tokio::test]
    async fn test_threshold_condemns_then_single_success_recovers() {
        let (pool, probe, checker) = checker(3);
        probe.set_down("10.0.0.1:80", true);

        checker.run_once().await;
        checker.run_once().await;
        assert!(pool.get("10.0.0.1:80").unwrap().is_healthy());

        checker.run_once().await;
        let endpoint = pool.get("10.0.0.1:80").unwrap();
        assert!(!endpoint.is_healthy());
        assert_eq!(endpoint.consecutive_failures(), 3);
        assert!(pool.get("10.0.0.2:80").unwrap().is_healthy());

        probe.set_down("10.0.0.1:80", false);
        checker.run_once().await;
        assert!(endpoint.is_healthy());
        assert_eq!(endpoint.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_panicking_probe_is_contained() {
        let (pool, probe, checker) = checker(1);
        probe.panics.lock().unwrap().insert("10.0.0.1:80".to_string());
        probe.set_down("10.0.0.2:80", true);

        checker.run_once().await;

        // Both results applied despite the panic
        assert!(!pool.get("10.0.0.1:80").unwrap().is_healthy());
        assert!(!pool.get("10.0.0.2:80").unwrap().is_healthy());

        probe.panics.lock().unwrap().clear();
        probe.set_down("10.0.0.2:80", false);
        checker.run_once().await;
        assert_eq!(pool.healthy_count(), 2);
    }

    #[tokio::test]
    async fn test_slow_probe_times_out() {
        let (pool, probe, checker) = checker(1);
        probe.slow.lock().unwrap().insert("10.0.0.2:80".to_string());

        let started = std::time::Instant::now();
        checker.run_once().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(pool.get("10.0.0.1:80").unwrap().is_healthy());
        assert!(!pool.get("10.0.0.2:80").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_spawned_checker_detects_dead_upstream_and_stops() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap().to_string();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let pool = Arc::new(UpstreamPool::new("test", [live_addr.clone(), dead_addr.clone()]).unwrap());
        let mut events = pool.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = HealthChecker::new(Arc::clone(&pool), config(2), Arc::new(TcpProbe))
            .spawn(shutdown_rx);

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("health event")
            .unwrap();
        assert_eq!(event.address, dead_addr);
        assert!(!event.healthy);
        assert!(pool.get(&live_addr).unwrap().is_healthy());

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("checker stops")
            .unwrap();
    }
}
