//! Failover Supervisor
//!
//! Tracks endpoint health, picks the active endpoint and probes failed
//! endpoints in the background so they can rejoin after a cool-down.

use crate::config::Config;
use crate::domain::entities::{Endpoint, EndpointHealth};
use crate::domain::ports::{RpcRequest, RpcTransport};
use crate::domain::value_objects::{Params, SessionId};
use crate::error::{Error, Result};
use crate::infrastructure::shutdown::ShutdownController;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Failover configuration.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Time an unhealthy endpoint is skipped before it may be tried again
    pub cooldown: Duration,
    /// Interval between background probes
    pub probe_interval: Duration,
    /// Timeout for each probe
    pub probe_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for FailoverConfig {
    fn from(config: &Config) -> Self {
        Self {
            cooldown: config.failover_cooldown,
            probe_interval: config.probe_interval,
            probe_timeout: config.connect_timeout.min(config.query_timeout),
        }
    }
}

type HealthCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Owns endpoint health for a data source.
///
/// Endpoints keep their configured priority order; the active endpoint is
/// the first one that is healthy, untested, or past its cool-down.
pub struct FailoverSupervisor {
    config: FailoverConfig,
    endpoints: RwLock<Vec<Endpoint>>,
    on_health_change: Option<HealthCallback>,
}

impl FailoverSupervisor {
    /// Create a supervisor for endpoints in priority order.
    pub fn new(endpoints: Vec<Endpoint>, config: FailoverConfig) -> Self {
        Self {
            config,
            endpoints: RwLock::new(endpoints),
            on_health_change: None,
        }
    }

    /// Set callback for health status changes.
    pub fn on_health_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.on_health_change = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Snapshot of all endpoints.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }

    /// Health of the endpoint at `address`.
    pub fn health(&self, address: &str) -> Option<EndpointHealth> {
        self.endpoints
            .read()
            .iter()
            .find(|e| e.address == address)
            .map(|e| e.health)
    }

    /// Endpoint that new calls should go to.
    pub fn active_endpoint(&self) -> Result<Endpoint> {
        self.active_endpoint_at(Instant::now())
    }

    pub fn active_endpoint_at(&self, now: Instant) -> Result<Endpoint> {
        self.endpoints
            .read()
            .iter()
            .find(|e| e.is_eligible(now, self.config.cooldown))
            .cloned()
            .ok_or(Error::NoHealthyEndpoint)
    }

    /// Whether `endpoint` may still receive calls.
    pub fn is_eligible(&self, endpoint: &Endpoint) -> bool {
        self.endpoints
            .read()
            .iter()
            .find(|e| e.address == endpoint.address)
            .map(|e| e.is_eligible(Instant::now(), self.config.cooldown))
            .unwrap_or(false)
    }

    /// Mark `endpoint` unhealthy and return the endpoint to use next.
    pub fn report_failure(&self, endpoint: &Endpoint, reason: &str) -> Result<Endpoint> {
        self.report_failure_at(endpoint, reason, Instant::now())
    }

    pub fn report_failure_at(
        &self,
        endpoint: &Endpoint,
        reason: &str,
        now: Instant,
    ) -> Result<Endpoint> {
        let changed = {
            let mut endpoints = self.endpoints.write();
            match endpoints.iter_mut().find(|e| e.address == endpoint.address) {
                Some(entry) => {
                    let was_unhealthy = entry.health == EndpointHealth::Unhealthy;
                    entry.health = EndpointHealth::Unhealthy;
                    entry.last_failure = Some(now);
                    !was_unhealthy
                }
                None => false,
            }
        };

        if changed {
            tracing::warn!("endpoint {} is now unhealthy: {}", endpoint.address, reason);
            self.notify(&endpoint.address, false);
        }

        let next = self.active_endpoint_at(now);
        match &next {
            Ok(next) if next.address != endpoint.address => {
                tracing::info!("failing over from {} to {}", endpoint.address, next.address);
            }
            Err(_) => tracing::error!("no healthy endpoint left after {} failed", endpoint.address),
            _ => {}
        }
        next
    }

    /// Mark `endpoint` healthy.
    pub fn report_success(&self, endpoint: &Endpoint) {
        let changed = {
            let mut endpoints = self.endpoints.write();
            match endpoints.iter_mut().find(|e| e.address == endpoint.address) {
                Some(entry) if entry.health != EndpointHealth::Healthy => {
                    let was_unhealthy = entry.health == EndpointHealth::Unhealthy;
                    entry.health = EndpointHealth::Healthy;
                    entry.last_failure = None;
                    was_unhealthy
                }
                _ => false,
            }
        };

        if changed {
            tracing::info!("endpoint {} is now healthy", endpoint.address);
            self.notify(&endpoint.address, true);
        }
    }

    fn notify(&self, address: &str, healthy: bool) {
        if let Some(callback) = &self.on_health_change {
            callback(address, healthy);
        }
    }

    /// Start the background probe loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(
        self: &Arc<Self>,
        transport: Arc<dyn RpcTransport>,
        shutdown: &ShutdownController,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let mut stop = shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(supervisor.config.probe_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        supervisor.probe_once(transport.as_ref()).await;
                    }
                    _ = stop.recv() => break,
                }
            }
            tracing::debug!("endpoint probe loop stopped");
        })
    }

    /// Probe every unhealthy endpoint whose cool-down has passed.
    pub async fn probe_once(&self, transport: &dyn RpcTransport) {
        let now = Instant::now();
        let due: Vec<Endpoint> = self
            .endpoints
            .read()
            .iter()
            .filter(|e| e.health == EndpointHealth::Unhealthy)
            .filter(|e| e.is_eligible(now, self.config.cooldown))
            .cloned()
            .collect();

        let session = SessionId::new();
        for endpoint in due {
            let request = RpcRequest::ExecuteQuery {
                database: endpoint.database.clone(),
                sql: "SELECT 1".to_string(),
                params: Params::new(),
            };
            let result = tokio::time::timeout(
                self.config.probe_timeout,
                transport.call(&endpoint, &session, request),
            )
            .await
            .unwrap_or(Err(Error::Timeout));

            match result {
                Ok(_) => self.report_success(&endpoint),
                Err(e) if e.is_transport() => {
                    tracing::debug!("probe of {} failed: {}", endpoint.address, e);
                    let _ = self.report_failure(&endpoint, &e.to_string());
                }
                // The server answered, so the endpoint is reachable
                Err(_) => self.report_success(&endpoint),
            }
        }
    }
}
