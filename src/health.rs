//! Background Health Monitoring
//!
//! A single tokio task probes every registered instance on a fixed interval.
//! Each cycle fans out one probe per instance concurrently and fans in before
//! the next tick, so one slow backend delays the cycle but never overlaps it.
//! Probe errors are absorbed here as failures; they never surface to request
//! callers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientFactory;
use crate::instance::Instance;
use crate::scheduler::InstanceRegistry;

/// Drives the probe loop over a registry.
pub struct HealthMonitor {
    registry: Arc<InstanceRegistry>,
    clients: Arc<dyn ClientFactory>,
    interval: Duration,
}

impl HealthMonitor {
    /// Build a monitor over the registry with the given probe interval.
    #[must_use]
    pub fn new(
        registry: Arc<InstanceRegistry>,
        clients: Arc<dyn ClientFactory>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            clients,
            interval,
        }
    }

    /// Start the background probe loop.
    pub fn spawn(self) -> HealthMonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so instances start
            // from their configured state rather than an instant probe.
            ticker.tick().await;
            info!(interval_ms = self.interval.as_millis() as u64, "health monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_all().await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("health monitor stopping");
                        break;
                    }
                }
            }
        });
        HealthMonitorHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// One probe cycle across every instance, concurrently.
    async fn check_all(&self) {
        let instances = self.registry.all();
        let probes = instances
            .iter()
            .map(|inst| self.probe_one(inst.clone()));
        join_all(probes).await;
        debug!(count = instances.len(), "probe cycle complete");
    }

    async fn probe_one(&self, instance: Arc<Instance>) {
        let healthy = match self.clients.get_or_create(&instance.id).await {
            Ok(client) => client.health_probe().await,
            Err(err) => {
                warn!(instance = %instance.id, error = %err, "probe client unavailable");
                false
            }
        };
        if healthy {
            instance.probe_succeeded();
        } else {
            instance.probe_failed();
        }
    }
}

/// Handle to a running monitor. Dropping it without `stop` leaves the task
/// running until the runtime shuts down.
pub struct HealthMonitorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HealthMonitorHandle {
    /// Signal the loop to stop and wait for it to finish its current cycle.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "health monitor task ended abnormally");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
