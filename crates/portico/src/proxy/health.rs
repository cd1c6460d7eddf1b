//! Active backend health checking.
//!
//! One background worker per backend with a configured health path. Each
//! worker probes `GET {origin}{health_path}` on the configured interval
//! with a dedicated short-timeout client; a 2xx response marks the backend
//! healthy, anything else (including transport errors) marks it unhealthy.
//! Becoming healthy also resets the breaker to closed so recovered
//! backends rejoin selection immediately.

use crate::models::settings::HealthSettings;
use crate::proxy::backend::{Backend, BackendRegistry};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle over the spawned probe workers.
///
/// Dropping the handle does not stop the workers; call [`HealthChecker::shutdown`].
pub struct HealthChecker {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl HealthChecker {
    /// Spawns a probe worker for every backend that configures a health
    /// path. Backends without one stay optimistically alive and are
    /// governed by live-traffic breaker accounting only.
    pub fn spawn(registry: &BackendRegistry, settings: &HealthSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.timeout_seconds))
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .expect("Failed to create health check HTTP client");

        let interval = Duration::from_secs(settings.interval_seconds.max(1));
        let mut handles = Vec::new();

        for pool in registry.pools() {
            for backend in pool.backends() {
                if backend.health_path.is_none() {
                    continue;
                }
                let tenant = pool.name.clone();
                let backend = Arc::clone(backend);
                let client = client.clone();
                let rx = shutdown_rx.clone();
                handles.push(tokio::spawn(probe_loop(tenant, backend, client, interval, rx)));
            }
        }

        info!(
            "component=health event=workers_started count={}",
            handles.len()
        );

        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Signals every worker to stop and waits for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("component=health event=workers_stopped");
    }
}

async fn probe_loop(
    tenant: String,
    backend: Arc<Backend>,
    client: reqwest::Client,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let health_path = backend
        .health_path
        .clone()
        .expect("probe_loop requires a health path");
    let url = format!("{}{}", backend.origin(), health_path);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately, giving fresh liveness at startup.

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                probe_once(&tenant, &backend, &client, &url).await;
            }
        }
    }
}

async fn probe_once(tenant: &str, backend: &Backend, client: &reqwest::Client, url: &str) {
    let healthy = match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!(
                "component=health event=health_check_passed tenant={} backend={} status={}",
                tenant,
                backend.authority,
                resp.status().as_u16()
            );
            true
        }
        Ok(resp) => {
            debug!(
                "component=health event=health_check_failed tenant={} backend={} status={}",
                tenant,
                backend.authority,
                resp.status().as_u16()
            );
            false
        }
        Err(e) => {
            debug!(
                "component=health event=health_check_failed tenant={} backend={} error={:?}",
                tenant,
                backend.authority,
                e.to_string()
            );
            false
        }
    };

    let was_alive = backend.set_alive(healthy);
    if healthy && !was_alive {
        backend.breaker.reset();
        info!(
            "component=health event=backend_healthy tenant={} backend={}",
            tenant, backend.authority
        );
    } else if !healthy && was_alive {
        warn!(
            "component=health event=backend_unhealthy tenant={} backend={}",
            tenant, backend.authority
        );
    }
}
