//! HTTP health-check loop.
//!
//! Probes every `Running` or `Starting` instance's `/health` endpoint each
//! tick, with a semaphore bounding concurrent probes. Probe outcomes feed
//! the per-instance circuit breaker; a `Running` instance that fails its
//! probe is handed to the supervisor as a restart candidate, where the
//! restart budget and cooldown are enforced.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::instance::{Instance, LifecycleState};
use crate::store::InstanceStore;
use crate::supervisor::Supervisor;

/// Upper bound on concurrent health probes.
pub const PROBE_CONCURRENCY: usize = 5;

/// The periodic health prober.
pub struct HealthProber {
    store: Arc<InstanceStore>,
    supervisor: Arc<Supervisor>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
}

impl HealthProber {
    pub fn new(
        store: Arc<InstanceStore>,
        supervisor: Arc<Supervisor>,
        client: reqwest::Client,
        config: &FleetConfig,
    ) -> Self {
        Self {
            store,
            supervisor,
            client,
            interval: config.health_check_interval(),
            timeout: config.health_check_timeout(),
            semaphore: Arc::new(Semaphore::new(PROBE_CONCURRENCY)),
        }
    }

    /// Run the probe loop until the cancellation token fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "health prober started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("health prober shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Probe every probeable instance once and hand failures to the
    /// supervisor. Returns the number of healthy instances.
    pub async fn sweep(&self) -> usize {
        let candidates: Vec<Arc<Instance>> = self
            .store
            .iter()
            .filter(|inst| {
                matches!(
                    inst.lifecycle_state(),
                    LifecycleState::Running | LifecycleState::Starting
                )
            })
            .cloned()
            .collect();

        let checks = candidates.iter().map(|inst| {
            let semaphore = self.semaphore.clone();
            let client = self.client.clone();
            let timeout = self.timeout;
            let inst = inst.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("probe semaphore closed");
                let healthy = probe_instance(&client, &inst, timeout).await;
                (inst, healthy)
            }
        });

        let results = futures::future::join_all(checks).await;
        let healthy = results.iter().filter(|(_, ok)| *ok).count();
        info!(
            healthy,
            total = self.store.len(),
            "health check sweep complete"
        );

        // Unhealthy running instances become restart candidates; the
        // supervisor applies its own cooldown and budget.
        for (inst, ok) in results {
            if !ok && inst.lifecycle_state() == LifecycleState::Running {
                warn!(instance = inst.id, "instance unhealthy, handing to supervisor");
                if let Err(e) = self.supervisor.restart_instance(&inst).await {
                    warn!(instance = inst.id, error = %e, "restart attempt failed");
                }
            }
        }

        healthy
    }
}

/// Probe a single instance's `/health` endpoint.
///
/// A 200 response counts as success: the heartbeat is stamped, a `Starting`
/// instance is promoted to `Running`, and any `performance` object in the
/// body is merged into the instance's reported metrics. Every outcome is
/// recorded on the circuit breaker.
pub async fn probe_instance(
    client: &reqwest::Client,
    instance: &Instance,
    timeout: Duration,
) -> bool {
    let url = instance.endpoint.url("/health");

    match client.get(&url).timeout(timeout).send().await {
        Ok(resp) if resp.status().as_u16() == 200 => {
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                if let Some(performance) = body.get("performance") {
                    instance.merge_reported(performance);
                }
            }
            instance.mark_healthy();
            instance.record_breaker_success();
            true
        }
        Ok(resp) => {
            debug!(
                instance = instance.id,
                status = resp.status().as_u16(),
                "health probe returned non-success status"
            );
            instance.record_breaker_failure();
            false
        }
        Err(e) => {
            debug!(instance = instance.id, error = %e, "health probe failed");
            instance.record_breaker_failure();
            false
        }
    }
}
