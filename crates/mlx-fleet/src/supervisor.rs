//! Worker-process lifecycle management.
//!
//! Starts, stops, and restarts the MLX worker processes. Enforces the
//! per-instance restart budget and cooldown, drives batched fleet startup,
//! and implements a terminate-then-kill shutdown protocol that gives each
//! worker a grace period before forceful termination. A periodic
//! performance monitor evicts degenerate workers without thrashing the
//! fleet.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::FleetConfig;
use crate::error::SupervisorError;
use crate::instance::{Instance, LifecycleState};
use crate::prober::probe_instance;
use crate::store::InstanceStore;

/// Delay between startup batches.
const BATCH_DELAY: Duration = Duration::from_secs(2);
/// How often a starting worker is re-probed.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Pause between stop and start during a restart, letting the port free up.
const RESTART_PAUSE: Duration = Duration::from_secs(2);
/// Grace period after terminate on the startup-deadline path.
const STARTUP_KILL_GRACE: Duration = Duration::from_secs(2);
/// Grace period after terminate during a normal stop.
const STOP_GRACE: Duration = Duration::from_secs(10);
/// Additional wait after a forceful kill.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Stagger between performance-driven restarts.
const RESTART_STAGGER: Duration = Duration::from_secs(5);

/// Outcome of a restart request that was not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The worker was stopped and started again.
    Restarted,
    /// The last heartbeat is too recent; this cycle was skipped.
    SkippedCooldown,
}

/// Owns each worker process's lifetime.
pub struct Supervisor {
    store: Arc<InstanceStore>,
    config: Arc<FleetConfig>,
    client: reqwest::Client,
    /// Serializes fleet-wide start/stop, including concurrent HTTP control
    /// requests.
    control_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        store: Arc<InstanceStore>,
        config: Arc<FleetConfig>,
        client: reqwest::Client,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            client,
            control_lock: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    // -----------------------------------------------------------------------
    // Fleet-wide operations
    // -----------------------------------------------------------------------

    /// Start every instance, in batches, waiting between batches to bound
    /// concurrent model-load cost.
    pub async fn start_all(&self) {
        let _guard = self.control_lock.lock().await;
        info!(
            instances = self.store.len(),
            batch_size = self.config.mlx_servers.start_batch_size,
            "starting all MLX worker instances"
        );

        let instances: Vec<Arc<Instance>> = self.store.iter().cloned().collect();
        let batch_size = self.config.mlx_servers.start_batch_size.max(1);
        let batches = instances.chunks(batch_size).count();

        for (index, batch) in instances.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                warn!("fleet startup interrupted by shutdown");
                return;
            }

            let starts = batch.iter().map(|inst| async move {
                if let Err(e) = self.start_instance(inst).await {
                    error!(instance = inst.id, error = %e, "instance failed to start");
                }
            });
            futures::future::join_all(starts).await;

            if index + 1 < batches {
                tokio::time::sleep(BATCH_DELAY).await;
            }
        }

        info!("fleet startup complete");
    }

    /// Stop every instance in parallel. Used for `/stop` and on controller
    /// shutdown.
    pub async fn stop_all(&self) {
        let _guard = self.control_lock.lock().await;
        info!(instances = self.store.len(), "stopping all MLX worker instances");

        let stops = self.store.iter().map(|inst| self.stop_instance(inst));
        futures::future::join_all(stops).await;

        info!("all workers stopped");
    }

    // -----------------------------------------------------------------------
    // Single-instance operations
    // -----------------------------------------------------------------------

    /// Start one worker and wait for it to become healthy.
    pub async fn start_instance(&self, instance: &Arc<Instance>) -> Result<(), SupervisorError> {
        match instance.lifecycle_state() {
            LifecycleState::Stopped | LifecycleState::Failed => {}
            state => {
                warn!(
                    instance = instance.id,
                    state = %state,
                    "start requested but instance is not startable"
                );
                return Ok(());
            }
        }

        instance.mark_starting();

        let child = match self.spawn_worker(instance) {
            Ok(child) => child,
            Err(e) => {
                error!(instance = instance.id, error = %e, "failed to spawn worker");
                instance.mark_failed();
                return Err(SupervisorError::Spawn {
                    id: instance.id,
                    source: e,
                });
            }
        };

        let pid = child.id();
        instance.set_pid(pid);
        *instance.process.lock().await = Some(child);
        info!(
            instance = instance.id,
            port = instance.endpoint.port,
            pid,
            "worker spawned"
        );

        // Poll health until the worker answers or the deadline passes.
        let deadline = self.config.startup_timeout();
        let started = Instant::now();
        while started.elapsed() < deadline && !self.cancel.is_cancelled() {
            if probe_instance(&self.client, instance, self.config.health_check_timeout()).await {
                // The probe promoted Starting -> Running and stamped the
                // heartbeat.
                info!(instance = instance.id, "worker is healthy and running");
                return Ok(());
            }
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }

        let deadline_secs = deadline.as_secs();
        error!(
            instance = instance.id,
            deadline_secs, "worker failed to become healthy before deadline"
        );
        instance.mark_failed();
        self.reap_failed_startup(instance).await;
        Err(SupervisorError::StartupTimeout {
            id: instance.id,
            deadline_secs,
        })
    }

    /// Stop one worker: terminate, wait up to 10 s, kill and wait up to 5 s
    /// if it will not exit. The instance ends `Stopped` either way.
    pub async fn stop_instance(&self, instance: &Arc<Instance>) {
        let mut guard = instance.process.lock().await;
        if let Some(mut child) = guard.take() {
            info!(instance = instance.id, pid = child.id(), "stopping worker");

            send_terminate(&mut child);
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(
                        instance = instance.id,
                        code = status.code(),
                        "worker exited gracefully"
                    );
                }
                Ok(Err(e)) => {
                    warn!(instance = instance.id, error = %e, "error waiting for worker");
                }
                Err(_) => {
                    warn!(
                        instance = instance.id,
                        grace_secs = STOP_GRACE.as_secs(),
                        "worker did not exit within grace period, killing"
                    );
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                }
            }
        }
        drop(guard);

        instance.mark_stopped();
    }

    /// Restart one worker, enforcing the budget and cooldown.
    pub async fn restart_instance(
        &self,
        instance: &Arc<Instance>,
    ) -> Result<RestartOutcome, SupervisorError> {
        if instance.restart_count() >= self.config.max_restart_attempts {
            error!(
                instance = instance.id,
                attempts = instance.restart_count(),
                "restart budget exhausted"
            );
            instance.mark_failed();
            return Err(SupervisorError::BudgetExceeded {
                id: instance.id,
                attempts: instance.restart_count(),
            });
        }

        if let Some(heartbeat) = instance.last_heartbeat_at() {
            if heartbeat.elapsed() < self.config.restart_cooldown() {
                info!(instance = instance.id, "restart skipped: within cooldown");
                return Ok(RestartOutcome::SkippedCooldown);
            }
        }

        let attempt = instance.increment_restart_count();
        info!(instance = instance.id, attempt, "restarting worker");

        self.stop_instance(instance).await;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start_instance(instance).await?;

        Ok(RestartOutcome::Restarted)
    }

    // -----------------------------------------------------------------------
    // Performance-driven restarts
    // -----------------------------------------------------------------------

    /// Run the performance monitor until the cancellation token fires.
    pub async fn run_performance_monitor(&self, cancel: CancellationToken) {
        let interval = self.config.performance_monitor_interval();
        info!(
            interval_secs = interval.as_secs(),
            "performance monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("performance monitor shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    self.performance_tick().await;
                }
            }
        }
    }

    /// One monitor tick: log a fleet summary, and when the mean score is
    /// low, restart the worst of the lowest quartile with a stagger.
    pub async fn performance_tick(&self) {
        let running = self.store.in_state(LifecycleState::Running);
        if running.is_empty() {
            return;
        }

        let mut scored: Vec<(f64, Arc<Instance>)> =
            running.iter().map(|inst| (inst.score(), inst.clone())).collect();
        let mean = scored.iter().map(|(s, _)| *s).sum::<f64>() / scored.len() as f64;
        let total_tps: f64 = running.iter().map(|inst| inst.current_tps()).sum();

        info!(
            running = running.len(),
            mean_score = mean,
            total_tps,
            "fleet performance summary"
        );

        if mean >= self.config.performance.restart_score_floor {
            return;
        }
        warn!(mean_score = mean, "low average fleet performance");

        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        let quartile = (scored.len() / 4).max(1);

        for (score, inst) in scored.into_iter().take(quartile) {
            if self.cancel.is_cancelled() {
                return;
            }
            if score < self.config.performance.instance_score_floor {
                info!(
                    instance = inst.id,
                    score,
                    "restarting low-performing instance"
                );
                if let Err(e) = self.restart_instance(&inst).await {
                    warn!(instance = inst.id, error = %e, "performance restart failed");
                }
                tokio::time::sleep(RESTART_STAGGER).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Process plumbing
    // -----------------------------------------------------------------------

    /// Spawn the worker binary with flags derived from configuration.
    /// The child's stdout/stderr are discarded.
    fn spawn_worker(&self, instance: &Instance) -> std::io::Result<Child> {
        let workers = &self.config.mlx_servers;
        Command::new(&workers.worker_binary)
            .args(&workers.worker_args)
            .arg("--port")
            .arg(instance.endpoint.port.to_string())
            .arg("--instance-id")
            .arg(instance.id.to_string())
            .arg("--batch-size")
            .arg(workers.worker_batch_size.to_string())
            .arg("--max-concurrent")
            .arg(workers.worker_max_concurrent.to_string())
            .arg("--quantization")
            .arg(&workers.worker_quantization)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
    }

    /// Clean up the process of a worker that missed its startup deadline:
    /// terminate, wait 2 s, kill if still alive.
    async fn reap_failed_startup(&self, instance: &Instance) {
        let mut guard = instance.process.lock().await;
        if let Some(mut child) = guard.take() {
            send_terminate(&mut child);
            if tokio::time::timeout(STARTUP_KILL_GRACE, child.wait())
                .await
                .is_err()
            {
                let _ = child.kill().await;
            }
        }
    }
}

/// Ask a worker to exit. SIGTERM on Unix (the worker contract promises exit
/// within 10 s); the runtime's kill signal elsewhere.
fn send_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(
        instances: usize,
        mutate: impl FnOnce(&mut FleetConfig),
    ) -> (Arc<InstanceStore>, Supervisor) {
        let mut config = FleetConfig::default();
        config.mlx_servers.instances = instances;
        config.mlx_servers.base_port = 18080;
        // Workers in tests are stand-in shell commands; they never become
        // healthy, so the deadline is zero to fail fast.
        config.mlx_servers.worker_binary = "sh".to_string();
        config.mlx_servers.worker_args = vec!["-c".to_string(), "exit 0".to_string()];
        config.mlx_servers.startup_timeout = 0;
        config.restart_cooldown = 0;
        mutate(&mut config);

        let config = Arc::new(config);
        let store = Arc::new(InstanceStore::new(&config));
        let supervisor = Supervisor::new(
            store.clone(),
            config,
            reqwest::Client::new(),
            CancellationToken::new(),
        );
        (store, supervisor)
    }

    #[tokio::test]
    async fn test_start_is_noop_when_running() {
        let (store, supervisor) = setup(1, |_| {});
        let inst = store.get(0).unwrap();
        inst.mark_starting();
        inst.mark_running();

        assert!(supervisor.start_instance(inst).await.is_ok());
        assert_eq!(inst.lifecycle_state(), LifecycleState::Running);
        assert!(inst.process.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_error_marks_failed_without_retry() {
        let (store, supervisor) = setup(1, |config| {
            config.mlx_servers.worker_binary = "/nonexistent/mlx-worker-binary".to_string();
            config.mlx_servers.worker_args = vec![];
        });
        let inst = store.get(0).unwrap();

        let err = supervisor.start_instance(inst).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { id: 0, .. }));
        assert_eq!(inst.lifecycle_state(), LifecycleState::Failed);
        assert!(inst.pid().is_none());
    }

    #[tokio::test]
    async fn test_startup_deadline_marks_failed_and_reaps() {
        let (store, supervisor) = setup(1, |config| {
            config.mlx_servers.worker_args = vec!["-c".to_string(), "sleep 300".to_string()];
        });
        let inst = store.get(0).unwrap();

        let err = supervisor.start_instance(inst).await.unwrap_err();
        assert!(matches!(err, SupervisorError::StartupTimeout { id: 0, .. }));
        assert_eq!(inst.lifecycle_state(), LifecycleState::Failed);
        assert!(inst.process.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_without_process_still_marks_stopped() {
        let (store, supervisor) = setup(1, |_| {});
        let inst = store.get(0).unwrap();
        inst.mark_starting();
        inst.mark_running();

        supervisor.stop_instance(inst).await;
        assert_eq!(inst.lifecycle_state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_terminates_running_worker() {
        let (store, supervisor) = setup(1, |_| {});
        let inst = store.get(0).unwrap();

        // Install a long-lived child directly; the HTTP health handshake is
        // out of scope here.
        let child = Command::new("sh")
            .args(["-c", "sleep 300"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn test child");
        inst.set_pid(child.id());
        *inst.process.lock().await = Some(child);
        inst.mark_starting();
        inst.mark_running();

        supervisor.stop_instance(inst).await;
        assert_eq!(inst.lifecycle_state(), LifecycleState::Stopped);
        assert!(inst.pid().is_none());
        assert!(inst.process.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_all_leaves_fleet_stopped() {
        let (store, supervisor) = setup(3, |_| {});
        for inst in store.iter() {
            inst.mark_starting();
            inst.mark_running();
        }

        supervisor.stop_all().await;
        for inst in store.iter() {
            assert_eq!(inst.lifecycle_state(), LifecycleState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_restart_refused_once_budget_is_spent() {
        let (store, supervisor) = setup(1, |config| {
            config.max_restart_attempts = 2;
        });
        let inst = store.get(0).unwrap();
        inst.increment_restart_count();
        inst.increment_restart_count();

        let err = supervisor.restart_instance(inst).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::BudgetExceeded { id: 0, attempts: 2 }
        ));
        assert_eq!(inst.lifecycle_state(), LifecycleState::Failed);
        // The budget counter does not grow past the cap.
        assert_eq!(inst.restart_count(), 2);
    }

    #[tokio::test]
    async fn test_restart_skipped_within_cooldown() {
        let (store, supervisor) = setup(1, |config| {
            config.restart_cooldown = 60;
        });
        let inst = store.get(0).unwrap();
        inst.mark_starting();
        inst.mark_healthy(); // stamps a fresh heartbeat

        let outcome = supervisor.restart_instance(inst).await.unwrap();
        assert_eq!(outcome, RestartOutcome::SkippedCooldown);
        assert_eq!(inst.restart_count(), 0);
        assert_eq!(inst.lifecycle_state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion_is_sticky() {
        // A worker that exits immediately: each restart cycle fails its
        // startup, and after the budget is spent the instance stays Failed.
        let (store, supervisor) = setup(1, |config| {
            config.max_restart_attempts = 2;
        });
        let inst = store.get(0).unwrap();
        inst.mark_failed();

        for expected in 1..=2u32 {
            let result = supervisor.restart_instance(inst).await;
            assert!(matches!(
                result,
                Err(SupervisorError::StartupTimeout { .. })
            ));
            assert_eq!(inst.restart_count(), expected);
            assert_eq!(inst.lifecycle_state(), LifecycleState::Failed);
        }

        // The third attempt is refused outright.
        let err = supervisor.restart_instance(inst).await.unwrap_err();
        assert!(matches!(err, SupervisorError::BudgetExceeded { .. }));
        assert_eq!(inst.restart_count(), 2);
        assert_eq!(inst.lifecycle_state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_performance_tick_ignores_healthy_fleet() {
        let (store, supervisor) = setup(2, |_| {});
        for inst in store.iter() {
            inst.mark_starting();
            inst.mark_running();
            // A clean instance with no traffic scores 60 and an artificially
            // high-throughput one scores higher; keep the mean above the floor.
            inst.record_response(true, 1.0, 10_000.0, 100);
        }

        supervisor.performance_tick().await;
        for inst in store.iter() {
            assert_eq!(inst.restart_count(), 0);
            assert_eq!(inst.lifecycle_state(), LifecycleState::Running);
        }
    }
}
