//! Per-worker instance state.
//!
//! One `Instance` exists per worker slot, created at startup and destroyed
//! only on controller shutdown. Mutation is partitioned by role:
//!
//! - the **supervisor** owns `lifecycle`, the process handle, and
//!   `restart_count`;
//! - the **health prober** owns the heartbeat timestamp and the
//!   `Starting -> Running` promotion;
//! - the **dispatcher** owns `in_flight`, the request totals, the latency
//!   and throughput windows, and breaker notifications during proxying.
//!
//! Counters are atomics and the remaining fields sit behind short-lived
//! locks, so status readers get per-instance-consistent snapshots that lag
//! a concurrent writer by at most one increment.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::process::Child;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::CircuitBreakerConfig;
use crate::metrics::{RequestTotals, SampleWindow};

/// Capacity of the per-instance latency ring (milliseconds).
pub const LATENCY_WINDOW: usize = 100;
/// Capacity of the per-instance throughput ring (tokens/sec samples).
pub const THROUGHPUT_WINDOW: usize = 10;

/// Lifecycle of a worker process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a worker listens.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

/// Metrics the worker reports about itself via its health endpoint.
/// Only these known fields are merged; anything else is ignored.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReportedMetrics {
    pub throughput_tokens_per_sec: f64,
    pub average_response_time: f64,
    pub memory_usage_mb: f64,
}

/// Fields guarded by the runtime lock.
#[derive(Debug)]
struct Runtime {
    lifecycle: LifecycleState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    last_heartbeat_at: Option<Instant>,
    last_used_at: Option<Instant>,
    restart_count: u32,
    reported: ReportedMetrics,
}

/// Dispatcher-owned observation windows.
#[derive(Debug)]
struct ObservationWindows {
    latency_ms: SampleWindow,
    throughput_tps: SampleWindow,
}

/// One worker slot.
pub struct Instance {
    pub id: usize,
    pub endpoint: Endpoint,
    target_tps: f64,
    runtime: Mutex<Runtime>,
    windows: Mutex<ObservationWindows>,
    breaker: Mutex<CircuitBreaker>,
    in_flight: AtomicU32,
    batch_size: AtomicU32,
    totals: RequestTotals,
    /// OS process handle; present only between a successful spawn and a stop.
    /// Held by the supervisor across its graceful-stop waits.
    pub(crate) process: tokio::sync::Mutex<Option<Child>>,
}

impl Instance {
    pub fn new(
        id: usize,
        endpoint: Endpoint,
        breaker_config: &CircuitBreakerConfig,
        target_tps: f64,
        initial_batch_size: u32,
    ) -> Self {
        Self {
            id,
            endpoint,
            target_tps,
            runtime: Mutex::new(Runtime {
                lifecycle: LifecycleState::Stopped,
                pid: None,
                started_at: None,
                last_heartbeat_at: None,
                last_used_at: None,
                restart_count: 0,
                reported: ReportedMetrics::default(),
            }),
            windows: Mutex::new(ObservationWindows {
                latency_ms: SampleWindow::new(LATENCY_WINDOW),
                throughput_tps: SampleWindow::new(THROUGHPUT_WINDOW),
            }),
            breaker: Mutex::new(CircuitBreaker::new(
                breaker_config.failure_threshold,
                std::time::Duration::from_secs(breaker_config.recovery_timeout),
            )),
            in_flight: AtomicU32::new(0),
            batch_size: AtomicU32::new(initial_batch_size),
            totals: RequestTotals::default(),
            process: tokio::sync::Mutex::new(None),
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().expect("instance runtime lock poisoned")
    }

    // -----------------------------------------------------------------------
    // Shared reads
    // -----------------------------------------------------------------------

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.runtime().lifecycle
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn restart_count(&self) -> u32 {
        self.runtime().restart_count
    }

    pub fn last_used_at(&self) -> Option<Instant> {
        self.runtime().last_used_at
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.runtime().last_heartbeat_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.runtime().pid
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size.load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> &RequestTotals {
        &self.totals
    }

    /// Mean of the latency window in milliseconds; 0 when empty.
    pub fn avg_latency_ms(&self) -> f64 {
        self.windows().latency_ms.mean()
    }

    /// Mean of the throughput window in tokens/sec; 0 when empty.
    pub fn current_tps(&self) -> f64 {
        self.windows().throughput_tps.mean()
    }

    /// Most recent throughput sample, if any.
    pub fn last_tps_sample(&self) -> Option<f64> {
        self.windows().throughput_tps.last()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker().state()
    }

    /// Whether the circuit breaker admits an attempt right now.
    /// May transition an open circuit to half-open.
    pub fn can_attempt(&self) -> bool {
        self.breaker().can_attempt()
    }

    /// Weighted composite score in [0, 100]. Non-running instances score 0.
    ///
    /// `0.40 * throughput + 0.25 * latency + 0.20 * success + 0.15 * load`,
    /// each component normalised to [0, 100].
    pub fn score(&self) -> f64 {
        if self.lifecycle_state() != LifecycleState::Running {
            return 0.0;
        }

        let throughput = (self.current_tps() / self.target_tps * 100.0).min(100.0);
        let latency = (100.0 - self.avg_latency_ms() / 100.0).max(0.0);
        let success = self.totals.success_rate() * 100.0;
        let load = (100.0 - self.in_flight() as f64 * 10.0).max(0.0);

        throughput * 0.40 + latency * 0.25 + success * 0.20 + load * 0.15
    }

    /// Consistent point-in-time view for status and metrics endpoints.
    pub fn snapshot(&self) -> InstanceSnapshot {
        let (status, pid, restart_count, reported, heartbeat_age, uptime) = {
            let runtime = self.runtime();
            (
                runtime.lifecycle,
                runtime.pid,
                runtime.restart_count,
                runtime.reported,
                runtime.last_heartbeat_at.map(|at| at.elapsed().as_secs()),
                runtime.started_at.map(|at| at.elapsed().as_secs()),
            )
        };

        InstanceSnapshot {
            id: self.id,
            status,
            port: self.endpoint.port,
            pid,
            performance_score: self.score(),
            restart_count,
            breaker_state: self.breaker_state().as_str(),
            metrics: InstanceMetrics {
                active_requests: self.in_flight(),
                total_requests: self.totals.requests(),
                successful_requests: self.totals.successes(),
                failed_requests: self.totals.failures(),
                tokens_processed: self.totals.tokens(),
                success_rate: self.totals.success_rate(),
                average_response_time_ms: self.avg_latency_ms(),
                throughput_tokens_per_sec: self.current_tps(),
                memory_usage_mb: reported.memory_usage_mb,
                batch_size: self.batch_size(),
                seconds_since_heartbeat: heartbeat_age,
                uptime_seconds: uptime,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Health-prober role
    // -----------------------------------------------------------------------

    /// Record a successful health probe: stamp the heartbeat and promote a
    /// `Starting` instance to `Running`.
    pub fn mark_healthy(&self) {
        let mut runtime = self.runtime();
        runtime.last_heartbeat_at = Some(Instant::now());
        if runtime.lifecycle == LifecycleState::Starting {
            runtime.lifecycle = LifecycleState::Running;
        }
    }

    /// Merge the numeric fields of a worker-reported `performance` object.
    /// Unknown fields are ignored.
    pub fn merge_reported(&self, performance: &serde_json::Value) {
        let mut runtime = self.runtime();
        if let Some(v) = performance
            .get("throughput_tokens_per_sec")
            .and_then(serde_json::Value::as_f64)
        {
            runtime.reported.throughput_tokens_per_sec = v;
        }
        if let Some(v) = performance
            .get("average_response_time")
            .and_then(serde_json::Value::as_f64)
        {
            runtime.reported.average_response_time = v;
        }
        if let Some(v) = performance
            .get("memory_usage_mb")
            .and_then(serde_json::Value::as_f64)
        {
            runtime.reported.memory_usage_mb = v;
        }
    }

    /// Record a failed attempt observed by the prober or dispatcher.
    pub fn record_breaker_failure(&self) {
        self.breaker().record_failure();
    }

    /// Record a successful attempt observed by the prober.
    pub fn record_breaker_success(&self) {
        self.breaker().record_success();
    }

    // -----------------------------------------------------------------------
    // Dispatcher role
    // -----------------------------------------------------------------------

    /// Increment `in_flight` before the outbound request is sent.
    pub fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement `in_flight` and stamp `last_used_at`. Called on every exit
    /// path of a proxied request, paired with [`Instance::begin_request`].
    pub fn end_request(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            });
        self.runtime().last_used_at = Some(Instant::now());
    }

    /// Account one proxied attempt that produced an HTTP response.
    ///
    /// Fixed update order: request counter, success/failure counter, breaker
    /// notification, then the latency and throughput window appends.
    pub fn record_response(&self, success: bool, latency_ms: f64, tps: f64, tokens: u64) {
        self.totals.record_request();
        if success {
            self.totals.record_success();
            self.breaker().record_success();
        } else {
            self.totals.record_failure();
            self.breaker().record_failure();
        }
        let mut windows = self.windows();
        windows.latency_ms.push(latency_ms);
        windows.throughput_tps.push(tps);
        drop(windows);
        self.totals.record_tokens(tokens);
    }

    /// Account one proxied attempt that failed before producing a response
    /// (connect error, timeout, undecodable body).
    pub fn record_attempt_error(&self) {
        self.totals.record_request();
        self.totals.record_failure();
        self.breaker().record_failure();
    }

    // -----------------------------------------------------------------------
    // Supervisor role
    // -----------------------------------------------------------------------

    pub fn mark_starting(&self) {
        let mut runtime = self.runtime();
        runtime.lifecycle = LifecycleState::Starting;
        runtime.started_at = Some(Instant::now());
    }

    pub fn mark_running(&self) {
        self.runtime().lifecycle = LifecycleState::Running;
    }

    pub fn mark_stopped(&self) {
        let mut runtime = self.runtime();
        runtime.lifecycle = LifecycleState::Stopped;
        runtime.pid = None;
    }

    pub fn mark_failed(&self) {
        let mut runtime = self.runtime();
        runtime.lifecycle = LifecycleState::Failed;
        runtime.pid = None;
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.runtime().pid = pid;
    }

    pub fn increment_restart_count(&self) -> u32 {
        let mut runtime = self.runtime();
        runtime.restart_count += 1;
        runtime.restart_count
    }

    // -----------------------------------------------------------------------
    // Tuner role
    // -----------------------------------------------------------------------

    /// Adjust the worker batch size within `[min, max]`.
    pub fn adjust_batch_size(&self, delta: i32, min: u32, max: u32) {
        let _ = self
            .batch_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let next = (current as i64 + delta as i64).clamp(min as i64, max as i64);
                Some(next as u32)
            });
    }

    fn windows(&self) -> MutexGuard<'_, ObservationWindows> {
        self.windows.lock().expect("instance windows lock poisoned")
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().expect("instance breaker lock poisoned")
    }
}

/// Serializable point-in-time view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: usize,
    pub status: LifecycleState,
    pub port: u16,
    pub pid: Option<u32>,
    pub performance_score: f64,
    pub restart_count: u32,
    pub breaker_state: &'static str,
    pub metrics: InstanceMetrics,
}

/// The metrics block of an [`InstanceSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetrics {
    pub active_requests: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub tokens_processed: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub throughput_tokens_per_sec: f64,
    pub memory_usage_mb: f64,
    pub batch_size: u32,
    pub seconds_since_heartbeat: Option<u64>,
    pub uptime_seconds: Option<u64>,
}
