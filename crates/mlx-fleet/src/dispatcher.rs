//! Reverse proxy: instance selection, forwarding, bounded retry.
//!
//! Accepts completion and chat-completion JSON bodies, forwards each to one
//! selected worker, and returns the worker's response augmented with a
//! small `_performance` annotation. Failed attempts are retried on the
//! *same* instance with exponential backoff — the selector already chose
//! the best candidate, and re-selection mid-request is deliberately not
//! done here.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{FleetConfig, SelectionAlgorithm};
use crate::error::DispatchError;
use crate::instance::{Instance, InstanceSnapshot, LifecycleState};
use crate::metrics::{AtomicF64, SampleWindow};
use crate::store::InstanceStore;

/// Capacity of the fleet-wide throughput window (one sample per monitor tick).
const GLOBAL_THROUGHPUT_WINDOW: usize = 60;

/// Tokens estimated per whitespace-separated word when the worker's
/// response carries no usage block.
const TOKENS_PER_WORD: f64 = 1.3;

/// The two proxied completion endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionRoute {
    Completions,
    ChatCompletions,
}

impl CompletionRoute {
    pub fn path(&self) -> &'static str {
        match self {
            CompletionRoute::Completions => "/v1/completions",
            CompletionRoute::ChatCompletions => "/v1/chat/completions",
        }
    }

    /// Rough token estimate from the request body, used only when the
    /// worker's response omits `usage.total_tokens`.
    pub fn estimate_tokens(&self, body: &Value) -> f64 {
        let words = match self {
            CompletionRoute::Completions => body
                .get("prompt")
                .and_then(Value::as_str)
                .map(|prompt| prompt.split_whitespace().count())
                .unwrap_or(0),
            CompletionRoute::ChatCompletions => body
                .get("messages")
                .and_then(Value::as_array)
                .map(|messages| {
                    messages
                        .iter()
                        .filter_map(|m| m.get("content").and_then(Value::as_str))
                        .map(|content| content.split_whitespace().count())
                        .sum()
                })
                .unwrap_or(0),
        };
        words as f64 * TOKENS_PER_WORD
    }
}

/// The client-facing reverse proxy.
pub struct Dispatcher {
    store: Arc<InstanceStore>,
    client: reqwest::Client,
    config: Arc<FleetConfig>,
    cancel: CancellationToken,
    started_at: Instant,
    global_throughput: Mutex<SampleWindow>,
    peak_throughput: AtomicF64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<InstanceStore>,
        client: reqwest::Client,
        config: Arc<FleetConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            client,
            config,
            cancel,
            started_at: Instant::now(),
            global_throughput: Mutex::new(SampleWindow::new(GLOBAL_THROUGHPUT_WINDOW)),
            peak_throughput: AtomicF64::new(0.0),
        }
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Pick the best eligible instance under the configured algorithm, or
    /// `None` when no instance is `Running` with a permitting breaker.
    pub fn select_instance(&self) -> Option<Arc<Instance>> {
        select_from(self.store.eligible(), self.config.load_balancer.algorithm)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Proxy one client request: select, forward with bounded same-instance
    /// retry, and annotate the successful response.
    pub async fn dispatch(
        &self,
        route: CompletionRoute,
        body: Vec<u8>,
    ) -> Result<Value, DispatchError> {
        let parsed: Value = serde_json::from_slice(&body)?;

        let Some(instance) = self.select_instance() else {
            error!("no healthy MLX instances available");
            return Err(DispatchError::NoHealthyInstances);
        };

        let estimated_tokens = route.estimate_tokens(&parsed);
        let url = instance.endpoint.url(route.path());
        let max_retries = self.config.load_balancer.max_retries;

        let mut result = self
            .forward_once(&instance, &url, &body, estimated_tokens)
            .await;

        for attempt in 0..max_retries {
            if result.is_ok() {
                break;
            }
            let delay = Duration::from_secs_f64(0.5 * 2f64.powi(attempt as i32));
            debug!(
                instance = instance.id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "retrying on same instance"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return result,
                _ = tokio::time::sleep(delay) => {}
            }
            result = self
                .forward_once(&instance, &url, &body, estimated_tokens)
                .await;
        }

        match result {
            Ok(value) => Ok(annotate(value, &instance)),
            Err(e) => {
                error!(instance = instance.id, error = %e, "request failed after retries");
                Err(e)
            }
        }
    }

    /// One forwarding attempt with full accounting on the instance.
    ///
    /// Counter order per attempt is fixed: request count, then success or
    /// failure, then the breaker, then the window appends.
    async fn forward_once(
        &self,
        instance: &Arc<Instance>,
        url: &str,
        body: &[u8],
        estimated_tokens: f64,
    ) -> Result<Value, DispatchError> {
        instance.begin_request();
        let started = Instant::now();

        let result = match self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body.to_vec())
            .timeout(self.config.request_timeout())
            .send()
            .await
        {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match resp.json::<Value>().await {
                    Ok(value) => {
                        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                        let tokens = value
                            .pointer("/usage/total_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or_else(|| estimated_tokens.round() as u64);
                        let tps = if latency_ms > 0.0 {
                            tokens as f64 / (latency_ms / 1000.0)
                        } else {
                            0.0
                        };
                        instance.record_response(status == 200, latency_ms, tps, tokens);

                        if status == 200 {
                            debug!(
                                instance = instance.id,
                                latency_ms,
                                tps,
                                "request completed"
                            );
                            Ok(value)
                        } else {
                            warn!(instance = instance.id, status, "worker returned error status");
                            Err(DispatchError::Upstream {
                                id: instance.id,
                                status,
                            })
                        }
                    }
                    Err(e) => {
                        instance.record_attempt_error();
                        Err(DispatchError::Decode {
                            id: instance.id,
                            source: e,
                        })
                    }
                }
            }
            Err(e) => {
                instance.record_attempt_error();
                if e.is_timeout() {
                    Err(DispatchError::UpstreamTimeout { id: instance.id })
                } else {
                    Err(DispatchError::Transport {
                        id: instance.id,
                        source: e,
                    })
                }
            }
        };

        instance.end_request();
        result
    }

    // -----------------------------------------------------------------------
    // Fleet-wide metrics
    // -----------------------------------------------------------------------

    /// Record one fleet-throughput sample. Called by the monitor tick.
    pub fn sample_global_throughput(&self) {
        let total_tokens: u64 = self.store.iter().map(|inst| inst.totals().tokens()).sum();
        let uptime = self.started_at.elapsed().as_secs_f64().max(1.0);
        self.global_window().push(total_tokens as f64 / uptime);

        let instantaneous: f64 = self
            .store
            .iter()
            .filter(|inst| inst.lifecycle_state() == LifecycleState::Running)
            .map(|inst| inst.current_tps())
            .sum();
        self.peak_throughput.store_max(instantaneous);
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn peak_throughput(&self) -> f64 {
        self.peak_throughput.load()
    }

    /// Counters and per-instance performance for `GET /metrics`.
    pub fn metrics_snapshot(&self) -> DispatcherMetrics {
        let instances = self.store.snapshots();
        let total_tokens: u64 = instances.iter().map(|s| s.metrics.tokens_processed).sum();
        let total_requests: u64 = instances.iter().map(|s| s.metrics.total_requests).sum();
        let healthy = instances
            .iter()
            .filter(|s| s.status == LifecycleState::Running)
            .count();

        let uptime = self.uptime_seconds().max(1.0);
        let current_throughput = total_tokens as f64 / uptime;
        let average_throughput = self.global_window().mean();
        let target = self.config.performance.target_tps;

        DispatcherMetrics {
            system: SystemMetrics {
                healthy_instances: healthy,
                total_instances: instances.len(),
                uptime_seconds: self.uptime_seconds(),
                total_tokens_processed: total_tokens,
                total_requests,
            },
            performance: ThroughputMetrics {
                current_throughput_tokens_per_sec: current_throughput,
                average_throughput_tokens_per_sec: average_throughput,
                target_throughput_tokens_per_sec: target,
                throughput_efficiency: if current_throughput > 0.0 {
                    current_throughput / target * 100.0
                } else {
                    0.0
                },
                peak_throughput_tokens_per_sec: self.peak_throughput(),
            },
            instances,
        }
    }

    fn global_window(&self) -> MutexGuard<'_, SampleWindow> {
        self.global_throughput
            .lock()
            .expect("global throughput lock poisoned")
    }
}

/// Apply one selection algorithm over the eligible set.
fn select_from(
    eligible: Vec<Arc<Instance>>,
    algorithm: SelectionAlgorithm,
) -> Option<Arc<Instance>> {
    match algorithm {
        SelectionAlgorithm::RoundRobin => eligible.into_iter().min_by(|a, b| {
            a.last_used_at()
                .cmp(&b.last_used_at())
                .then_with(|| b.score().total_cmp(&a.score()))
        }),
        SelectionAlgorithm::LeastConnections => eligible.into_iter().min_by(|a, b| {
            a.in_flight()
                .cmp(&b.in_flight())
                .then_with(|| b.score().total_cmp(&a.score()))
        }),
        SelectionAlgorithm::ResponseTime => eligible.into_iter().min_by(|a, b| {
            a.avg_latency_ms()
                .total_cmp(&b.avg_latency_ms())
                .then_with(|| b.current_tps().total_cmp(&a.current_tps()))
        }),
        SelectionAlgorithm::Performance => eligible
            .into_iter()
            .max_by(|a, b| a.score().total_cmp(&b.score())),
    }
}

/// Attach the `_performance` block to a successful worker response.
fn annotate(mut value: Value, instance: &Instance) -> Value {
    if let Value::Object(map) = &mut value {
        map.insert(
            "_performance".to_string(),
            serde_json::json!({
                "instance_id": instance.id,
                "response_time": instance.avg_latency_ms(),
                "throughput": instance.current_tps(),
                "active_requests": instance.in_flight(),
            }),
        );
    }
    value
}

/// `GET /metrics` payload.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherMetrics {
    pub system: SystemMetrics,
    pub performance: ThroughputMetrics,
    pub instances: Vec<InstanceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub healthy_instances: usize,
    pub total_instances: usize,
    pub uptime_seconds: f64,
    pub total_tokens_processed: u64,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputMetrics {
    pub current_throughput_tokens_per_sec: f64,
    pub average_throughput_tokens_per_sec: f64,
    pub target_throughput_tokens_per_sec: f64,
    pub throughput_efficiency: f64,
    pub peak_throughput_tokens_per_sec: f64,
}
