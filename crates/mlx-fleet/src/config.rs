//! Controller configuration.
//!
//! Loaded from a JSON file; every key has a compiled-in default and unknown
//! keys are ignored, so a missing or unreadable file degrades to the
//! documented defaults with a logged error rather than a refusal to start.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

/// Top-level controller configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Worker pool layout and spawn settings.
    pub mlx_servers: MlxServersConfig,
    /// Seconds between health-check sweeps.
    pub health_check_interval: u64,
    /// Seconds between performance-monitor ticks.
    pub performance_monitor_interval: u64,
    /// Restart budget per instance; at the cap the instance is terminally failed.
    pub max_restart_attempts: u32,
    /// Seconds since the last heartbeat below which a restart is skipped.
    pub restart_cooldown: u64,
    /// Dispatcher settings.
    pub load_balancer: LoadBalancerConfig,
    /// Proxy timeout and performance tuning targets.
    pub performance: PerformanceConfig,
}

/// Worker pool layout: N instances on `base_port + id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MlxServersConfig {
    /// Port of instance 0.
    pub base_port: u16,
    /// Number of worker instances.
    pub instances: usize,
    /// Host the workers bind to.
    pub host: String,
    /// Public port of the controller HTTP surface.
    pub load_balancer_port: u16,
    /// Command that launches one worker; per-instance flags are appended.
    pub worker_binary: String,
    /// Fixed arguments placed before the per-instance flags.
    pub worker_args: Vec<String>,
    /// Seconds a starting worker has to pass its first health probe.
    pub startup_timeout: u64,
    /// How many instances are started concurrently during fleet startup.
    pub start_batch_size: usize,
    /// `--batch-size` passed to each worker.
    pub worker_batch_size: u32,
    /// `--max-concurrent` passed to each worker.
    pub worker_max_concurrent: u32,
    /// `--quantization` passed to each worker.
    pub worker_quantization: String,
}

impl Default for MlxServersConfig {
    fn default() -> Self {
        Self {
            base_port: 8080,
            instances: 27,
            host: "localhost".to_string(),
            load_balancer_port: 8000,
            worker_binary: "python3".to_string(),
            worker_args: vec!["optimized_mlx_server.py".to_string()],
            startup_timeout: 600,
            start_batch_size: 3,
            worker_batch_size: 6,
            worker_max_concurrent: 12,
            worker_quantization: "none".to_string(),
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Seconds before a health probe is abandoned.
    pub health_check_timeout: u64,
    /// Per-instance circuit-breaker parameters.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Additional same-instance attempts after a failed proxy request.
    pub max_retries: u32,
    /// Initial per-instance worker batch size; the tuner adjusts it at runtime.
    pub max_batch_size: u32,
    /// Instance selection algorithm.
    pub algorithm: SelectionAlgorithm,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            health_check_timeout: 5,
            circuit_breaker: CircuitBreakerConfig::default(),
            max_retries: 2,
            max_batch_size: 8,
            algorithm: SelectionAlgorithm::Performance,
        }
    }
}

/// Circuit-breaker parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Initial consecutive-failure threshold (adapts within [3, 10] at runtime).
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before admitting a half-open probe.
    pub recovery_timeout: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: 60,
        }
    }
}

/// Proxy timeout and throughput targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Overall proxy timeout in milliseconds.
    pub request_timeout: u64,
    /// Tokens-per-second target an instance is scored against.
    pub target_tps: f64,
    /// Mean fleet score below which low performers are considered for restart.
    pub restart_score_floor: f64,
    /// Individual score below which a low-quartile instance is restarted.
    pub instance_score_floor: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            request_timeout: 180_000,
            target_tps: 1485.0,
            restart_score_floor: 70.0,
            instance_score_floor: 50.0,
        }
    }
}

/// Instance selection algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionAlgorithm {
    RoundRobin,
    LeastConnections,
    ResponseTime,
    Performance,
}

impl FleetConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing or unparsable file is logged and the compiled-in defaults
    /// are used — the controller keeps running either way.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<FleetConfig>(&raw) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(e) => {
                    error!(
                        path = %path.display(),
                        error = %e,
                        "failed to parse config, falling back to defaults"
                    );
                    FleetConfig::default()
                }
            },
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "failed to read config, falling back to defaults"
                );
                FleetConfig::default()
            }
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn performance_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.performance_monitor_interval)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.load_balancer.health_check_timeout)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.load_balancer.circuit_breaker.recovery_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.performance.request_timeout)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.mlx_servers.startup_timeout)
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            mlx_servers: MlxServersConfig::default(),
            health_check_interval: 15,
            performance_monitor_interval: 10,
            max_restart_attempts: 3,
            restart_cooldown: 60,
            load_balancer: LoadBalancerConfig::default(),
            performance: PerformanceConfig::default(),
        }
    }
}
