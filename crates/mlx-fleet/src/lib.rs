//! Core of the MLX fleet controller.
//!
//! A fixed pool of local MLX inference workers, each listening on
//! `base_port + id`, is driven by two cooperating subsystems sharing one
//! instance-state store:
//!
//! - the [`supervisor::Supervisor`] owns worker process lifetimes: batched
//!   startup, readiness waits, graceful stop, and restarts bounded by a
//!   budget and cooldown;
//! - the [`dispatcher::Dispatcher`] owns client traffic: instance selection,
//!   reverse proxying with bounded same-instance retry, and the per-request
//!   observability counters.
//!
//! A periodic [`prober::HealthProber`] feeds both: probe outcomes drive the
//! per-instance circuit breakers and hand unhealthy running workers to the
//! supervisor. The HTTP surface lives in the `mlx-fleetd` binary crate.

pub mod breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod metrics;
pub mod prober;
pub mod store;
pub mod supervisor;
pub mod tuner;

pub use config::FleetConfig;
pub use dispatcher::{CompletionRoute, Dispatcher};
pub use error::{DispatchError, SupervisorError};
pub use instance::{Instance, LifecycleState};
pub use prober::HealthProber;
pub use store::InstanceStore;
pub use supervisor::Supervisor;
pub use tuner::PerformanceTuner;

use std::time::Duration;

/// Build the shared HTTP connection pool used for proxying and probing.
///
/// One long-lived client owned by the controller and injected into the
/// dispatcher, prober, and supervisor. Per-call deadlines are set at each
/// call site; only connection-level limits live here.
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .expect("failed to build HTTP client")
}
